//! Snapshot store abstraction and the in-memory backend.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::SnapshotStoreError;
use crate::journal::StreamId;
use crate::snapshot::SerializedSnapshot;

/// Storage for snapshots, several per stream, keyed by captured version.
#[async_trait]
pub trait SnapshotStore: Send + Sync + fmt::Debug {
    /// Persist `snapshot`, replacing any snapshot at the same version.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the snapshot could not be written.
    async fn save(
        &self,
        stream: &StreamId,
        snapshot: SerializedSnapshot,
    ) -> Result<(), SnapshotStoreError>;

    /// The snapshot with the highest version, if any.
    ///
    /// # Errors
    ///
    /// Returns a backend error for unexpected read failures. Unreadable
    /// snapshots are backend-specific; the file store treats them as absent.
    async fn load_latest(
        &self,
        stream: &StreamId,
    ) -> Result<Option<SerializedSnapshot>, SnapshotStoreError>;

    /// Delete every snapshot at or below `sequence_number`. Best effort.
    ///
    /// # Errors
    ///
    /// Returns a backend error if deletion failed.
    async fn delete_up_to(
        &self,
        stream: &StreamId,
        sequence_number: u64,
    ) -> Result<(), SnapshotStoreError>;
}

/// Snapshot store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<StreamId, BTreeMap<u64, SerializedSnapshot>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Versions currently held for `stream`, ascending.
    pub async fn versions(&self, stream: &StreamId) -> Vec<u64> {
        let snapshots = self.snapshots.read().await;
        snapshots
            .get(stream)
            .map(|by_version| by_version.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(
        &self,
        stream: &StreamId,
        snapshot: SerializedSnapshot,
    ) -> Result<(), SnapshotStoreError> {
        let mut snapshots = self.snapshots.write().await;
        snapshots
            .entry(stream.clone())
            .or_default()
            .insert(snapshot.sequence_number, snapshot);
        Ok(())
    }

    async fn load_latest(
        &self,
        stream: &StreamId,
    ) -> Result<Option<SerializedSnapshot>, SnapshotStoreError> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots
            .get(stream)
            .and_then(|by_version| by_version.last_key_value())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    async fn delete_up_to(
        &self,
        stream: &StreamId,
        sequence_number: u64,
    ) -> Result<(), SnapshotStoreError> {
        let mut snapshots = self.snapshots.write().await;
        if let Some(by_version) = snapshots.get_mut(stream) {
            by_version.retain(|&version, _| version > sequence_number);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SnapshotMetadata;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn snapshot(seq: u64) -> SerializedSnapshot {
        SerializedSnapshot {
            sequence_number: seq,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            metadata: SnapshotMetadata {
                aggregate_sequence_number: seq,
                snapshot_name: "List".into(),
                snapshot_version: 1,
                ..SnapshotMetadata::default()
            },
            payload: json!({ "items": [] }),
        }
    }

    #[tokio::test]
    async fn load_latest_returns_highest_version() {
        let store = InMemorySnapshotStore::new();
        let stream = StreamId::new("list", "l-1");
        store.save(&stream, snapshot(3)).await.unwrap();
        store.save(&stream, snapshot(6)).await.unwrap();

        let latest = store.load_latest(&stream).await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 6);
    }

    #[tokio::test]
    async fn delete_up_to_keeps_newer_snapshots() {
        let store = InMemorySnapshotStore::new();
        let stream = StreamId::new("list", "l-1");
        for seq in [2, 4, 6] {
            store.save(&stream, snapshot(seq)).await.unwrap();
        }

        store.delete_up_to(&stream, 4).await.unwrap();
        assert_eq!(store.versions(&stream).await, vec![6]);
    }

    #[tokio::test]
    async fn missing_stream_has_no_snapshot() {
        let store = InMemorySnapshotStore::new();
        let latest = store
            .load_latest(&StreamId::new("list", "none"))
            .await
            .unwrap();
        assert!(latest.is_none());
    }
}
