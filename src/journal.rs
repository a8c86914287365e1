//! Event journal abstraction and the in-memory backend.
//!
//! A journal stores one ordered stream of [`SerializedEvent`]s per
//! [`StreamId`]. Appends are whole batches: every event in a batch becomes
//! visible together or not at all, and a batch must start right after the
//! stream head with gap-free sequence numbers.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::JournalError;
use crate::event::SerializedEvent;

/// Partition key of an event stream: aggregate (or saga) name plus identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    aggregate_name: String,
    identity: String,
}

impl StreamId {
    /// Build a stream id.
    pub fn new(aggregate_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            aggregate_name: aggregate_name.into(),
            identity: identity.into(),
        }
    }

    /// The aggregate or saga name.
    pub fn aggregate_name(&self) -> &str {
        &self.aggregate_name
    }

    /// The identity value.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_name, self.identity)
    }
}

/// Durable, append-only storage for event streams.
#[async_trait]
pub trait EventJournal: Send + Sync + fmt::Debug {
    /// Append `events` atomically to `stream`.
    ///
    /// # Errors
    ///
    /// * [`JournalError::SequenceConflict`] if the first sequence number is
    ///   not the stream head + 1 or the batch has gaps.
    /// * Any backend error; nothing from the batch is visible afterwards.
    async fn append(&self, stream: &StreamId, events: Vec<SerializedEvent>)
    -> Result<(), JournalError>;

    /// Read every event of `stream` with a sequence number greater than
    /// `after`, in sequence order. Unknown streams are empty.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the stream cannot be read.
    async fn read_from(
        &self,
        stream: &StreamId,
        after: u64,
    ) -> Result<Vec<SerializedEvent>, JournalError>;
}

/// Validate that `events` can be appended to a stream whose head is `head`.
///
/// Empty batches are accepted.
///
/// # Errors
///
/// [`JournalError::SequenceConflict`] naming the first offending position.
pub fn check_batch(
    stream: &StreamId,
    head: u64,
    events: &[SerializedEvent],
) -> Result<(), JournalError> {
    let mut expected = head + 1;
    for event in events {
        if event.sequence_number != expected {
            return Err(JournalError::SequenceConflict {
                stream: stream.to_string(),
                expected,
                actual: event.sequence_number,
            });
        }
        expected += 1;
    }
    Ok(())
}

/// Journal that keeps every stream in memory. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    streams: RwLock<HashMap<StreamId, Vec<SerializedEvent>>>,
}

impl InMemoryJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventJournal for InMemoryJournal {
    async fn append(
        &self,
        stream: &StreamId,
        events: Vec<SerializedEvent>,
    ) -> Result<(), JournalError> {
        let mut streams = self.streams.write().await;
        let existing = streams.entry(stream.clone()).or_default();
        let head = existing.last().map_or(0, |e| e.sequence_number);
        check_batch(stream, head, &events)?;
        existing.extend(events);
        Ok(())
    }

    async fn read_from(
        &self,
        stream: &StreamId,
        after: u64,
    ) -> Result<Vec<SerializedEvent>, JournalError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence_number > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::event::SerializedEvent;
    use crate::metadata::EventMetadata;

    /// A bare journal record at `seq`.
    pub(crate) fn record(seq: u64) -> SerializedEvent {
        SerializedEvent {
            sequence_number: seq,
            event_name: "ItemAdded".into(),
            event_version: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            metadata: EventMetadata::default(),
            payload: json!({ "name": format!("item-{seq}") }),
        }
    }
}
