//! The host state machine shared by aggregates and sagas.
//!
//! A [`Host`] owns one identity's state exclusively. It is built by
//! [`Host::recover`] (snapshot, then every later event, no notifications)
//! and only then accepts live batches through [`Host::commit`], which
//! persists a batch before folding it, publishes a notification per folded
//! event, and consults the snapshot strategy.

use std::sync::Arc;

use crate::aggregate::Emission;
use crate::apply::ApplyMethods;
use crate::clock::Clock;
use crate::definitions::Definitions;
use crate::error::{
    ApplyError, DefinitionError, ExecuteError, InvariantError, JournalError, RecoveryError,
};
use crate::event::{AnyDomainEvent, CommittedEvent, SerializedEvent};
use crate::identity::{Identity, SourceId};
use crate::journal::{EventJournal, StreamId};
use crate::metadata::{EventMetadata, SnapshotMetadata, TIMESTAMP_EPOCH_KEY, event_id};
use crate::snapshot::{AnySnapshot, CommittedSnapshot, SerializedSnapshot};
use crate::snapshot_store::SnapshotStore;
use crate::source_ids::SourceIdHistory;
use crate::strategy::{SnapshotContext, SnapshotStrategy};
use crate::subscribers::EventStream;

/// Store-wide collaborators every host uses.
#[derive(Debug)]
pub(crate) struct HostRuntime {
    pub(crate) journal: Arc<dyn EventJournal>,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) definitions: Arc<Definitions>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventStream,
}

/// Per-type settings, identical for every host of one aggregate or saga type.
pub(crate) struct HostConfig<S> {
    pub(crate) name: &'static str,
    pub(crate) apply: Arc<ApplyMethods<S>>,
    pub(crate) strategy: Arc<dyn SnapshotStrategy>,
    pub(crate) create_snapshot: fn(&S) -> Option<Box<dyn AnySnapshot>>,
    pub(crate) source_id_history: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostStatus {
    Recovering,
    Ready,
}

/// Why a live batch did not fully commit.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CommitError {
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

impl<E: std::error::Error + Send + Sync + 'static> From<CommitError> for ExecuteError<E> {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Journal(e) => Self::Persistence(e),
            CommitError::Apply(e) => Self::Apply(e),
            CommitError::Definition(e) => Self::Definition(e),
            CommitError::Invariant(e) => Self::Invariant(e),
        }
    }
}

/// One identity's state, version and de-duplication history.
pub(crate) struct Host<S, I> {
    identity: I,
    stream: StreamId,
    state: S,
    version: u64,
    events_since_snapshot: u64,
    status: HostStatus,
    source_ids: SourceIdHistory,
    config: HostConfig<S>,
    runtime: Arc<HostRuntime>,
}

impl<S: Default + Send + Sync + 'static, I: Identity> Host<S, I> {
    /// Rebuild the host for `identity` from its snapshot and journal.
    ///
    /// Replayed events are folded without publishing and without consulting
    /// the snapshot strategy; their source ids are re-recorded.
    ///
    /// # Errors
    ///
    /// Any read, decode, fold or contiguity failure. The host never becomes
    /// ready in that case.
    pub(crate) async fn recover(
        identity: I,
        config: HostConfig<S>,
        runtime: Arc<HostRuntime>,
    ) -> Result<Self, RecoveryError> {
        let stream = StreamId::new(config.name, identity.value());
        let source_ids = SourceIdHistory::new(config.source_id_history);
        let mut host = Self {
            identity,
            stream,
            state: S::default(),
            version: 0,
            events_since_snapshot: 0,
            status: HostStatus::Recovering,
            source_ids,
            config,
            runtime,
        };

        if let Some(snapshot) = host.runtime.snapshots.load_latest(&host.stream).await? {
            host.recover_snapshot(snapshot)?;
        }
        let records = host
            .runtime
            .journal
            .read_from(&host.stream, host.version)
            .await?;
        let replayed = records.len();
        for record in records {
            host.recover_event(record)?;
        }

        host.status = HostStatus::Ready;
        tracing::debug!(
            stream = %host.stream,
            version = host.version,
            replayed,
            "host recovered"
        );
        Ok(host)
    }

    fn recover_snapshot(&mut self, record: SerializedSnapshot) -> Result<(), RecoveryError> {
        let payload = self.runtime.definitions.decode_snapshot(
            &record.metadata.snapshot_name,
            record.metadata.snapshot_version,
            record.payload,
        )?;
        let snapshot = CommittedSnapshot {
            identity: self.identity.clone(),
            snapshot: payload,
            metadata: record.metadata,
            timestamp: record.timestamp,
            sequence_number: record.sequence_number,
        };
        self.config
            .apply
            .hydrate_snapshot(&mut self.state, snapshot.snapshot.as_ref())?;
        self.version = snapshot.sequence_number;
        self.events_since_snapshot = 0;
        Ok(())
    }

    fn recover_event(&mut self, record: SerializedEvent) -> Result<(), RecoveryError> {
        let expected = self.version + 1;
        if record.sequence_number != expected {
            return Err(RecoveryError::Gap {
                stream: self.stream.to_string(),
                expected,
                actual: record.sequence_number,
            });
        }
        let payload = self.runtime.definitions.decode_event(
            &record.event_name,
            record.event_version,
            record.payload,
        )?;
        let committed = CommittedEvent::new(
            self.identity.clone(),
            payload,
            record.metadata,
            record.timestamp,
            record.sequence_number,
        )?;
        self.config
            .apply
            .apply_event(&mut self.state, committed.event())?;
        self.version = committed.sequence_number();
        self.events_since_snapshot += 1;
        if let Some(source_id) = &committed.metadata().source_id {
            self.remember(source_id.clone());
        }
        Ok(())
    }
}

impl<S: Send + Sync + 'static, I: Identity> Host<S, I> {
    pub(crate) fn identity(&self) -> &I {
        &self.identity
    }

    pub(crate) fn state(&self) -> &S {
        &self.state
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.status == HostStatus::Ready
    }

    /// Whether `source_id` was recently accepted.
    pub(crate) fn has_seen(&self, source_id: &SourceId) -> bool {
        self.source_ids.contains(source_id)
    }

    /// Record an accepted source id. Repeats are not pushed twice.
    pub(crate) fn remember(&mut self, source_id: SourceId) {
        if !self.source_ids.contains(&source_id) {
            self.source_ids.push(source_id);
        }
    }

    /// Persist one batch, then fold, publish and maybe snapshot each event.
    ///
    /// Metadata for every event starts from `causal`, is overlaid with the
    /// emission's own metadata, and finally receives the computed fields
    /// (event id, timestamp, aggregate name/id/sequence, event name/version,
    /// `timestamp_epoch`). Every event type is checked for a fold function
    /// before anything is written, so a configuration defect never reaches
    /// the journal.
    ///
    /// # Errors
    ///
    /// * [`CommitError::Apply`] - an event type has no fold function.
    /// * [`CommitError::Definition`] - an event type is not registered.
    /// * [`CommitError::Invariant`] - the clock produced the default instant.
    /// * [`CommitError::Journal`] - the append failed; nothing was folded.
    pub(crate) async fn commit(
        &mut self,
        causal: &EventMetadata,
        batch: Vec<Emission>,
    ) -> Result<(), CommitError> {
        debug_assert!(self.is_ready(), "live batch before recovery completed");
        if batch.is_empty() {
            return Ok(());
        }
        for emission in &batch {
            let event = emission.event.as_ref();
            if !self.config.apply.handles_event(event.payload_type()) {
                return Err(ApplyError::MissingApplyMethod {
                    state: std::any::type_name::<S>(),
                    event: event.type_name(),
                }
                .into());
            }
        }

        let now = self.runtime.clock.now();
        let mut records = Vec::with_capacity(batch.len());
        let mut committed = Vec::with_capacity(batch.len());
        for (offset, emission) in batch.into_iter().enumerate() {
            let sequence_number = self.version + 1 + offset as u64;
            let (definition, payload) = self
                .runtime
                .definitions
                .encode_event(emission.event.as_ref())?;

            let mut metadata = causal.clone();
            if let Some(overrides) = &emission.metadata {
                metadata.merge(overrides);
            }
            metadata.event_id = event_id(self.config.name, self.identity.value(), sequence_number);
            metadata.timestamp = now;
            metadata.aggregate_name = self.config.name.to_owned();
            metadata.aggregate_id = self.identity.value().to_owned();
            metadata.aggregate_sequence_number = sequence_number;
            metadata.event_name = definition.name().to_owned();
            metadata.event_version = definition.version();
            metadata.values.insert(
                TIMESTAMP_EPOCH_KEY.to_owned(),
                now.timestamp_millis().to_string(),
            );

            records.push(SerializedEvent {
                sequence_number,
                event_name: definition.name().to_owned(),
                event_version: definition.version(),
                timestamp: now,
                metadata: metadata.clone(),
                payload,
            });
            committed.push(CommittedEvent::new(
                self.identity.clone(),
                emission.event,
                metadata,
                now,
                sequence_number,
            )?);
        }

        self.runtime.journal.append(&self.stream, records).await?;
        for event in &committed {
            self.apply_committed(event).await?;
        }
        Ok(())
    }

    async fn apply_committed(&mut self, event: &CommittedEvent<I>) -> Result<(), ApplyError> {
        self.config
            .apply
            .apply_event(&mut self.state, event.event())?;
        self.version += 1;
        debug_assert_eq!(self.version, event.sequence_number());
        self.events_since_snapshot += 1;

        self.runtime
            .events
            .publish(AnyDomainEvent::from_committed(event));

        let ctx = SnapshotContext {
            version: self.version,
            events_since_snapshot: self.events_since_snapshot,
        };
        if self.config.strategy.should_snapshot(&ctx) {
            self.take_snapshot().await;
        }
        Ok(())
    }

    /// Capture and save a snapshot at the current version. Failures are
    /// logged and otherwise ignored.
    async fn take_snapshot(&mut self) {
        let Some(payload) = (self.config.create_snapshot)(&self.state) else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let record = match runtime.definitions.encode_snapshot(payload.as_ref()) {
            Ok((definition, json)) => SerializedSnapshot {
                sequence_number: self.version,
                timestamp: runtime.clock.now(),
                metadata: SnapshotMetadata {
                    aggregate_name: self.config.name.to_owned(),
                    aggregate_id: self.identity.value().to_owned(),
                    aggregate_sequence_number: self.version,
                    snapshot_name: definition.name().to_owned(),
                    snapshot_version: definition.version(),
                },
                payload: json,
            },
            Err(e) => {
                tracing::error!(stream = %self.stream, error = %e, "snapshot encoding failed");
                return;
            }
        };

        match runtime.snapshots.save(&self.stream, record).await {
            Ok(()) => {
                self.events_since_snapshot = 0;
                tracing::debug!(stream = %self.stream, version = self.version, "snapshot saved");
                if self.version > 1
                    && let Err(e) = runtime
                        .snapshots
                        .delete_up_to(&self.stream, self.version - 1)
                        .await
                {
                    tracing::warn!(stream = %self.stream, error = %e, "pruning old snapshots failed");
                }
            }
            Err(e) => {
                tracing::error!(
                    stream = %self.stream,
                    version = self.version,
                    error = %e,
                    "snapshot save failed"
                );
            }
        }
    }
}

impl<S> Clone for HostConfig<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            apply: Arc::clone(&self.apply),
            strategy: Arc::clone(&self.strategy),
            create_snapshot: self.create_snapshot,
            source_id_history: self.source_id_history,
        }
    }
}
