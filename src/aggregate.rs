//! Aggregate trait and the emitter command handlers record events through.

use std::fmt;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};

use crate::apply::ApplyMethods;
use crate::event::{AggregateEvent, AnyEvent};
use crate::identity::Identity;
use crate::metadata::EventMetadata;
use crate::snapshot::AnySnapshot;
use crate::source_ids::DEFAULT_SOURCE_ID_HISTORY;
use crate::strategy::{NeverSnapshot, SnapshotStrategy};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state. State is
/// built by folding domain events through the [`Apply`](crate::Apply)
/// implementations listed in [`apply_methods`](Aggregate::apply_methods).
///
/// # Associated Types
///
/// - `Identity`: the identity type addressing instances of this aggregate.
/// - `Command`: the set of commands this aggregate can handle.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O,
///   no side effects. It validates a command against the current state and
///   records zero or more events on the [`Emitter`].
/// - Apply functions must be pure and deterministic; replaying the same
///   events always rebuilds the same state.
pub trait Aggregate: Default + Clone + fmt::Debug + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "order"). Used as the stream
    /// name and the command-bus routing key.
    const NAME: &'static str;

    /// Identity type addressing instances of this aggregate.
    type Identity: Identity;

    /// The set of commands this aggregate can handle.
    type Command: Serialize + DeserializeOwned + Send + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The fold and hydrate functions for this state. Called once per
    /// store; the table is shared by every instance.
    fn apply_methods() -> ApplyMethods<Self>;

    /// Validate a command against the current state and record events.
    ///
    /// Recording nothing makes the command a no-op. Returning `Err` rejects
    /// the command and discards anything recorded.
    ///
    /// # Errors
    ///
    /// Returns the domain error rejecting the command.
    fn handle(&self, command: Self::Command, emit: &mut Emitter) -> Result<(), Self::Error>;

    /// Capture the current state as a snapshot payload. `None` disables
    /// snapshots regardless of the strategy.
    fn create_snapshot(&self) -> Option<Box<dyn AnySnapshot>> {
        None
    }

    /// When to capture snapshots. Defaults to never.
    fn snapshot_strategy() -> Arc<dyn SnapshotStrategy> {
        Arc::new(NeverSnapshot)
    }

    /// How many recent source ids each instance remembers for
    /// de-duplication.
    fn source_id_history() -> usize {
        DEFAULT_SOURCE_ID_HISTORY
    }
}

/// One event awaiting persistence, with optional caller-supplied metadata.
#[derive(Debug)]
pub(crate) struct Emission {
    pub(crate) event: Arc<dyn AnyEvent>,
    pub(crate) metadata: Option<EventMetadata>,
}

/// Several events persisted as one atomic unit.
#[derive(Debug, Default)]
pub struct Batch {
    events: Vec<Emission>,
}

impl Batch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn with<E: AggregateEvent>(mut self, event: E) -> Self {
        self.push(event);
        self
    }

    /// Append an event with extra metadata merged over its causal context.
    pub fn with_metadata<E: AggregateEvent>(mut self, event: E, metadata: EventMetadata) -> Self {
        self.events.push(Emission {
            event: Arc::new(event),
            metadata: Some(metadata),
        });
        self
    }

    /// Append an event in place.
    pub fn push<E: AggregateEvent>(&mut self, event: E) {
        self.events.push(Emission {
            event: Arc::new(event),
            metadata: None,
        });
    }

    /// Number of events in the batch.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Records the events a command handler (or saga reaction) produces.
///
/// Each [`emit`](Emitter::emit) is its own single-event batch;
/// [`emit_all`](Emitter::emit_all) records one multi-event batch. Batches
/// are persisted in the order recorded, each only after the previous one
/// has been committed and folded.
#[derive(Debug, Default)]
pub struct Emitter {
    batches: Vec<Vec<Emission>>,
}

impl Emitter {
    /// Record a single event.
    pub fn emit<E: AggregateEvent>(&mut self, event: E) {
        self.batches.push(vec![Emission {
            event: Arc::new(event),
            metadata: None,
        }]);
    }

    /// Record a single event with extra metadata.
    pub fn emit_with<E: AggregateEvent>(&mut self, event: E, metadata: EventMetadata) {
        self.batches.push(vec![Emission {
            event: Arc::new(event),
            metadata: Some(metadata),
        }]);
    }

    /// Record an atomic batch. An empty batch records nothing.
    pub fn emit_all(&mut self, batch: Batch) {
        if !batch.is_empty() {
            self.batches.push(batch.events);
        }
    }

    /// Total number of recorded events.
    pub fn event_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub(crate) fn into_batches(self) -> Vec<Vec<Emission>> {
        self.batches
    }
}
