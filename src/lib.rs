//! Event-sourced aggregate and saga hosts.
//!
//! Every aggregate or saga instance is owned by a single host task that
//! persists the events its domain logic emits before folding them into
//! state, publishes a notification for each folded event, takes snapshots
//! according to a strategy, and rebuilds itself deterministically from its
//! snapshot and journal after a restart.

mod actor;
pub use actor::{AggregateHandle, SagaHandle};
mod aggregate;
pub use aggregate::{Aggregate, Batch, Emitter};
mod apply;
pub use apply::{Apply, ApplyMethods, Hydrate};
mod clock;
pub use clock::{Clock, FixedClock, SystemClock};
mod command;
mod definitions;
mod error;
mod event;
mod host;
mod identity;
mod journal;
mod metadata;
mod saga;
mod snapshot;
mod snapshot_store;
mod source_ids;
mod storage;
mod store;
mod strategy;
mod subscribers;

pub use command::{
    Command, CommandBus, CommandEnvelope, Executed, ExecutionResult, FailureKind, Outcome,
};
pub use definitions::{Definitions, DefinitionsBuilder, EventDefinition, SnapshotDefinition};
pub use error::{
    ApplyError, DefinitionError, DispatchError, ExecuteError, InvariantError, JournalError,
    RecoveryError, SnapshotStoreError, StateError,
};
pub use event::{
    AggregateEvent, AnyDomainEvent, AnyEvent, CommittedEvent, DomainEvent, SerializedEvent,
};
pub use identity::{Identity, IdentityError, SourceId};
pub use journal::{EventJournal, InMemoryJournal, StreamId, check_batch};
pub use metadata::{
    CommandMetadata, EventMetadata, SnapshotMetadata, TIMESTAMP_EPOCH_KEY, event_id,
};
pub use saga::{Saga, SagaContext, SagaHandlers, SagaHandles};
pub use snapshot::{AggregateSnapshot, AnySnapshot, CommittedSnapshot, SerializedSnapshot};
pub use snapshot_store::{InMemorySnapshotStore, SnapshotStore};
pub use source_ids::{DEFAULT_SOURCE_ID_HISTORY, SourceIdHistory};
pub use storage::{FileJournal, FileSnapshotStore, StreamLayout};
pub use store::{AggregateStore, AggregateStoreBuilder};
pub use strategy::{NeverSnapshot, SnapshotContext, SnapshotEvery, SnapshotStrategy};
pub use subscribers::EventStream;

#[doc(hidden)]
pub mod __private {
    pub use serde;
    pub use uuid;
}
