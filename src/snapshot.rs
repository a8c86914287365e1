//! Point-in-time captures of aggregate or saga state.
//!
//! A snapshot is a cache over the event log, never an authority: recovery
//! hydrates from the latest one and then replays every event committed after
//! it, so a lost or stale snapshot only costs replay time.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Identity;
use crate::metadata::SnapshotMetadata;

/// Serializable payload produced by
/// [`Aggregate::create_snapshot`](crate::Aggregate::create_snapshot) and
/// folded back through [`Hydrate`](crate::Hydrate).
pub trait AggregateSnapshot:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// Object-safe view of an [`AggregateSnapshot`].
pub trait AnySnapshot: Any + fmt::Debug + Send + Sync + 'static {
    /// Upcast for downcasting to the concrete snapshot type.
    fn as_any(&self) -> &dyn Any;

    /// The Rust type name of the payload.
    fn type_name(&self) -> &'static str;

    /// Serialize the payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    fn to_json(&self) -> serde_json::Result<Value>;
}

impl<S: AggregateSnapshot> AnySnapshot for S {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<S>()
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

impl dyn AnySnapshot {
    /// The `TypeId` of the concrete payload.
    pub fn payload_type(&self) -> TypeId {
        self.as_any().type_id()
    }

    /// Borrow the payload as `S` if that is its concrete type.
    pub fn downcast_ref<S: AggregateSnapshot>(&self) -> Option<&S> {
        self.as_any().downcast_ref::<S>()
    }
}

/// A snapshot tagged with the version of the state it captures.
#[derive(Debug, Clone)]
pub struct CommittedSnapshot<I> {
    /// Identity of the snapshotted instance.
    pub identity: I,
    /// The snapshot payload.
    pub snapshot: Arc<dyn AnySnapshot>,
    /// Snapshot metadata.
    pub metadata: SnapshotMetadata,
    /// Capture instant.
    pub timestamp: DateTime<Utc>,
    /// Version of the state at capture; replay resumes after it.
    pub sequence_number: u64,
}

impl<I: Identity> CommittedSnapshot<I> {
    /// Borrow the payload as `S` if that is its concrete type.
    pub fn payload<S: AggregateSnapshot>(&self) -> Option<&S> {
        self.snapshot.downcast_ref::<S>()
    }
}

/// Storage representation of a committed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedSnapshot {
    /// Version of the captured state.
    pub sequence_number: u64,
    /// Capture instant.
    pub timestamp: DateTime<Utc>,
    /// Snapshot metadata, including the registered name and version.
    pub metadata: SnapshotMetadata,
    /// JSON-encoded payload.
    pub payload: Value,
}
