//! Domain events, the committed-event envelope, and the notifications
//! published to subscribers once an event has been folded.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InvariantError;
use crate::identity::Identity;
use crate::metadata::EventMetadata;

/// An immutable fact produced by an aggregate or saga.
///
/// Each event is its own type; the state it folds into declares how through
/// [`Apply`](crate::Apply). Names and versions come from the
/// [`Definitions`](crate::Definitions) registry, not from the type.
pub trait AggregateEvent:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// Object-safe view of an [`AggregateEvent`], used wherever events of
/// different types travel together (batches, the journal, subscribers).
pub trait AnyEvent: Any + fmt::Debug + Send + Sync + 'static {
    /// Upcast for downcasting to the concrete event type.
    fn as_any(&self) -> &dyn Any;

    /// The Rust type name of the payload, for diagnostics.
    fn type_name(&self) -> &'static str;

    /// Serialize the payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    fn to_json(&self) -> serde_json::Result<Value>;
}

impl<E: AggregateEvent> AnyEvent for E {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<E>()
    }

    fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

impl dyn AnyEvent {
    /// The `TypeId` of the concrete payload.
    pub fn payload_type(&self) -> TypeId {
        self.as_any().type_id()
    }

    /// Borrow the payload as `E` if that is its concrete type.
    pub fn downcast_ref<E: AggregateEvent>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    /// Whether the payload's concrete type is `E`.
    pub fn is<E: AggregateEvent>(&self) -> bool {
        self.payload_type() == TypeId::of::<E>()
    }
}

/// An event that has been assigned its place in an identity's stream.
///
/// Construction enforces the envelope invariants: the sequence number starts
/// at 1 and the timestamp is a real instant, never the default one.
#[derive(Debug, Clone)]
pub struct CommittedEvent<I> {
    identity: I,
    event: Arc<dyn AnyEvent>,
    metadata: EventMetadata,
    timestamp: DateTime<Utc>,
    sequence_number: u64,
}

impl<I: Identity> CommittedEvent<I> {
    /// Build a committed event.
    ///
    /// # Errors
    ///
    /// * [`InvariantError::NonPositiveSequenceNumber`] if `sequence_number` is 0.
    /// * [`InvariantError::DefaultTimestamp`] if `timestamp` is the Unix epoch,
    ///   the default value of `DateTime<Utc>`.
    pub fn new(
        identity: I,
        event: Arc<dyn AnyEvent>,
        metadata: EventMetadata,
        timestamp: DateTime<Utc>,
        sequence_number: u64,
    ) -> Result<Self, InvariantError> {
        if sequence_number == 0 {
            return Err(InvariantError::NonPositiveSequenceNumber { sequence_number });
        }
        if timestamp == DateTime::<Utc>::default() {
            return Err(InvariantError::DefaultTimestamp);
        }
        Ok(Self {
            identity,
            event,
            metadata,
            timestamp,
            sequence_number,
        })
    }

    /// The identity whose stream holds this event.
    pub fn identity(&self) -> &I {
        &self.identity
    }

    /// The event payload.
    pub fn event(&self) -> &dyn AnyEvent {
        self.event.as_ref()
    }

    /// Shared handle to the event payload.
    pub fn event_arc(&self) -> &Arc<dyn AnyEvent> {
        &self.event
    }

    /// The event's metadata.
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    /// Commit instant.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Position in the identity's stream, starting at 1.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

/// Journal representation of a committed event.
///
/// The identity is implied by the stream the record lives in; the payload is
/// decoded back to its type through the event's registered name and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// Position in the stream, starting at 1.
    pub sequence_number: u64,
    /// Registered event name.
    pub event_name: String,
    /// Registered event version.
    pub event_version: u32,
    /// Commit instant.
    pub timestamp: DateTime<Utc>,
    /// Full event metadata.
    pub metadata: EventMetadata,
    /// JSON-encoded payload.
    pub payload: Value,
}

/// A folded event as seen by a subscriber that knows its concrete types.
#[derive(Debug, Clone)]
pub struct DomainEvent<I, E> {
    /// Identity of the aggregate or saga that committed the event.
    pub identity: I,
    /// The event payload.
    pub event: E,
    /// The event's metadata.
    pub metadata: EventMetadata,
    /// Commit instant.
    pub timestamp: DateTime<Utc>,
    /// The committing host's version after folding the event.
    pub version: u64,
}

/// Notification published to subscribers each time a host folds a live event.
///
/// Carries the identity, identity type, event type, payload, metadata and the
/// host's new version. [`downcast`](AnyDomainEvent::downcast) recovers the
/// typed [`DomainEvent`].
#[derive(Debug, Clone)]
pub struct AnyDomainEvent {
    identity: String,
    identity_type: TypeId,
    identity_type_name: &'static str,
    event: Arc<dyn AnyEvent>,
    metadata: Arc<EventMetadata>,
    timestamp: DateTime<Utc>,
    version: u64,
}

impl AnyDomainEvent {
    pub(crate) fn from_committed<I: Identity>(committed: &CommittedEvent<I>) -> Self {
        Self {
            identity: committed.identity.value().to_owned(),
            identity_type: TypeId::of::<I>(),
            identity_type_name: std::any::type_name::<I>(),
            event: Arc::clone(&committed.event),
            metadata: Arc::new(committed.metadata.clone()),
            timestamp: committed.timestamp,
            version: committed.sequence_number,
        }
    }

    /// String value of the committing identity.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// `TypeId` of the committing identity type.
    pub fn identity_type(&self) -> TypeId {
        self.identity_type
    }

    /// Rust type name of the committing identity type.
    pub fn identity_type_name(&self) -> &'static str {
        self.identity_type_name
    }

    /// `TypeId` of the event payload.
    pub fn event_type(&self) -> TypeId {
        self.event.payload_type()
    }

    /// The event payload.
    pub fn event(&self) -> &dyn AnyEvent {
        self.event.as_ref()
    }

    /// The event's metadata.
    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    /// Commit instant.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The committing host's version after folding the event.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Recover the typed notification if the identity and event types match.
    pub fn downcast<I: Identity, E: AggregateEvent>(&self) -> Option<DomainEvent<I, E>> {
        if self.identity_type != TypeId::of::<I>() {
            return None;
        }
        let event = self.event.downcast_ref::<E>()?.clone();
        let identity = I::from_value(self.identity.clone()).ok()?;
        Some(DomainEvent {
            identity,
            event,
            metadata: (*self.metadata).clone(),
            timestamp: self.timestamp,
            version: self.version,
        })
    }
}
