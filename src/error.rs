//! Crate-level error types.
//!
//! Each concern gets its own enum. [`ExecuteError`] is what a typed caller
//! sees; the command bus folds it into an
//! [`ExecutionResult`](crate::ExecutionResult) with an explicit
//! [`FailureKind`](crate::FailureKind).

use crate::identity::IdentityError;

/// Error returned when executing a command against an aggregate fails.
///
/// Generic over `E`, the domain-specific error type that the aggregate's
/// command handler may produce (e.g., "insufficient funds").
///
/// # Type Parameters
///
/// * `E` - Domain error type, must implement `Error + Send + Sync + 'static`
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic.
    ///
    /// Wraps the domain-specific error returned from the aggregate's
    /// command handler, forwarding its `Display` and `Error` impls.
    #[error(transparent)]
    Domain(E),

    /// The event journal refused or failed to persist a batch.
    ///
    /// Nothing from the failing batch was folded. Batches persisted earlier
    /// by the same command stay committed.
    #[error("event persistence failed: {0}")]
    Persistence(#[from] JournalError),

    /// A committed event had no fold function registered.
    ///
    /// This is a configuration defect; the host stops after reporting it.
    #[error("configuration error: {0}")]
    Apply(#[from] ApplyError),

    /// An emitted event or snapshot type is missing from the definitions
    /// registry, or its payload could not be encoded.
    #[error("configuration error: {0}")]
    Definition(#[from] DefinitionError),

    /// A committed-event envelope invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantError),

    /// The host could not be recovered from its journal.
    #[error("recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// The host task exited unexpectedly.
    ///
    /// The background task that owns this aggregate has shut down,
    /// so no further commands can be processed through this handle.
    #[error("aggregate host is no longer running")]
    ActorGone,
}

impl<E: std::error::Error + Send + Sync + 'static> ExecuteError<E> {
    /// Whether the host reporting this error stops afterwards.
    ///
    /// Only a missing fold function is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Apply(_))
    }
}

/// Error returned when reading the current state of a host fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The host task exited unexpectedly.
    ///
    /// The background task that owns this aggregate has shut down,
    /// so its state can no longer be queried.
    #[error("aggregate host is no longer running")]
    ActorGone,
}

/// A committed-event envelope was built from invalid parts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantError {
    /// Sequence numbers start at 1.
    #[error("sequence_number must be positive, got {sequence_number}")]
    NonPositiveSequenceNumber {
        /// The rejected sequence number.
        sequence_number: u64,
    },

    /// The commit timestamp was the default (Unix epoch) instant.
    #[error("timestamp must not be the default instant")]
    DefaultTimestamp,
}

/// A fold or hydrate function could not be found for a payload type.
///
/// Lookup is by exact type; there is no fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// No `Apply<E>` registered for the event type.
    #[error("no apply method on {state} for event {event}")]
    MissingApplyMethod {
        /// Rust type name of the state being folded.
        state: &'static str,
        /// Rust type name of the event payload.
        event: &'static str,
    },

    /// No `Hydrate<S>` registered for the snapshot type.
    #[error("no hydrate method on {state} for snapshot {snapshot}")]
    MissingHydrateMethod {
        /// Rust type name of the state being hydrated.
        state: &'static str,
        /// Rust type name of the snapshot payload.
        snapshot: &'static str,
    },
}

/// A payload type or stored name could not be resolved through the
/// definitions registry.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The event type was never registered.
    #[error("event type {type_name} is not registered")]
    UnregisteredEvent {
        /// Rust type name of the event.
        type_name: &'static str,
    },

    /// No event type is registered under the stored name and version.
    #[error("no event registered as {name} v{version}")]
    UnknownEvent {
        /// Stored event name.
        name: String,
        /// Stored event version.
        version: u32,
    },

    /// The snapshot type was never registered.
    #[error("snapshot type {type_name} is not registered")]
    UnregisteredSnapshot {
        /// Rust type name of the snapshot.
        type_name: &'static str,
    },

    /// No snapshot type is registered under the stored name and version.
    #[error("no snapshot registered as {name} v{version}")]
    UnknownSnapshot {
        /// Stored snapshot name.
        name: String,
        /// Stored snapshot version.
        version: u32,
    },

    /// No upcaster is registered for the event type.
    #[error("no upcaster registered for {type_name}")]
    NoUpcaster {
        /// Rust type name of the event.
        type_name: &'static str,
    },

    /// A payload failed to encode or decode.
    #[error("payload {name} could not be (de)serialized: {source}")]
    Payload {
        /// Registered name of the payload.
        name: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

/// Error returned by an [`EventJournal`](crate::EventJournal).
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The batch does not start right after the stream head, or its
    /// sequence numbers are not contiguous.
    #[error("sequence conflict on {stream}: expected {expected}, got {actual}")]
    SequenceConflict {
        /// Stream the batch targeted.
        stream: String,
        /// The sequence number the journal expected next.
        expected: u64,
        /// The sequence number the batch carried.
        actual: u64,
    },

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure (connection lost, store closed, ...).
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

/// Error returned by a [`SnapshotStore`](crate::SnapshotStore).
#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A snapshot could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend-specific failure.
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// A host failed to rebuild its state and never became ready.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Reading the event stream failed.
    #[error("reading events failed: {0}")]
    Journal(#[from] JournalError),

    /// Loading the latest snapshot failed.
    #[error("loading snapshot failed: {0}")]
    Snapshot(#[from] SnapshotStoreError),

    /// A stored event or snapshot could not be decoded.
    #[error("decoding history failed: {0}")]
    Definition(#[from] DefinitionError),

    /// A replayed event or snapshot had no fold or hydrate function.
    #[error("replaying history failed: {0}")]
    Apply(#[from] ApplyError),

    /// A stored event violated an envelope invariant.
    #[error("stored event is invalid: {0}")]
    Invariant(#[from] InvariantError),

    /// Replayed events were not gap-free.
    #[error("stream {stream} is not contiguous: expected {expected}, got {actual}")]
    Gap {
        /// Stream being replayed.
        stream: String,
        /// The sequence number expected next.
        expected: u64,
        /// The sequence number read.
        actual: u64,
    },
}

/// A [`CommandEnvelope`](crate::CommandEnvelope) could not be routed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No aggregate is registered under the envelope's name.
    #[error("unknown aggregate type: {0}")]
    UnknownAggregate(String),

    /// The envelope's identity string was rejected.
    #[error("invalid identity: {0}")]
    InvalidIdentity(#[from] IdentityError),

    /// The command payload did not decode into the aggregate's command type.
    #[error("command deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal domain error for testing `ExecuteError<E>`.
    #[derive(Debug, thiserror::Error)]
    #[error("test domain error")]
    struct TestDomainError;

    #[test]
    fn execute_error_domain_displays_inner() {
        let err: ExecuteError<TestDomainError> = ExecuteError::Domain(TestDomainError);
        assert_eq!(err.to_string(), "test domain error");
    }

    #[test]
    fn execute_error_from_journal_error() {
        let journal = JournalError::SequenceConflict {
            stream: "list/l-1".into(),
            expected: 3,
            actual: 5,
        };
        let err: ExecuteError<TestDomainError> = ExecuteError::from(journal);
        assert!(matches!(err, ExecuteError::Persistence(_)));
        assert!(err.to_string().contains("expected 3, got 5"));
    }

    #[test]
    fn only_apply_errors_are_fatal() {
        let missing: ExecuteError<TestDomainError> = ApplyError::MissingApplyMethod {
            state: "ShoppingList",
            event: "ItemRemoved",
        }
        .into();
        assert!(missing.is_fatal());
        assert!(!ExecuteError::Domain(TestDomainError).is_fatal());
        assert!(!ExecuteError::<TestDomainError>::ActorGone.is_fatal());
    }

    #[test]
    fn execute_error_actor_gone_display() {
        let err: ExecuteError<TestDomainError> = ExecuteError::ActorGone;
        assert_eq!(err.to_string(), "aggregate host is no longer running");
    }

    #[test]
    fn missing_apply_method_names_both_types() {
        let err = ApplyError::MissingApplyMethod {
            state: "ShoppingList",
            event: "ItemRemoved",
        };
        let text = err.to_string();
        assert!(text.contains("ShoppingList"));
        assert!(text.contains("ItemRemoved"));
    }

    #[test]
    fn journal_error_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = JournalError::from(io_err);
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn recovery_error_wraps_apply_error() {
        let err = RecoveryError::from(ApplyError::MissingHydrateMethod {
            state: "ShoppingList",
            snapshot: "ListSnapshot",
        });
        assert!(err.to_string().contains("ListSnapshot"));
    }

    // Errors cross task boundaries through oneshot replies.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<TestDomainError>>();
            assert_send_sync::<StateError>();
            assert_send_sync::<RecoveryError>();
            assert_send_sync::<DispatchError>();
        }
    };
}
