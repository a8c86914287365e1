//! Commands, the type-erased command envelope, and the command bus.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::aggregate::Aggregate;
use crate::error::ExecuteError;
use crate::identity::{Identity, SourceId};
use crate::metadata::CommandMetadata;

/// A typed command addressed to one aggregate instance.
///
/// # Examples
///
/// ```ignore
/// let cmd = Command::<ShoppingList>::new(list_id, ListCommand::AddItem { name: "milk".into() })
///     .with_correlation_id("req-1");
/// ```
pub struct Command<A: Aggregate> {
    /// Target aggregate instance.
    pub identity: A::Identity,
    /// The domain command.
    pub payload: A::Command,
    /// Cross-cutting metadata: source id, correlation ids, free-form values.
    pub metadata: CommandMetadata,
}

impl<A: Aggregate> Command<A> {
    /// Build a command carrying a freshly generated source id.
    pub fn new(identity: A::Identity, payload: A::Command) -> Self {
        Self {
            identity,
            payload,
            metadata: CommandMetadata::with_new_source_id(),
        }
    }

    /// Replace the metadata wholesale.
    pub fn with_metadata(mut self, metadata: CommandMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the source id used for de-duplication.
    pub fn with_source_id(mut self, id: SourceId) -> Self {
        self.metadata.source_id = Some(id);
        self
    }

    /// Add a correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata = self.metadata.with_correlation_id(id);
        self
    }

    /// The command's source id, if any.
    pub fn source_id(&self) -> Option<&SourceId> {
        self.metadata.source_id.as_ref()
    }

    /// Serialize into a [`CommandEnvelope`].
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    pub fn into_envelope(self) -> serde_json::Result<CommandEnvelope> {
        Ok(CommandEnvelope {
            aggregate_name: A::NAME.to_owned(),
            identity: self.identity.value().to_owned(),
            command: serde_json::to_value(&self.payload)?,
            metadata: self.metadata,
        })
    }
}

impl<A: Aggregate> fmt::Debug for Command<A>
where
    A::Command: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("aggregate", &A::NAME)
            .field("identity", &self.identity)
            .field("payload", &self.payload)
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// A type-erased command for routing through a [`CommandBus`].
///
/// Produced by sagas, which do not know the concrete command type of the
/// target aggregate at compile time. The bus deserializes `command` into the
/// aggregate's `Command` type at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Target aggregate name (must match `Aggregate::NAME`).
    pub aggregate_name: String,
    /// Target identity value.
    pub identity: String,
    /// JSON-serialized command payload.
    pub command: Value,
    /// Cross-cutting metadata forwarded to the host.
    pub metadata: CommandMetadata,
}

/// Successful outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Executed {
    /// Domain logic ran and its events (possibly none) were committed.
    Applied {
        /// Host version before the command.
        from_version: u64,
        /// Host version after the command.
        to_version: u64,
    },
    /// The command's source id was recently seen; nothing ran.
    AlreadyApplied,
}

/// Why a command failed, for callers of the type-erased bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The aggregate rejected the command.
    Domain,
    /// The journal failed to persist a batch.
    Persistence,
    /// Missing registration: apply method, event definition, aggregate type.
    Configuration,
    /// The target host could not be recovered.
    Recovery,
    /// The target host is not running.
    Unavailable,
    /// The envelope's identity or payload did not decode.
    Deserialization,
}

/// Outcome half of an [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The command succeeded.
    Succeeded(Executed),
    /// The command failed.
    Failed {
        /// Failure category.
        kind: FailureKind,
        /// Human-readable cause.
        message: String,
    },
}

/// What the command bus reports for one dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The command's source id, echoed back.
    pub source_id: Option<SourceId>,
    /// Success or failure.
    pub outcome: Outcome,
}

impl ExecutionResult {
    /// A successful result.
    pub fn succeeded(source_id: Option<SourceId>, executed: Executed) -> Self {
        Self {
            source_id,
            outcome: Outcome::Succeeded(executed),
        }
    }

    /// A failed result.
    pub fn failed(source_id: Option<SourceId>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            source_id,
            outcome: Outcome::Failed {
                kind,
                message: message.into(),
            },
        }
    }

    /// Convert a typed execution result.
    pub fn from_execute<E>(source_id: Option<SourceId>, result: Result<Executed, ExecuteError<E>>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match result {
            Ok(executed) => Self::succeeded(source_id, executed),
            Err(e) => {
                let kind = match e {
                    ExecuteError::Domain(_) => FailureKind::Domain,
                    ExecuteError::Persistence(_) => FailureKind::Persistence,
                    ExecuteError::Apply(_)
                    | ExecuteError::Definition(_)
                    | ExecuteError::Invariant(_) => FailureKind::Configuration,
                    ExecuteError::Recovery(_) => FailureKind::Recovery,
                    ExecuteError::ActorGone => FailureKind::Unavailable,
                };
                Self::failed(source_id, kind, e.to_string())
            }
        }
    }

    /// Whether the command succeeded (including `AlreadyApplied`).
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded(_))
    }

    /// The failure kind, if the command failed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.outcome {
            Outcome::Failed { kind, .. } => Some(kind),
            Outcome::Succeeded(_) => None,
        }
    }
}

/// Routes type-erased commands to the host owning the target identity.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Execute `envelope` and report the outcome. Never panics on bad input;
    /// every failure becomes an [`Outcome::Failed`].
    async fn dispatch(&self, envelope: CommandEnvelope) -> ExecutionResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{ListCommand, ListId, ShoppingList};
    use crate::error::JournalError;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("nope")]
    struct Nope;

    #[test]
    fn new_command_has_a_source_id() {
        let cmd = Command::<ShoppingList>::new(
            ListId::new("l-1").unwrap(),
            ListCommand::AddItem { name: "milk".into() },
        );
        assert!(cmd.source_id().is_some());
    }

    #[test]
    fn into_envelope_carries_name_identity_and_payload() {
        let sid = SourceId::new("cmd-1").unwrap();
        let envelope = Command::<ShoppingList>::new(
            ListId::new("l-1").unwrap(),
            ListCommand::AddItem { name: "milk".into() },
        )
        .with_source_id(sid.clone())
        .with_correlation_id("req-1")
        .into_envelope()
        .unwrap();

        assert_eq!(envelope.aggregate_name, "shopping-list");
        assert_eq!(envelope.identity, "l-1");
        assert_eq!(envelope.command, json!({"AddItem": {"name": "milk"}}));
        assert_eq!(envelope.metadata.source_id, Some(sid));
        assert_eq!(envelope.metadata.correlation_ids, vec!["req-1"]);
    }

    #[test]
    fn from_execute_maps_failure_kinds() {
        let sid = Some(SourceId::new("cmd-1").unwrap());

        let domain = ExecutionResult::from_execute::<Nope>(sid.clone(), Err(ExecuteError::Domain(Nope)));
        assert_eq!(domain.failure_kind(), Some(FailureKind::Domain));
        assert_eq!(domain.source_id, sid);

        let persistence = ExecutionResult::from_execute::<Nope>(
            None,
            Err(JournalError::Unavailable("down".into()).into()),
        );
        assert_eq!(persistence.failure_kind(), Some(FailureKind::Persistence));

        let gone = ExecutionResult::from_execute::<Nope>(None, Err(ExecuteError::ActorGone));
        assert_eq!(gone.failure_kind(), Some(FailureKind::Unavailable));

        let ok = ExecutionResult::from_execute::<Nope>(None, Ok(Executed::AlreadyApplied));
        assert!(ok.is_success());
        assert_eq!(ok.failure_kind(), None);
    }

    #[test]
    fn execution_result_serializes() {
        let result = ExecutionResult::failed(None, FailureKind::Domain, "rejected");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"]["Failed"]["kind"], "Domain");
    }
}
