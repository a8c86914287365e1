//! Metadata carried by commands, committed events, and snapshots.
//!
//! Event metadata is the causation trail: correlation ids accumulate as a
//! command causes events, which trigger sagas, which issue further commands.
//! The source id links each event back to the command (or upstream event)
//! that caused it and feeds de-duplication.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::SourceId;

/// Bag key holding the commit timestamp as Unix epoch milliseconds.
pub const TIMESTAMP_EPOCH_KEY: &str = "timestamp_epoch";

/// Fixed namespace UUID for deterministic event id derivation.
const EVENT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5f, 0x0b, 0x2d, 0x91, 0xc4, 0x3e, 0x4b, 0x6a, 0x8f, 0x12, 0x7d, 0xa9, 0x60, 0x1c, 0xe3, 0x58,
]);

/// Derive the id of the event at `sequence_number` in an identity's stream.
///
/// Uses UUID v5 over `"{aggregate_name}/{identity}-v{sequence_number}"`, so a
/// replayed or re-delivered event always carries the same id.
pub fn event_id(aggregate_name: &str, identity: &str, sequence_number: u64) -> Uuid {
    let name = format!("{aggregate_name}/{identity}-v{sequence_number}");
    Uuid::new_v5(&EVENT_NAMESPACE, name.as_bytes())
}

/// Cross-cutting metadata passed alongside a command.
///
/// # Examples
///
/// ```
/// use aggregate_host::{CommandMetadata, SourceId};
///
/// let meta = CommandMetadata::default()
///     .with_source_id(SourceId::new("cmd-1").unwrap())
///     .with_correlation_id("req-abc")
///     .with_value("origin", "api");
///
/// assert_eq!(meta.source_id.as_ref().map(SourceId::value), Some("cmd-1"));
/// assert_eq!(meta.correlation_ids, vec!["req-abc".to_string()]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// De-duplication token for this command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    /// Correlation ids accumulated across causally related commands.
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    /// Free-form key/value pairs copied onto the resulting events.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl CommandMetadata {
    /// Metadata carrying a freshly generated source id.
    pub fn with_new_source_id() -> Self {
        Self::default().with_source_id(SourceId::generate())
    }

    /// Set the source id.
    pub fn with_source_id(mut self, id: SourceId) -> Self {
        self.source_id = Some(id);
        self
    }

    /// Add a correlation id, ignoring duplicates.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        add_correlation_id(&mut self.correlation_ids, id.into());
        self
    }

    /// Set a free-form value.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Fold the causal context of `event` into this command.
    ///
    /// Correlation ids are unioned and bag values the command does not
    /// already define are copied over. The source id is left alone: a
    /// command's source id identifies the command, not its cause.
    pub fn merge_event(&mut self, event: &EventMetadata) {
        for id in &event.correlation_ids {
            add_correlation_id(&mut self.correlation_ids, id.clone());
        }
        for (key, value) in &event.values {
            self.values
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// Metadata stamped on every committed event.
///
/// Well-known fields are filled in by the host when the event is committed;
/// callers only ever supply the causal fields (`correlation_ids`,
/// `source_id`) and the `values` bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Deterministic id derived from the identity and sequence number.
    pub event_id: Uuid,
    /// Commit instant. Never the default instant once committed.
    pub timestamp: DateTime<Utc>,
    /// Name of the aggregate or saga type that committed the event.
    pub aggregate_name: String,
    /// Identity value of the committing instance.
    pub aggregate_id: String,
    /// Position of the event in its stream.
    pub aggregate_sequence_number: u64,
    /// Registered event name.
    pub event_name: String,
    /// Registered event version.
    pub event_version: u32,
    /// Correlation ids accumulated across causally related commands.
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    /// The command (or upstream event) that caused this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    /// Free-form key/value pairs.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl EventMetadata {
    /// Causal context for events produced by handling a command.
    pub fn from_command(command: &CommandMetadata) -> Self {
        Self {
            correlation_ids: command.correlation_ids.clone(),
            source_id: command.source_id.clone(),
            values: command.values.clone(),
            ..Self::default()
        }
    }

    /// Causal context for events produced while reacting to `cause`.
    ///
    /// Correlation ids and bag values are inherited; the source id becomes
    /// the causing event's id.
    pub fn caused_by(cause: &EventMetadata) -> Self {
        Self {
            correlation_ids: cause.correlation_ids.clone(),
            source_id: Some(SourceId::from_event_id(cause.event_id)),
            values: cause.values.clone(),
            ..Self::default()
        }
    }

    /// Add a correlation id, ignoring duplicates.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        add_correlation_id(&mut self.correlation_ids, id.into());
        self
    }

    /// Set the source id.
    pub fn with_source_id(mut self, id: SourceId) -> Self {
        self.source_id = Some(id);
        self
    }

    /// Set a free-form value.
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Overlay caller-supplied metadata.
    ///
    /// Correlation ids are unioned, a supplied source id replaces the current
    /// one, and bag values overwrite existing keys. Well-known commit fields
    /// are not touched.
    pub fn merge(&mut self, overrides: &EventMetadata) {
        for id in &overrides.correlation_ids {
            add_correlation_id(&mut self.correlation_ids, id.clone());
        }
        if let Some(ref source_id) = overrides.source_id {
            self.source_id = Some(source_id.clone());
        }
        for (key, value) in &overrides.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Look up a bag value.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Metadata stamped on every committed snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Name of the aggregate or saga type.
    pub aggregate_name: String,
    /// Identity value of the snapshotted instance.
    pub aggregate_id: String,
    /// Version of the state captured by the snapshot.
    pub aggregate_sequence_number: u64,
    /// Registered snapshot name.
    pub snapshot_name: String,
    /// Registered snapshot version.
    pub snapshot_version: u32,
}

fn add_correlation_id(ids: &mut Vec<String>, id: String) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}
