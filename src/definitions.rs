//! Registry mapping payload types to their stored `(name, version)`.
//!
//! Built once at startup and injected into the store. Journal records carry
//! only the name and version, so every event or snapshot type that can be
//! persisted must be registered here. Upcasters registered alongside turn
//! outdated payloads into their current type as they are read back.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::DefinitionError;
use crate::event::{AggregateEvent, AnyEvent};
use crate::snapshot::{AggregateSnapshot, AnySnapshot};

type EventDecoder = fn(Value) -> serde_json::Result<Arc<dyn AnyEvent>>;
type SnapshotDecoder = fn(Value) -> serde_json::Result<Arc<dyn AnySnapshot>>;
type UpcastFn = Arc<dyn Fn(&dyn AnyEvent) -> Option<Arc<dyn AnyEvent>> + Send + Sync>;

/// Converts one stored event type into its successor.
#[derive(Clone)]
struct Upcaster {
    to: &'static str,
    apply: UpcastFn,
}

impl fmt::Debug for Upcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upcaster").field("to", &self.to).finish_non_exhaustive()
    }
}

/// Stored name and version of one event type.
#[derive(Debug, Clone)]
pub struct EventDefinition {
    name: String,
    version: u32,
    type_id: TypeId,
    type_name: &'static str,
    decode: EventDecoder,
}

impl EventDefinition {
    /// Stored event name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored event version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// `TypeId` of the registered payload type.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust type name of the registered payload type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// Stored name and version of one snapshot type.
#[derive(Debug, Clone)]
pub struct SnapshotDefinition {
    name: String,
    version: u32,
    type_id: TypeId,
    decode: SnapshotDecoder,
}

impl SnapshotDefinition {
    /// Stored snapshot name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored snapshot version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// `TypeId` of the registered payload type.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

/// Lookup tables for registered event and snapshot types.
///
/// # Examples
///
/// ```
/// use aggregate_host::{AggregateEvent, Definitions};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct ItemAddedEventV2 { name: String }
/// impl AggregateEvent for ItemAddedEventV2 {}
///
/// let defs = Definitions::builder().event::<ItemAddedEventV2>().build();
/// let def = defs.event_definition::<ItemAddedEventV2>().unwrap();
/// assert_eq!((def.name(), def.version()), ("ItemAdded", 2));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    events: HashMap<TypeId, EventDefinition>,
    events_by_name: HashMap<(String, u32), TypeId>,
    snapshots: HashMap<TypeId, SnapshotDefinition>,
    snapshots_by_name: HashMap<(String, u32), TypeId>,
    upcasters: HashMap<TypeId, Upcaster>,
}

impl Definitions {
    /// Start an empty registry.
    pub fn builder() -> DefinitionsBuilder {
        DefinitionsBuilder::default()
    }

    /// Definition of event type `E`.
    ///
    /// # Errors
    ///
    /// [`DefinitionError::UnregisteredEvent`] if `E` was never registered.
    pub fn event_definition<E: AggregateEvent>(&self) -> Result<&EventDefinition, DefinitionError> {
        self.event_definition_of(TypeId::of::<E>(), std::any::type_name::<E>())
    }

    /// Definition of the event payload type `type_id`.
    ///
    /// # Errors
    ///
    /// [`DefinitionError::UnregisteredEvent`] if the type was never registered.
    pub fn event_definition_of(
        &self,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<&EventDefinition, DefinitionError> {
        self.events
            .get(&type_id)
            .ok_or(DefinitionError::UnregisteredEvent { type_name })
    }

    /// Definition of snapshot type `S`.
    ///
    /// # Errors
    ///
    /// [`DefinitionError::UnregisteredSnapshot`] if `S` was never registered.
    pub fn snapshot_definition<S: AggregateSnapshot>(
        &self,
    ) -> Result<&SnapshotDefinition, DefinitionError> {
        self.snapshot_definition_of(TypeId::of::<S>(), std::any::type_name::<S>())
    }

    /// Definition of the snapshot payload type `type_id`.
    ///
    /// # Errors
    ///
    /// [`DefinitionError::UnregisteredSnapshot`] if the type was never registered.
    pub fn snapshot_definition_of(
        &self,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<&SnapshotDefinition, DefinitionError> {
        self.snapshots
            .get(&type_id)
            .ok_or(DefinitionError::UnregisteredSnapshot { type_name })
    }

    /// Encode an event payload, returning its definition alongside the JSON.
    ///
    /// # Errors
    ///
    /// Fails if the payload type is unregistered or does not serialize.
    pub fn encode_event(
        &self,
        event: &dyn AnyEvent,
    ) -> Result<(&EventDefinition, Value), DefinitionError> {
        let definition = self.event_definition_of(event.payload_type(), event.type_name())?;
        let payload = event.to_json().map_err(|source| DefinitionError::Payload {
            name: definition.name.clone(),
            source,
        })?;
        Ok((definition, payload))
    }

    /// Whether an upcaster is registered for the payload's type.
    pub fn can_upcast(&self, event: &dyn AnyEvent) -> bool {
        self.upcasters.contains_key(&event.payload_type())
    }

    /// Convert `event` one step into its successor type.
    ///
    /// # Errors
    ///
    /// [`DefinitionError::NoUpcaster`] if no upcaster is registered for the
    /// payload's type.
    pub fn upcast(&self, event: &dyn AnyEvent) -> Result<Arc<dyn AnyEvent>, DefinitionError> {
        self.upcasters
            .get(&event.payload_type())
            .and_then(|upcaster| (upcaster.apply)(event))
            .ok_or(DefinitionError::NoUpcaster {
                type_name: event.type_name(),
            })
    }

    /// Follow the upcaster chain from `event` to the newest type. Payloads
    /// without an upcaster come back unchanged.
    fn upcast_to_latest(&self, mut event: Arc<dyn AnyEvent>) -> Arc<dyn AnyEvent> {
        // Each step uses a distinct upcaster, so a cycle cannot spin forever.
        for _ in 0..self.upcasters.len() {
            match self.upcast(event.as_ref()) {
                Ok(next) => event = next,
                Err(_) => break,
            }
        }
        event
    }

    /// Decode a stored event payload registered as `name` v`version`, then
    /// upcast it to the newest registered successor.
    ///
    /// # Errors
    ///
    /// Fails if nothing is registered under that name and version, or the
    /// payload does not match the registered type.
    pub fn decode_event(
        &self,
        name: &str,
        version: u32,
        payload: Value,
    ) -> Result<Arc<dyn AnyEvent>, DefinitionError> {
        let definition = self
            .events_by_name
            .get(&(name.to_owned(), version))
            .and_then(|type_id| self.events.get(type_id))
            .ok_or_else(|| DefinitionError::UnknownEvent {
                name: name.to_owned(),
                version,
            })?;
        let event = (definition.decode)(payload).map_err(|source| DefinitionError::Payload {
            name: name.to_owned(),
            source,
        })?;
        Ok(self.upcast_to_latest(event))
    }

    /// Encode a snapshot payload, returning its definition alongside the JSON.
    ///
    /// # Errors
    ///
    /// Fails if the payload type is unregistered or does not serialize.
    pub fn encode_snapshot(
        &self,
        snapshot: &dyn AnySnapshot,
    ) -> Result<(&SnapshotDefinition, Value), DefinitionError> {
        let definition =
            self.snapshot_definition_of(snapshot.payload_type(), snapshot.type_name())?;
        let payload = snapshot
            .to_json()
            .map_err(|source| DefinitionError::Payload {
                name: definition.name.clone(),
                source,
            })?;
        Ok((definition, payload))
    }

    /// Decode a stored snapshot payload registered as `name` v`version`.
    ///
    /// # Errors
    ///
    /// Fails if nothing is registered under that name and version, or the
    /// payload does not match the registered type.
    pub fn decode_snapshot(
        &self,
        name: &str,
        version: u32,
        payload: Value,
    ) -> Result<Arc<dyn AnySnapshot>, DefinitionError> {
        let definition = self
            .snapshots_by_name
            .get(&(name.to_owned(), version))
            .and_then(|type_id| self.snapshots.get(type_id))
            .ok_or_else(|| DefinitionError::UnknownSnapshot {
                name: name.to_owned(),
                version,
            })?;
        (definition.decode)(payload).map_err(|source| DefinitionError::Payload {
            name: name.to_owned(),
            source,
        })
    }
}

/// Builder for [`Definitions`].
///
/// Registering the same type twice keeps the last registration.
#[derive(Debug, Default)]
pub struct DefinitionsBuilder {
    inner: Definitions,
}

impl DefinitionsBuilder {
    /// Register event type `E` under a name and version derived from its
    /// type name: a trailing `V<n>` gives the version (default 1), then a
    /// trailing `Event` is stripped.
    pub fn event<E: AggregateEvent>(self) -> Self {
        let (name, version) = derive_name(std::any::type_name::<E>(), "Event");
        self.event_named::<E>(name, version)
    }

    /// Register event type `E` under an explicit name and version.
    pub fn event_named<E: AggregateEvent>(mut self, name: impl Into<String>, version: u32) -> Self {
        let definition = EventDefinition {
            name: name.into(),
            version,
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            decode: decode_event::<E>,
        };
        self.inner
            .events_by_name
            .insert((definition.name.clone(), version), definition.type_id);
        self.inner.events.insert(definition.type_id, definition);
        self
    }

    /// Upgrade stored `Old` events to `New` whenever they are decoded.
    ///
    /// `Old` stays registered so existing records can still be read; only
    /// `New` needs an apply method. Upcasters chain, so `V1 -> V2` and
    /// `V2 -> V3` together bring a v1 record to `V3`.
    pub fn upcast<Old: AggregateEvent, New: AggregateEvent>(
        mut self,
        upgrade: fn(Old) -> New,
    ) -> Self {
        let apply: UpcastFn = Arc::new(move |event: &dyn AnyEvent| {
            event
                .downcast_ref::<Old>()
                .map(|old| Arc::new(upgrade(old.clone())) as Arc<dyn AnyEvent>)
        });
        self.inner.upcasters.insert(
            TypeId::of::<Old>(),
            Upcaster {
                to: std::any::type_name::<New>(),
                apply,
            },
        );
        self
    }

    /// Register snapshot type `S` under a name and version derived from its
    /// type name, stripping a trailing `Snapshot`.
    pub fn snapshot<S: AggregateSnapshot>(self) -> Self {
        let (name, version) = derive_name(std::any::type_name::<S>(), "Snapshot");
        self.snapshot_named::<S>(name, version)
    }

    /// Register snapshot type `S` under an explicit name and version.
    pub fn snapshot_named<S: AggregateSnapshot>(
        mut self,
        name: impl Into<String>,
        version: u32,
    ) -> Self {
        let definition = SnapshotDefinition {
            name: name.into(),
            version,
            type_id: TypeId::of::<S>(),
            decode: decode_snapshot::<S>,
        };
        self.inner
            .snapshots_by_name
            .insert((definition.name.clone(), version), definition.type_id);
        self.inner.snapshots.insert(definition.type_id, definition);
        self
    }

    /// Finish the registry.
    pub fn build(self) -> Definitions {
        self.inner
    }
}

fn decode_event<E: AggregateEvent>(value: Value) -> serde_json::Result<Arc<dyn AnyEvent>> {
    Ok(Arc::new(serde_json::from_value::<E>(value)?))
}

fn decode_snapshot<S: AggregateSnapshot>(value: Value) -> serde_json::Result<Arc<dyn AnySnapshot>> {
    Ok(Arc::new(serde_json::from_value::<S>(value)?))
}

/// Turn `my_crate::events::ItemAddedEventV2` into `("ItemAdded", 2)`.
fn derive_name(type_name: &str, suffix: &str) -> (String, u32) {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let short = base.rsplit("::").next().unwrap_or(base);

    let mut name = short;
    let mut version = 1;
    if let Some(pos) = short.rfind('V') {
        let digits = &short[pos + 1..];
        if pos > 0
            && !digits.is_empty()
            && digits.bytes().all(|b| b.is_ascii_digit())
            && let Ok(parsed) = digits.parse::<u32>()
        {
            name = &short[..pos];
            version = parsed;
        }
    }

    let name = match name.strip_suffix(suffix) {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    };
    (name.to_owned(), version)
}
