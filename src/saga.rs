//! Sagas: event-sourced hosts that react to other hosts' events.
//!
//! A saga declares which `(identity type, event type)` pairs it reacts to by
//! implementing [`SagaHandles<I, E>`] once per pair and listing the pairs in
//! [`Saga::handlers`]. The store subscribes each saga type to exactly those
//! event types, locates the saga instance for every notification, and hands
//! the notification to that instance's host as the *pinned* event.
//!
//! While a handler runs, the pinned event is reachable through the
//! [`SagaContext`] it receives. Events the saga emits take their causal
//! metadata from the pinned event; commands it publishes inherit the pinned
//! event's correlation ids and bag values plus the saga's own identity.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::aggregate::{Aggregate, Batch, Emitter};
use crate::apply::ApplyMethods;
use crate::command::CommandEnvelope;
use crate::event::{AggregateEvent, AnyDomainEvent, DomainEvent};
use crate::identity::{Identity, SourceId};
use crate::metadata::{CommandMetadata, EventMetadata};
use crate::snapshot::AnySnapshot;
use crate::source_ids::DEFAULT_SOURCE_ID_HISTORY;
use crate::strategy::{NeverSnapshot, SnapshotStrategy};

/// A long-running, event-sourced process coordinating several aggregates.
///
/// Like an [`Aggregate`], the implementing type is the saga's state and is
/// rebuilt by folding its own committed events. A saga that registers no
/// apply methods is stateless: it only publishes commands.
pub trait Saga: Default + Clone + fmt::Debug + Send + Sync + 'static {
    /// Saga type name, used as its stream name.
    const NAME: &'static str;

    /// Identity type addressing saga instances.
    type Identity: Identity;

    /// Error a handler may fail with. Failures are logged; the triggering
    /// event is not retried.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The events this saga reacts to.
    fn handlers() -> SagaHandlers<Self>;

    /// Fold functions for the saga's own events. Empty by default.
    fn apply_methods() -> ApplyMethods<Self> {
        ApplyMethods::new()
    }

    /// Capture the current state as a snapshot payload.
    fn create_snapshot(&self) -> Option<Box<dyn AnySnapshot>> {
        None
    }

    /// When to capture snapshots. Defaults to never.
    fn snapshot_strategy() -> Arc<dyn SnapshotStrategy> {
        Arc::new(NeverSnapshot)
    }

    /// How many recently handled events each instance remembers.
    fn source_id_history() -> usize {
        DEFAULT_SOURCE_ID_HISTORY
    }
}

/// Reaction of saga `Self` to event `E` committed by an `I`-identified host.
pub trait SagaHandles<I: Identity, E: AggregateEvent>: Saga {
    /// Which saga instance handles `event`. `None` ignores the event.
    fn locate(event: &DomainEvent<I, E>) -> Option<Self::Identity>;

    /// React to `event`, emitting saga events and publishing commands
    /// through `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the saga's error to abandon the reaction. Nothing recorded
    /// on `ctx` is committed or published in that case.
    fn handle(
        &self,
        event: &DomainEvent<I, E>,
        ctx: &mut SagaContext<'_>,
    ) -> Result<(), Self::Error>;
}

type LocateFn<S> = fn(&AnyDomainEvent) -> Option<<S as Saga>::Identity>;
type HandleFn<S> =
    fn(&S, &AnyDomainEvent, &mut SagaContext<'_>) -> Result<(), <S as Saga>::Error>;

struct Route<S: Saga> {
    locate: LocateFn<S>,
    handle: HandleFn<S>,
}

/// Routing table from `(identity type, event type)` to a saga's handlers.
///
/// Built once per saga type by [`Saga::handlers`].
pub struct SagaHandlers<S: Saga> {
    routes: HashMap<(TypeId, TypeId), Route<S>>,
}

impl<S: Saga> SagaHandlers<S> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// React to `E` events committed by `I`-identified hosts.
    pub fn on<I, E>(mut self) -> Self
    where
        I: Identity,
        E: AggregateEvent,
        S: SagaHandles<I, E>,
    {
        self.routes.insert(
            (TypeId::of::<I>(), TypeId::of::<E>()),
            Route {
                locate: locate_erased::<S, I, E>,
                handle: handle_erased::<S, I, E>,
            },
        );
        self
    }

    /// Distinct event types the saga subscribes to.
    pub fn event_types(&self) -> Vec<TypeId> {
        let types: HashSet<TypeId> = self.routes.keys().map(|(_, event)| *event).collect();
        types.into_iter().collect()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn route(&self, event: &AnyDomainEvent) -> Option<&Route<S>> {
        self.routes.get(&(event.identity_type(), event.event_type()))
    }

    /// The saga instance responsible for `event`, if any.
    pub(crate) fn locate(&self, event: &AnyDomainEvent) -> Option<S::Identity> {
        self.route(event).and_then(|route| (route.locate)(event))
    }

    /// Run the matching handler. `None` when no route matches.
    pub(crate) fn handle(
        &self,
        saga: &S,
        event: &AnyDomainEvent,
        ctx: &mut SagaContext<'_>,
    ) -> Option<Result<(), S::Error>> {
        self.route(event).map(|route| (route.handle)(saga, event, ctx))
    }
}

impl<S: Saga> Default for SagaHandlers<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Saga> fmt::Debug for SagaHandlers<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaHandlers")
            .field("saga", &S::NAME)
            .field("routes", &self.routes.len())
            .finish()
    }
}

fn locate_erased<S, I, E>(event: &AnyDomainEvent) -> Option<S::Identity>
where
    S: SagaHandles<I, E>,
    I: Identity,
    E: AggregateEvent,
{
    S::locate(&event.downcast::<I, E>()?)
}

fn handle_erased<S, I, E>(
    saga: &S,
    event: &AnyDomainEvent,
    ctx: &mut SagaContext<'_>,
) -> Result<(), S::Error>
where
    S: SagaHandles<I, E>,
    I: Identity,
    E: AggregateEvent,
{
    match event.downcast::<I, E>() {
        Some(typed) => saga.handle(&typed, ctx),
        None => Ok(()),
    }
}

/// What a saga handler can do while reacting to one pinned event.
pub struct SagaContext<'a> {
    saga_id: &'a str,
    pinned: &'a AnyDomainEvent,
    emitter: Emitter,
    commands: Vec<CommandEnvelope>,
}

impl<'a> SagaContext<'a> {
    pub(crate) fn new(saga_id: &'a str, pinned: &'a AnyDomainEvent) -> Self {
        Self {
            saga_id,
            pinned,
            emitter: Emitter::default(),
            commands: Vec::new(),
        }
    }

    /// Identity value of the saga instance handling the event.
    pub fn saga_id(&self) -> &str {
        self.saga_id
    }

    /// The event being handled.
    pub fn pinned_event(&self) -> &AnyDomainEvent {
        self.pinned
    }

    /// Record a saga event as its own batch.
    pub fn emit<E: AggregateEvent>(&mut self, event: E) {
        self.emitter.emit(event);
    }

    /// Record a saga event with extra metadata.
    pub fn emit_with<E: AggregateEvent>(&mut self, event: E, metadata: EventMetadata) {
        self.emitter.emit_with(event, metadata);
    }

    /// Record an atomic batch of saga events.
    pub fn emit_all(&mut self, batch: Batch) {
        self.emitter.emit_all(batch);
    }

    /// Publish a command to aggregate `A` once the saga's events commit.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    pub fn publish_command<A: Aggregate>(
        &mut self,
        identity: A::Identity,
        payload: A::Command,
    ) -> serde_json::Result<()> {
        self.publish_command_with::<A>(identity, payload, CommandMetadata::default())
    }

    /// Publish a command with caller-supplied metadata.
    ///
    /// The pinned event's correlation ids and bag values are merged in, the
    /// saga identity is added as a correlation id, and a command without a
    /// source id gets one derived from the pinned event id and the command's
    /// position among this reaction's commands.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload cannot be serialized.
    pub fn publish_command_with<A: Aggregate>(
        &mut self,
        identity: A::Identity,
        payload: A::Command,
        mut metadata: CommandMetadata,
    ) -> serde_json::Result<()> {
        let command = serde_json::to_value(&payload)?;
        metadata.merge_event(self.pinned.metadata());
        metadata = metadata.with_correlation_id(self.saga_id);
        if metadata.source_id.is_none() {
            metadata.source_id = Some(SourceId::derived(
                self.pinned.metadata().event_id,
                self.commands.len(),
            ));
        }
        self.commands.push(CommandEnvelope {
            aggregate_name: A::NAME.to_owned(),
            identity: identity.value().to_owned(),
            command,
            metadata,
        });
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Emitter, Vec<CommandEnvelope>) {
        (self.emitter, self.commands)
    }
}

impl fmt::Debug for SagaContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaContext")
            .field("saga_id", &self.saga_id)
            .field("pinned", &self.pinned.metadata().event_id)
            .field("events", &self.emitter.event_count())
            .field("commands", &self.commands.len())
            .finish()
    }
}
