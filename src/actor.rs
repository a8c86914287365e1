//! Host tasks and the handles that talk to them.
//!
//! Each aggregate or saga instance runs as one tokio task that exclusively
//! owns its [`Host`] and processes messages from a bounded `mpsc` mailbox in
//! arrival order. Callers hold cheap, cloneable handles and receive replies
//! over `oneshot` channels.
//!
//! Public API: [`AggregateHandle`] and [`SagaHandle`]. Tasks are spawned by
//! the [`AggregateStore`](crate::AggregateStore).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::aggregate::{Aggregate, Emitter};
use crate::command::{CommandBus, Executed, Outcome};
use crate::error::{ExecuteError, RecoveryError, StateError};
use crate::event::AnyDomainEvent;
use crate::host::{Host, HostConfig, HostRuntime};
use crate::identity::{Identity, SourceId};
use crate::metadata::{CommandMetadata, EventMetadata};
use crate::saga::{Saga, SagaContext, SagaHandlers};

/// Default mailbox size per host.
pub(crate) const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Configuration for host task loops.
///
/// Internal to the crate; callers configure it through
/// [`AggregateStoreBuilder`](crate::AggregateStoreBuilder).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorConfig {
    /// How long a task waits for a message before shutting down. `None`
    /// keeps it running until every handle is dropped.
    pub idle_timeout: Option<Duration>,
    /// Bounded mailbox capacity.
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Result type sent back through the `Execute` reply channel.
type ExecuteResult<E> = Result<Executed, ExecuteError<E>>;

/// Messages sent from [`AggregateHandle`] to the aggregate task.
pub(crate) enum AggregateMessage<A: Aggregate> {
    /// Execute a command against the aggregate.
    Execute {
        command: A::Command,
        metadata: CommandMetadata,
        reply: oneshot::Sender<ExecuteResult<A::Error>>,
    },
    /// Retrieve a clone of the current state and its version.
    GetState { reply: oneshot::Sender<(A, u64)> },
}

/// Messages sent from [`SagaHandle`] to the saga task.
pub(crate) enum SagaMessage<S: Saga> {
    /// Handle a domain event. `reply` is `None` for fire-and-forget delivery.
    Handle {
        event: AnyDomainEvent,
        reply: Option<oneshot::Sender<ExecuteResult<S::Error>>>,
    },
    GetState { reply: oneshot::Sender<(S, u64)> },
}

/// Wait for the next message, honouring the idle timeout.
async fn next_message<M>(
    rx: &mut mpsc::Receiver<M>,
    idle_timeout: Option<Duration>,
    name: &'static str,
) -> Option<M> {
    let Some(timeout) = idle_timeout else {
        return rx.recv().await;
    };
    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(msg) => msg,
        Err(_elapsed) => {
            tracing::info!(aggregate = name, "host idle, shutting down");
            None
        }
    }
}

/// Runs the aggregate task loop.
///
/// The loop exits when every handle is dropped, the idle timeout elapses,
/// or a command hits a configuration defect.
async fn run_aggregate<A: Aggregate>(
    mut host: Host<A, A::Identity>,
    mut rx: mpsc::Receiver<AggregateMessage<A>>,
    idle_timeout: Option<Duration>,
) {
    while let Some(msg) = next_message(&mut rx, idle_timeout, A::NAME).await {
        match msg {
            AggregateMessage::Execute {
                command,
                metadata,
                reply,
            } => {
                let span = tracing::info_span!(
                    "execute",
                    aggregate = A::NAME,
                    id = %host.identity()
                );
                let result = execute_command::<A>(&mut host, command, metadata)
                    .instrument(span)
                    .await;
                let fatal = result.as_ref().is_err_and(ExecuteError::is_fatal);
                // The caller may have stopped waiting; that is fine.
                let _ = reply.send(result);
                if fatal {
                    tracing::error!(
                        aggregate = A::NAME,
                        id = %host.identity(),
                        "stopping host after configuration error"
                    );
                    break;
                }
            }
            AggregateMessage::GetState { reply } => {
                let _ = reply.send((host.state().clone(), host.version()));
            }
        }
    }
}

/// Run one command: de-duplicate, decide, then commit batches in order.
async fn execute_command<A: Aggregate>(
    host: &mut Host<A, A::Identity>,
    command: A::Command,
    metadata: CommandMetadata,
) -> ExecuteResult<A::Error> {
    if let Some(source_id) = &metadata.source_id
        && host.has_seen(source_id)
    {
        tracing::debug!(source_id = %source_id, "duplicate command acknowledged");
        return Ok(Executed::AlreadyApplied);
    }

    let mut emitter = Emitter::default();
    host.state()
        .handle(command, &mut emitter)
        .map_err(ExecuteError::Domain)?;

    let from_version = host.version();
    let causal = EventMetadata::from_command(&metadata);
    commit_batches(host, &causal, emitter, metadata.source_id).await?;

    if host.version() > from_version {
        tracing::info!(
            from_version,
            to_version = host.version(),
            "events committed"
        );
    }
    Ok(Executed::Applied {
        from_version,
        to_version: host.version(),
    })
}

/// Commit each recorded batch in order, then remember `source_id`.
///
/// A batch is committed only after the previous one was persisted and
/// folded. When a later batch fails the earlier ones stay committed and the
/// source id is still recorded, matching what recovery would rebuild.
async fn commit_batches<S, I, E>(
    host: &mut Host<S, I>,
    causal: &EventMetadata,
    emitter: Emitter,
    source_id: Option<SourceId>,
) -> Result<(), ExecuteError<E>>
where
    S: Send + Sync + 'static,
    I: Identity,
    E: std::error::Error + Send + Sync + 'static,
{
    let from_version = host.version();
    for batch in emitter.into_batches() {
        if let Err(e) = host.commit(causal, batch).await {
            if host.version() > from_version
                && let Some(source_id) = source_id
            {
                host.remember(source_id);
            }
            return Err(e.into());
        }
    }
    if let Some(source_id) = source_id {
        host.remember(source_id);
    }
    Ok(())
}

/// Async handle to a running aggregate host.
///
/// Lightweight, cloneable, and `Send + Sync`. Communicates with the host
/// task over a bounded channel.
#[derive(Debug)]
pub struct AggregateHandle<A: Aggregate> {
    sender: mpsc::Sender<AggregateMessage<A>>,
    identity: A::Identity,
}

impl<A: Aggregate> Clone for AggregateHandle<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<A: Aggregate> AggregateHandle<A> {
    /// Send a command to the aggregate and wait for the result.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] - the aggregate rejected the command.
    /// * [`ExecuteError::Persistence`] - the journal failed to persist a batch.
    /// * [`ExecuteError::Apply`], [`ExecuteError::Definition`],
    ///   [`ExecuteError::Invariant`] - configuration defects.
    /// * [`ExecuteError::ActorGone`] - the host task has exited.
    pub async fn execute(
        &self,
        command: A::Command,
        metadata: CommandMetadata,
    ) -> ExecuteResult<A::Error> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AggregateMessage::Execute {
                command,
                metadata,
                reply: tx,
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// A clone of the current aggregate state.
    ///
    /// # Errors
    ///
    /// [`StateError::ActorGone`] if the host task has exited.
    pub async fn state(&self) -> Result<A, StateError> {
        Ok(self.snapshot().await?.0)
    }

    /// The host's current version.
    ///
    /// # Errors
    ///
    /// [`StateError::ActorGone`] if the host task has exited.
    pub async fn version(&self) -> Result<u64, StateError> {
        Ok(self.snapshot().await?.1)
    }

    async fn snapshot(&self) -> Result<(A, u64), StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AggregateMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)
    }

    /// The identity this handle addresses.
    pub fn identity(&self) -> &A::Identity {
        &self.identity
    }

    /// Whether the host task is still running.
    ///
    /// The store uses this to evict stale handles and respawn the host on
    /// the next lookup.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Recover an aggregate host and start its task.
///
/// # Errors
///
/// Returns [`RecoveryError`] if the host cannot be rebuilt; no task is
/// started in that case.
pub(crate) async fn spawn_aggregate<A: Aggregate>(
    identity: A::Identity,
    config: HostConfig<A>,
    runtime: Arc<HostRuntime>,
    actor: ActorConfig,
) -> Result<AggregateHandle<A>, RecoveryError> {
    let host = Host::recover(identity.clone(), config, runtime).await?;
    let (tx, rx) = mpsc::channel(actor.mailbox_capacity.max(1));
    tokio::spawn(run_aggregate::<A>(host, rx, actor.idle_timeout));
    Ok(AggregateHandle {
        sender: tx,
        identity,
    })
}

/// Collaborators a saga task needs beyond its host.
pub(crate) struct SagaWiring<S: Saga> {
    pub(crate) handlers: Arc<SagaHandlers<S>>,
    pub(crate) bus: Arc<dyn CommandBus>,
}

async fn run_saga<S: Saga>(
    mut host: Host<S, S::Identity>,
    wiring: SagaWiring<S>,
    mut rx: mpsc::Receiver<SagaMessage<S>>,
    idle_timeout: Option<Duration>,
) {
    while let Some(msg) = next_message(&mut rx, idle_timeout, S::NAME).await {
        match msg {
            SagaMessage::Handle { event, reply } => {
                let span = tracing::info_span!(
                    "saga",
                    saga = S::NAME,
                    id = %host.identity(),
                    event = event.event().type_name()
                );
                let result = handle_event::<S>(&mut host, &wiring, event)
                    .instrument(span)
                    .await;
                let fatal = result.as_ref().is_err_and(ExecuteError::is_fatal);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = &result {
                            tracing::warn!(saga = S::NAME, error = %e, "saga reaction failed");
                        }
                    }
                }
                if fatal {
                    tracing::error!(
                        saga = S::NAME,
                        id = %host.identity(),
                        "stopping saga after configuration error"
                    );
                    break;
                }
            }
            SagaMessage::GetState { reply } => {
                let _ = reply.send((host.state().clone(), host.version()));
            }
        }
    }
}

/// React to one pinned event: de-duplicate by event id, run the handler,
/// commit the saga's own events, then publish its commands.
async fn handle_event<S: Saga>(
    host: &mut Host<S, S::Identity>,
    wiring: &SagaWiring<S>,
    event: AnyDomainEvent,
) -> ExecuteResult<S::Error> {
    let source_id = SourceId::from_event_id(event.metadata().event_id);
    if host.has_seen(&source_id) {
        tracing::debug!(source_id = %source_id, "duplicate event acknowledged");
        return Ok(Executed::AlreadyApplied);
    }

    let from_version = host.version();
    let saga_id = host.identity().value().to_owned();
    let mut ctx = SagaContext::new(&saga_id, &event);
    match wiring.handlers.handle(host.state(), &event, &mut ctx) {
        Some(result) => result.map_err(ExecuteError::Domain)?,
        None => {
            return Ok(Executed::Applied {
                from_version,
                to_version: from_version,
            });
        }
    }
    let (emitter, commands) = ctx.into_parts();

    let causal = EventMetadata::caused_by(event.metadata());
    commit_batches(host, &causal, emitter, Some(source_id)).await?;

    for envelope in commands {
        let target = format!("{}/{}", envelope.aggregate_name, envelope.identity);
        let result = wiring.bus.dispatch(envelope).await;
        if let Outcome::Failed { kind, message } = &result.outcome {
            tracing::warn!(
                saga = S::NAME,
                target = %target,
                ?kind,
                message = %message,
                "saga command failed"
            );
        }
    }

    Ok(Executed::Applied {
        from_version,
        to_version: host.version(),
    })
}

/// Async handle to a running saga host.
#[derive(Debug)]
pub struct SagaHandle<S: Saga> {
    sender: mpsc::Sender<SagaMessage<S>>,
    identity: S::Identity,
}

impl<S: Saga> Clone for SagaHandle<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            identity: self.identity.clone(),
        }
    }
}

impl<S: Saga> SagaHandle<S> {
    /// Hand `event` to the saga and wait for its reaction to finish,
    /// including dispatch of any commands it published.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Domain`] - the saga's handler failed.
    /// * [`ExecuteError::Persistence`] - the saga's events were not persisted.
    /// * [`ExecuteError::ActorGone`] - the saga task has exited.
    pub async fn handle(&self, event: AnyDomainEvent) -> ExecuteResult<S::Error> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SagaMessage::Handle {
                event,
                reply: Some(tx),
            })
            .await
            .map_err(|_| ExecuteError::ActorGone)?;
        rx.await.map_err(|_| ExecuteError::ActorGone)?
    }

    /// Queue `event` without waiting for the reaction.
    pub(crate) async fn deliver(&self, event: AnyDomainEvent) -> Result<(), StateError> {
        self.sender
            .send(SagaMessage::Handle { event, reply: None })
            .await
            .map_err(|_| StateError::ActorGone)
    }

    /// A clone of the current saga state.
    ///
    /// # Errors
    ///
    /// [`StateError::ActorGone`] if the saga task has exited.
    pub async fn state(&self) -> Result<S, StateError> {
        Ok(self.snapshot().await?.0)
    }

    /// The saga host's current version.
    ///
    /// # Errors
    ///
    /// [`StateError::ActorGone`] if the saga task has exited.
    pub async fn version(&self) -> Result<u64, StateError> {
        Ok(self.snapshot().await?.1)
    }

    async fn snapshot(&self) -> Result<(S, u64), StateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SagaMessage::GetState { reply: tx })
            .await
            .map_err(|_| StateError::ActorGone)?;
        rx.await.map_err(|_| StateError::ActorGone)
    }

    /// The saga identity this handle addresses.
    pub fn identity(&self) -> &S::Identity {
        &self.identity
    }

    /// Whether the saga task is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Recover a saga host and start its task.
///
/// # Errors
///
/// Returns [`RecoveryError`] if the host cannot be rebuilt.
pub(crate) async fn spawn_saga<S: Saga>(
    identity: S::Identity,
    config: HostConfig<S>,
    wiring: SagaWiring<S>,
    runtime: Arc<HostRuntime>,
    actor: ActorConfig,
) -> Result<SagaHandle<S>, RecoveryError> {
    let host = Host::recover(identity.clone(), config, runtime).await?;
    let (tx, rx) = mpsc::channel(actor.mailbox_capacity.max(1));
    tokio::spawn(run_saga::<S>(host, wiring, rx, actor.idle_timeout));
    Ok(SagaHandle {
        sender: tx,
        identity,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::aggregate::test_fixtures::{ItemAdded, ListCommand, ListError, ListId, ShoppingList};
    use crate::command::{CommandEnvelope, ExecutionResult};
    use crate::event::CommittedEvent;
    use crate::host::test_fixtures::{FailingJournal, list_config, runtime, runtime_with};
    use crate::journal::{InMemoryJournal, StreamId};
    use crate::saga::test_fixtures::{ListWatcher, WatcherId, definitions};
    use crate::snapshot_store::InMemorySnapshotStore;
    use crate::strategy::NeverSnapshot;
    use crate::subscribers::EventStream;

    fn id() -> ListId {
        ListId::new("l-1").unwrap()
    }

    async fn spawn_list(runtime: Arc<HostRuntime>, actor: ActorConfig) -> AggregateHandle<ShoppingList> {
        spawn_aggregate::<ShoppingList>(id(), list_config(Arc::new(NeverSnapshot)), runtime, actor)
            .await
            .expect("spawn should succeed")
    }

    fn create() -> ListCommand {
        ListCommand::Create {
            owner: "ana".into(),
        }
    }

    fn add(name: &str) -> ListCommand {
        ListCommand::AddItem { name: name.into() }
    }

    #[tokio::test]
    async fn execute_commands_in_order() {
        let handle = spawn_list(runtime(), ActorConfig::default()).await;

        let created = handle
            .execute(create(), CommandMetadata::with_new_source_id())
            .await
            .unwrap();
        assert_eq!(
            created,
            Executed::Applied {
                from_version: 0,
                to_version: 1
            }
        );
        for name in ["a", "b", "c"] {
            handle
                .execute(add(name), CommandMetadata::with_new_source_id())
                .await
                .unwrap();
        }

        let state = handle.state().await.unwrap();
        assert_eq!(state.items, vec!["a", "b", "c"]);
        assert_eq!(handle.version().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn repeated_source_id_is_already_applied() {
        let runtime = runtime();
        let handle = spawn_list(Arc::clone(&runtime), ActorConfig::default()).await;
        let meta = CommandMetadata::default().with_source_id(SourceId::new("cmd-1").unwrap());

        handle.execute(create(), meta.clone()).await.unwrap();
        let again = handle.execute(create(), meta).await.unwrap();

        assert_eq!(again, Executed::AlreadyApplied);
        assert_eq!(handle.version().await.unwrap(), 1);
        let events = runtime
            .journal
            .read_from(&StreamId::new("shopping-list", "l-1"), 0)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn domain_rejection_changes_nothing() {
        let handle = spawn_list(runtime(), ActorConfig::default()).await;
        let err = handle
            .execute(add("a"), CommandMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Domain(ListError::NotCreated)));
        assert_eq!(handle.version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn creating_twice_is_rejected() {
        let handle = spawn_list(runtime(), ActorConfig::default()).await;
        handle
            .execute(create(), CommandMetadata::default())
            .await
            .unwrap();
        let result = handle
            .execute(
                ListCommand::CreateAndAddTwo {
                    owner: "bob".into(),
                    first: "a".into(),
                    second: "b".into(),
                },
                CommandMetadata::default(),
            )
            .await;
        assert!(matches!(result, Err(ExecuteError::Domain(ListError::AlreadyCreated))));
    }

    #[tokio::test]
    async fn later_batch_failure_keeps_earlier_batches() {
        let runtime = runtime_with(
            Arc::new(FailingJournal::allowing(2)),
            Arc::new(InMemorySnapshotStore::new()),
        );
        let handle = spawn_list(runtime, ActorConfig::default()).await;
        handle
            .execute(create(), CommandMetadata::default())
            .await
            .unwrap();

        let meta = CommandMetadata::default().with_source_id(SourceId::new("two").unwrap());
        let err = handle
            .execute(
                ListCommand::AddTwoSeparately {
                    first: "a".into(),
                    second: "b".into(),
                },
                meta.clone(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ExecuteError::Persistence(_)));
        let state = handle.state().await.unwrap();
        assert_eq!(state.items, vec!["a"]);
        assert_eq!(handle.version().await.unwrap(), 2);
        // The committed first batch carries the source id, so a retry is a duplicate.
        let retry = handle
            .execute(
                ListCommand::AddTwoSeparately {
                    first: "a".into(),
                    second: "b".into(),
                },
                meta,
            )
            .await
            .unwrap();
        assert_eq!(retry, Executed::AlreadyApplied);
    }

    #[tokio::test]
    async fn missing_apply_method_stops_the_host() {
        let handle = spawn_list(runtime(), ActorConfig::default()).await;
        handle
            .execute(create(), CommandMetadata::default())
            .await
            .unwrap();

        let err = handle
            .execute(
                ListCommand::RemoveItem { name: "a".into() },
                CommandMetadata::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecuteError::Apply(_)));
        assert!(matches!(handle.state().await, Err(StateError::ActorGone)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_host_shuts_down() {
        let actor = ActorConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ActorConfig::default()
        };
        let handle = spawn_list(runtime(), actor).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!handle.is_alive());
        assert!(matches!(
            handle.execute(create(), CommandMetadata::default()).await,
            Err(ExecuteError::ActorGone)
        ));
    }

    #[tokio::test]
    async fn respawned_host_recovers_state() {
        let runtime = runtime();
        let handle = spawn_list(Arc::clone(&runtime), ActorConfig::default()).await;
        handle
            .execute(create(), CommandMetadata::default())
            .await
            .unwrap();
        handle
            .execute(add("a"), CommandMetadata::default())
            .await
            .unwrap();
        drop(handle);

        let again = spawn_list(runtime, ActorConfig::default()).await;
        assert_eq!(again.version().await.unwrap(), 2);
        assert_eq!(again.state().await.unwrap().items, vec!["a"]);
    }

    #[derive(Default)]
    struct RecordingBus {
        received: Mutex<Vec<CommandEnvelope>>,
    }

    #[async_trait]
    impl CommandBus for RecordingBus {
        async fn dispatch(&self, envelope: CommandEnvelope) -> ExecutionResult {
            let source_id = envelope.metadata.source_id.clone();
            self.received
                .lock()
                .unwrap()
                .push(envelope);
            ExecutionResult::succeeded(source_id, Executed::AlreadyApplied)
        }
    }

    fn saga_runtime() -> Arc<HostRuntime> {
        Arc::new(HostRuntime {
            journal: Arc::new(InMemoryJournal::new()),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            definitions: Arc::new(definitions()),
            clock: crate::host::test_fixtures::clock(),
            events: EventStream::new(),
        })
    }

    fn watcher_config() -> HostConfig<ListWatcher> {
        HostConfig {
            name: ListWatcher::NAME,
            apply: Arc::new(ListWatcher::apply_methods()),
            strategy: ListWatcher::snapshot_strategy(),
            create_snapshot: |w: &ListWatcher| w.create_snapshot(),
            source_id_history: ListWatcher::source_id_history(),
        }
    }

    fn item_added(name: &str, seq: u64) -> AnyDomainEvent {
        let metadata = EventMetadata {
            event_id: crate::metadata::event_id("shopping-list", "l-1", seq),
            ..EventMetadata::default()
        }
        .with_correlation_id("req-1");
        let committed = CommittedEvent::new(
            id(),
            Arc::new(ItemAdded { name: name.into() }),
            metadata,
            crate::host::test_fixtures::clock().now(),
            seq,
        )
        .unwrap();
        AnyDomainEvent::from_committed(&committed)
    }

    async fn spawn_watcher(
        runtime: Arc<HostRuntime>,
        bus: Arc<RecordingBus>,
    ) -> SagaHandle<ListWatcher> {
        spawn_saga::<ListWatcher>(
            WatcherId::new("l-1").unwrap(),
            watcher_config(),
            SagaWiring {
                handlers: Arc::new(ListWatcher::handlers()),
                bus,
            },
            runtime,
            ActorConfig::default(),
        )
        .await
        .expect("saga should spawn")
    }

    #[tokio::test]
    async fn saga_commits_events_and_publishes_commands() {
        let runtime = saga_runtime();
        let bus = Arc::new(RecordingBus::default());
        let saga = spawn_watcher(Arc::clone(&runtime), Arc::clone(&bus)).await;

        let result = saga.handle(item_added("milk", 2)).await.unwrap();
        assert_eq!(
            result,
            Executed::Applied {
                from_version: 0,
                to_version: 1
            }
        );
        assert_eq!(saga.state().await.unwrap().noted, vec!["milk"]);

        let received = bus.received.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].aggregate_name, "shopping-list");
        assert_eq!(received[0].metadata.correlation_ids, vec!["req-1", "l-1"]);

        let saga_events = runtime
            .journal
            .read_from(&StreamId::new("list-watcher", "l-1"), 0)
            .await
            .unwrap();
        let pinned_id = crate::metadata::event_id("shopping-list", "l-1", 2);
        assert_eq!(
            saga_events[0].metadata.source_id,
            Some(SourceId::from_event_id(pinned_id))
        );
        assert_eq!(saga_events[0].metadata.correlation_ids, vec!["req-1"]);
    }

    #[tokio::test]
    async fn saga_ignores_redelivered_events_even_after_restart() {
        let runtime = saga_runtime();
        let bus = Arc::new(RecordingBus::default());
        let saga = spawn_watcher(Arc::clone(&runtime), Arc::clone(&bus)).await;

        saga.handle(item_added("bread", 2)).await.unwrap();
        let again = saga.handle(item_added("bread", 2)).await.unwrap();
        assert_eq!(again, Executed::AlreadyApplied);
        drop(saga);

        let restarted = spawn_watcher(runtime, bus).await;
        let after_restart = restarted.handle(item_added("bread", 2)).await.unwrap();
        assert_eq!(after_restart, Executed::AlreadyApplied);
        assert_eq!(restarted.state().await.unwrap().noted, vec!["bread"]);
    }

    #[tokio::test]
    async fn delivered_events_are_processed_in_order() {
        let bus = Arc::new(RecordingBus::default());
        let saga = spawn_watcher(saga_runtime(), bus).await;

        for (seq, name) in [(2, "a"), (3, "b"), (4, "c")] {
            saga.deliver(item_added(name, seq)).await.unwrap();
        }
        assert_eq!(saga.state().await.unwrap().noted, vec!["a", "b", "c"]);
        assert_eq!(saga.version().await.unwrap(), 3);
    }
}
