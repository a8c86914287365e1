//! Top-level entry point that composes host spawning, handle caching,
//! command routing and saga subscriptions into a single [`AggregateStore`].
//!
//! The store is opened via [`AggregateStoreBuilder`], which wires the event
//! journal, snapshot store, definitions registry and clock shared by every
//! host, and registers the aggregate and saga types the command bus and the
//! saga managers know about.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use crate::actor::{
    ActorConfig, AggregateHandle, DEFAULT_MAILBOX_CAPACITY, SagaHandle, SagaWiring,
    spawn_aggregate, spawn_saga,
};
use crate::aggregate::Aggregate;
use crate::clock::{Clock, SystemClock};
use crate::command::{
    Command, CommandBus, CommandEnvelope, Executed, ExecutionResult, FailureKind,
};
use crate::definitions::Definitions;
use crate::error::{DispatchError, ExecuteError, RecoveryError};
use crate::event::AnyDomainEvent;
use crate::host::{HostConfig, HostRuntime};
use crate::identity::Identity;
use crate::journal::{EventJournal, InMemoryJournal};
use crate::metadata::CommandMetadata;
use crate::saga::{Saga, SagaHandlers};
use crate::snapshot_store::{InMemorySnapshotStore, SnapshotStore};
use crate::storage::{FileJournal, FileSnapshotStore};
use crate::strategy::SnapshotStrategy;
use crate::subscribers::{BACKLOG_WARNING, BacklogWatch, EventStream};

/// Type-erased handle cache keyed by `(TypeId, identity)`.
///
/// `TypeId` identifies the aggregate or saga type at runtime; the `String`
/// is the identity value. `Box<dyn Any + Send + Sync>` lets a single map
/// hold `AggregateHandle<A>` and `SagaHandle<S>` for any concrete type.
type HandleCache = HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>;

/// Per-type tables built once and shared by every host of that type
/// (apply methods, saga routing tables), keyed by the table's own `TypeId`.
type SharedTables = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Type-erased dispatcher map keyed by aggregate name.
pub(crate) type DispatcherMap = HashMap<String, Box<dyn AggregateDispatcher>>;

/// Default idle timeout for hosts: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Central registry that manages host lifecycles and routes commands.
///
/// Exactly one host runs per `(type, identity)` at a time. Hosts are
/// spawned lazily on first use, recovered from the journal, and evicted
/// from the cache once they idle out; the next lookup rehydrates them.
///
/// `Clone` is cheap; all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct AggregateStore {
    pub(crate) runtime: Arc<HostRuntime>,
    pub(crate) cache: Arc<RwLock<HandleCache>>,
    pub(crate) shared: Arc<Mutex<SharedTables>>,
    pub(crate) strategies: Arc<HashMap<TypeId, Arc<dyn SnapshotStrategy>>>,
    pub(crate) dispatchers: Arc<DispatcherMap>,
    pub(crate) actor: ActorConfig,
}

// Manual `Debug` because `dyn Any` is not `Debug` and the cache internals
// are not interesting.
impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("journal", &self.runtime.journal)
            .field("snapshots", &self.runtime.snapshots)
            .field("aggregates", &self.dispatchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AggregateStore {
    /// Get a handle to an aggregate instance, spawning its host if needed.
    ///
    /// If the host is already running (cached and alive), returns a clone
    /// of the existing handle. Otherwise the host is recovered from its
    /// snapshot and journal and started. The cache's write lock is held
    /// while spawning, so concurrent callers never start two hosts for one
    /// identity.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError`] if the host cannot be rebuilt.
    pub async fn get<A: Aggregate>(
        &self,
        id: &A::Identity,
    ) -> Result<AggregateHandle<A>, RecoveryError> {
        let key = (TypeId::of::<A>(), id.value().to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.cache.read().await;
            if let Some(handle) = live_handle::<AggregateHandle<A>>(&cache, &key, |h| h.is_alive())
            {
                return Ok(handle);
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(handle) = live_handle::<AggregateHandle<A>>(&cache, &key, |h| h.is_alive()) {
            return Ok(handle);
        }
        cache.remove(&key);

        tracing::debug!(aggregate = A::NAME, id = %id, "spawning host");
        let handle = spawn_aggregate::<A>(
            id.clone(),
            self.aggregate_config::<A>(),
            Arc::clone(&self.runtime),
            self.actor,
        )
        .await?;
        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// Get a handle to a saga instance, spawning its host if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryError`] if the saga host cannot be rebuilt.
    pub async fn get_saga<S: Saga>(&self, id: &S::Identity) -> Result<SagaHandle<S>, RecoveryError> {
        let key = (TypeId::of::<S>(), id.value().to_owned());

        {
            let cache = self.cache.read().await;
            if let Some(handle) = live_handle::<SagaHandle<S>>(&cache, &key, |h| h.is_alive()) {
                return Ok(handle);
            }
        }

        let mut cache = self.cache.write().await;
        if let Some(handle) = live_handle::<SagaHandle<S>>(&cache, &key, |h| h.is_alive()) {
            return Ok(handle);
        }
        cache.remove(&key);

        tracing::debug!(saga = S::NAME, id = %id, "spawning saga host");
        let wiring = SagaWiring {
            handlers: self.shared_table(S::handlers),
            bus: Arc::new(self.clone()),
        };
        let handle = spawn_saga::<S>(
            id.clone(),
            self.saga_config::<S>(),
            wiring,
            Arc::clone(&self.runtime),
            self.actor,
        )
        .await?;
        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// Execute a typed command against the aggregate `id`.
    ///
    /// # Errors
    ///
    /// [`ExecuteError::Recovery`] if the host cannot be spawned, otherwise
    /// whatever [`AggregateHandle::execute`] reports.
    pub async fn execute<A: Aggregate>(
        &self,
        id: &A::Identity,
        command: A::Command,
        metadata: CommandMetadata,
    ) -> Result<Executed, ExecuteError<A::Error>> {
        let handle = self.get::<A>(id).await?;
        handle.execute(command, metadata).await
    }

    /// Execute a [`Command`] and report the outcome as an
    /// [`ExecutionResult`] echoing its source id.
    pub async fn publish<A: Aggregate>(&self, command: Command<A>) -> ExecutionResult {
        let source_id = command.metadata.source_id.clone();
        let result = self
            .execute::<A>(&command.identity, command.payload, command.metadata)
            .await;
        ExecutionResult::from_execute(source_id, result)
    }

    /// The subscriber fan-out every host publishes folded events to.
    pub fn events(&self) -> &EventStream {
        &self.runtime.events
    }

    /// The definitions registry shared by every host.
    pub fn definitions(&self) -> &Definitions {
        &self.runtime.definitions
    }

    /// Number of cached host handles, including ones whose task idled out
    /// and has not been evicted yet.
    pub async fn cached_hosts(&self) -> usize {
        let cache = self.cache.read().await;
        cache.len()
    }

    fn aggregate_config<A: Aggregate>(&self) -> HostConfig<A> {
        HostConfig {
            name: A::NAME,
            apply: self.shared_table(A::apply_methods),
            strategy: self.strategy_for::<A>(A::snapshot_strategy),
            create_snapshot: A::create_snapshot,
            source_id_history: A::source_id_history(),
        }
    }

    fn saga_config<S: Saga>(&self) -> HostConfig<S> {
        HostConfig {
            name: S::NAME,
            apply: self.shared_table(S::apply_methods),
            strategy: self.strategy_for::<S>(S::snapshot_strategy),
            create_snapshot: S::create_snapshot,
            source_id_history: S::source_id_history(),
        }
    }

    fn strategy_for<T: 'static>(
        &self,
        default: fn() -> Arc<dyn SnapshotStrategy>,
    ) -> Arc<dyn SnapshotStrategy> {
        self.strategies
            .get(&TypeId::of::<T>())
            .cloned()
            .unwrap_or_else(default)
    }

    /// The table of type `T`, building it with `init` on first use.
    fn shared_table<T: Send + Sync + 'static>(&self, init: fn() -> T) -> Arc<T> {
        let mut tables = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(table) = tables.get(&TypeId::of::<T>())
            && let Ok(table) = Arc::clone(table).downcast::<T>()
        {
            return table;
        }
        let table = Arc::new(init());
        tables.insert(TypeId::of::<T>(), table.clone());
        table
    }

    /// Hand `event` to saga `id`, respawning the host once if it idled out
    /// between lookup and delivery.
    async fn deliver_to_saga<S: Saga>(
        &self,
        id: &S::Identity,
        event: AnyDomainEvent,
    ) -> Result<(), RecoveryError> {
        let handle = self.get_saga::<S>(id).await?;
        if handle.deliver(event.clone()).await.is_ok() {
            return Ok(());
        }
        let handle = self.get_saga::<S>(id).await?;
        if handle.deliver(event).await.is_err() {
            tracing::warn!(saga = S::NAME, id = %id, "saga host unavailable, event dropped");
        }
        Ok(())
    }
}

/// Clone the cached handle under `key` if it is of type `H` and alive.
fn live_handle<H: Clone + 'static>(
    cache: &HandleCache,
    key: &(TypeId, String),
    is_alive: impl Fn(&H) -> bool,
) -> Option<H> {
    cache
        .get(key)
        .and_then(|boxed| boxed.downcast_ref::<H>())
        .filter(|handle| is_alive(handle))
        .cloned()
}

#[async_trait]
impl CommandBus for AggregateStore {
    async fn dispatch(&self, envelope: CommandEnvelope) -> ExecutionResult {
        match self.dispatchers.get(&envelope.aggregate_name) {
            Some(dispatcher) => dispatcher.dispatch(self, envelope).await,
            None => {
                let err = DispatchError::UnknownAggregate(envelope.aggregate_name);
                tracing::warn!(error = %err, "command not routed");
                ExecutionResult::failed(
                    envelope.metadata.source_id,
                    FailureKind::Configuration,
                    err.to_string(),
                )
            }
        }
    }
}

/// Type-erased interface for dispatching [`CommandEnvelope`]s to an
/// aggregate type.
///
/// Each concrete `TypedDispatcher<A>` decodes the identity and the JSON
/// command payload and executes it through the store's `get::<A>` handle.
#[async_trait]
pub(crate) trait AggregateDispatcher: Send + Sync {
    /// Dispatch a command envelope to the target aggregate.
    async fn dispatch(&self, store: &AggregateStore, envelope: CommandEnvelope)
    -> ExecutionResult;
}

/// Concrete dispatcher for a specific aggregate type `A`.
struct TypedDispatcher<A: Aggregate> {
    _marker: PhantomData<A>,
}

impl<A: Aggregate> TypedDispatcher<A> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: Aggregate> AggregateDispatcher for TypedDispatcher<A> {
    async fn dispatch(
        &self,
        store: &AggregateStore,
        envelope: CommandEnvelope,
    ) -> ExecutionResult {
        let source_id = envelope.metadata.source_id.clone();
        let decoded = A::Identity::from_value(envelope.identity)
            .map_err(DispatchError::from)
            .and_then(|identity| {
                let command: A::Command = serde_json::from_value(envelope.command)?;
                Ok((identity, command))
            });
        let (identity, command) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(aggregate = A::NAME, error = %err, "command envelope rejected");
                return ExecutionResult::failed(
                    source_id,
                    FailureKind::Deserialization,
                    err.to_string(),
                );
            }
        };
        let result = store
            .execute::<A>(&identity, command, envelope.metadata)
            .await;
        ExecutionResult::from_execute(source_id, result)
    }
}

/// Factory for creating a type-erased aggregate dispatcher.
type DispatcherFactory = Box<dyn FnOnce() -> Box<dyn AggregateDispatcher> + Send>;

/// Subscribes a saga type to the event stream and starts its manager task.
type SagaFactory = Box<dyn FnOnce(&AggregateStore) + Send>;

/// Routes every notification a saga type subscribes to into the saga
/// instance that `locate` picks.
async fn run_saga_manager<S: Saga>(
    store: AggregateStore,
    handlers: Arc<SagaHandlers<S>>,
    mut events: mpsc::UnboundedReceiver<AnyDomainEvent>,
) {
    let mut backlog = BacklogWatch::new(BACKLOG_WARNING);
    while let Some(event) = events.recv().await {
        let queued = events.len();
        if backlog.observe(queued) {
            tracing::warn!(saga = S::NAME, queued, "saga is falling behind its event stream");
        }
        let Some(saga_id) = handlers.locate(&event) else {
            continue;
        };
        if let Err(e) = store.deliver_to_saga::<S>(&saga_id, event).await {
            tracing::error!(saga = S::NAME, id = %saga_id, error = %e, "saga recovery failed");
        }
    }
}

/// Builder for configuring and opening an [`AggregateStore`].
///
/// Without an explicit journal or snapshot store, a configured
/// [`base_dir`](AggregateStoreBuilder::base_dir) selects the file-backed
/// backends; otherwise everything is kept in memory.
///
/// # Examples
///
/// ```no_run
/// use aggregate_host::{AggregateStoreBuilder, Definitions};
///
/// # async fn example() -> std::io::Result<()> {
/// let store = AggregateStoreBuilder::new()
///     .base_dir("/tmp/my-app")
///     .definitions(Definitions::builder().build())
///     .open()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct AggregateStoreBuilder {
    journal: Option<Arc<dyn EventJournal>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    base_dir: Option<PathBuf>,
    definitions: Definitions,
    clock: Arc<dyn Clock>,
    strategies: HashMap<TypeId, Arc<dyn SnapshotStrategy>>,
    dispatcher_factories: Vec<(String, DispatcherFactory)>,
    saga_factories: Vec<(&'static str, SagaFactory)>,
    idle_timeout: Option<Duration>,
    mailbox_capacity: usize,
}

impl AggregateStoreBuilder {
    /// Create a new builder with in-memory backends, the system clock and
    /// no registered types.
    pub fn new() -> Self {
        Self {
            journal: None,
            snapshots: None,
            base_dir: None,
            definitions: Definitions::default(),
            clock: Arc::new(SystemClock),
            strategies: HashMap::new(),
            dispatcher_factories: Vec::new(),
            saga_factories: Vec::new(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }

    /// Use `journal` for event persistence.
    pub fn journal(mut self, journal: Arc<dyn EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Use `store` for snapshots.
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Keep events and snapshots on disk under `path`.
    ///
    /// Events go to `<path>/streams/<aggregate>/<id>/events.jsonl`,
    /// snapshots to `<path>/snapshots/<aggregate>/<id>/<seq>.json`.
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_owned());
        self
    }

    /// The event and snapshot definitions every host encodes with.
    pub fn definitions(mut self, definitions: Definitions) -> Self {
        self.definitions = definitions;
        self
    }

    /// Source of commit timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register aggregate type `A` as a command bus target.
    pub fn aggregate<A: Aggregate>(mut self) -> Self {
        self.dispatcher_factories.push((
            A::NAME.to_owned(),
            Box::new(|| Box::new(TypedDispatcher::<A>::new()) as Box<dyn AggregateDispatcher>),
        ));
        self
    }

    /// Register saga type `S`.
    ///
    /// On [`open`](AggregateStoreBuilder::open) the store subscribes to the
    /// event types the saga handles and routes each notification to the
    /// saga instance it locates.
    pub fn saga<S: Saga>(mut self) -> Self {
        self.saga_factories.push((
            S::NAME,
            Box::new(|store: &AggregateStore| {
                let handlers = store.shared_table(S::handlers);
                let events = store.events().subscribe_to(handlers.event_types());
                tokio::spawn(run_saga_manager::<S>(store.clone(), handlers, events));
            }),
        ));
        self
    }

    /// Override the snapshot strategy of aggregate or saga type `T`.
    pub fn snapshot_strategy<T: 'static>(mut self, strategy: Arc<dyn SnapshotStrategy>) -> Self {
        self.strategies.insert(TypeId::of::<T>(), strategy);
        self
    }

    /// Set the idle timeout for host eviction.
    ///
    /// Hosts that receive no messages for this duration shut down. The
    /// next lookup transparently recovers them from snapshot and journal.
    ///
    /// Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Keep hosts running until the store is dropped.
    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Bounded mailbox capacity per host. Defaults to 32.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Build the [`AggregateStore`] and start the saga managers.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`io::Error`] if the base directory cannot be created.
    pub async fn open(self) -> io::Result<AggregateStore> {
        if let Some(base_dir) = &self.base_dir {
            std::fs::create_dir_all(base_dir)?;
        }

        let journal = match (self.journal, &self.base_dir) {
            (Some(journal), _) => journal,
            (None, Some(base_dir)) => Arc::new(FileJournal::new(base_dir.clone())),
            (None, None) => Arc::new(InMemoryJournal::new()),
        };
        let snapshots = match (self.snapshots, &self.base_dir) {
            (Some(snapshots), _) => snapshots,
            (None, Some(base_dir)) => Arc::new(FileSnapshotStore::new(base_dir.clone())),
            (None, None) => Arc::new(InMemorySnapshotStore::new()),
        };

        let mut dispatchers: DispatcherMap = HashMap::new();
        for (name, factory) in self.dispatcher_factories {
            dispatchers.insert(name, factory());
        }

        let store = AggregateStore {
            runtime: Arc::new(HostRuntime {
                journal,
                snapshots,
                definitions: Arc::new(self.definitions),
                clock: self.clock,
                events: EventStream::new(),
            }),
            cache: Arc::new(RwLock::new(HashMap::new())),
            shared: Arc::new(Mutex::new(HashMap::new())),
            strategies: Arc::new(self.strategies),
            dispatchers: Arc::new(dispatchers),
            actor: ActorConfig {
                idle_timeout: self.idle_timeout,
                mailbox_capacity: self.mailbox_capacity,
            },
        };

        for (name, start) in self.saga_factories {
            tracing::debug!(saga = name, "starting saga manager");
            start(&store);
        }
        Ok(store)
    }
}

impl Default for AggregateStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
