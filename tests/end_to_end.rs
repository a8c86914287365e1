use std::sync::Arc;
use std::time::Duration;

use aggregate_host::{
    Aggregate, AggregateStore, AggregateStoreBuilder, Apply, ApplyMethods, Batch, Command,
    CommandMetadata, Definitions, DomainEvent, Emitter, EventJournal, EventMetadata, Executed,
    FailureKind, FixedClock, Hydrate, InMemoryJournal, InMemorySnapshotStore, JournalError,
    Outcome, Saga, SagaContext, SagaHandlers, SagaHandles, SerializedEvent, SerializedSnapshot,
    SnapshotEvery, SnapshotStore, SnapshotStoreError, SourceId, StreamId, AggregateEvent,
    AggregateSnapshot, AnySnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

aggregate_host::define_identity!(pub BasketId);
aggregate_host::define_identity!(pub ShipmentId);

// --- Basket aggregate ---

#[derive(Debug, Clone, Default, PartialEq)]
struct Basket {
    owner: Option<String>,
    items: Vec<String>,
    checked_out: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BasketCreatedEvent {
    owner: String,
}
impl AggregateEvent for BasketCreatedEvent {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemAddedEvent {
    name: String,
}
impl AggregateEvent for ItemAddedEvent {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckedOutEvent;
impl AggregateEvent for CheckedOutEvent {}

/// Emitted by `AttachNote` but deliberately left out of the apply methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NoteAttachedEvent {
    note: String,
}
impl AggregateEvent for NoteAttachedEvent {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BasketSnapshot {
    owner: Option<String>,
    items: Vec<String>,
    checked_out: bool,
}
impl AggregateSnapshot for BasketSnapshot {}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum BasketCommand {
    Create { owner: String },
    AddItem { name: String },
    AddMany { names: Vec<String> },
    Checkout,
    AttachNote { note: String },
}

#[derive(Debug, thiserror::Error)]
enum BasketError {
    #[error("basket already exists")]
    Exists,
    #[error("basket does not exist")]
    Missing,
}

impl Apply<BasketCreatedEvent> for Basket {
    fn apply(&mut self, event: &BasketCreatedEvent) {
        self.owner = Some(event.owner.clone());
    }
}

impl Apply<ItemAddedEvent> for Basket {
    fn apply(&mut self, event: &ItemAddedEvent) {
        self.items.push(event.name.clone());
    }
}

impl Apply<CheckedOutEvent> for Basket {
    fn apply(&mut self, _: &CheckedOutEvent) {
        self.checked_out = true;
    }
}

impl Hydrate<BasketSnapshot> for Basket {
    fn hydrate(&mut self, snapshot: &BasketSnapshot) {
        self.owner = snapshot.owner.clone();
        self.items = snapshot.items.clone();
        self.checked_out = snapshot.checked_out;
    }
}

impl Aggregate for Basket {
    const NAME: &'static str = "basket";
    type Identity = BasketId;
    type Command = BasketCommand;
    type Error = BasketError;

    fn apply_methods() -> ApplyMethods<Self> {
        ApplyMethods::new()
            .event::<BasketCreatedEvent>()
            .event::<ItemAddedEvent>()
            .event::<CheckedOutEvent>()
            .snapshot::<BasketSnapshot>()
    }

    fn handle(&self, command: BasketCommand, emit: &mut Emitter) -> Result<(), BasketError> {
        if !matches!(command, BasketCommand::Create { .. }) && self.owner.is_none() {
            return Err(BasketError::Missing);
        }
        match command {
            BasketCommand::Create { owner } => {
                if self.owner.is_some() {
                    return Err(BasketError::Exists);
                }
                emit.emit(BasketCreatedEvent { owner });
            }
            BasketCommand::AddItem { name } => emit.emit(ItemAddedEvent { name }),
            BasketCommand::AddMany { names } => {
                let mut batch = Batch::new();
                for name in names {
                    batch.push(ItemAddedEvent { name });
                }
                emit.emit_all(batch);
            }
            BasketCommand::Checkout => emit.emit(CheckedOutEvent),
            BasketCommand::AttachNote { note } => emit.emit(NoteAttachedEvent { note }),
        }
        Ok(())
    }

    fn create_snapshot(&self) -> Option<Box<dyn AnySnapshot>> {
        Some(Box::new(BasketSnapshot {
            owner: self.owner.clone(),
            items: self.items.clone(),
            checked_out: self.checked_out,
        }))
    }
}

// --- Shipment aggregate ---

#[derive(Debug, Clone, Default)]
struct Shipment {
    shipped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShippedEvent;
impl AggregateEvent for ShippedEvent {}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ShipmentCommand {
    Ship,
}

#[derive(Debug, thiserror::Error)]
#[error("already shipped")]
struct AlreadyShipped;

impl Apply<ShippedEvent> for Shipment {
    fn apply(&mut self, _: &ShippedEvent) {
        self.shipped = true;
    }
}

impl Aggregate for Shipment {
    const NAME: &'static str = "shipment";
    type Identity = ShipmentId;
    type Command = ShipmentCommand;
    type Error = AlreadyShipped;

    fn apply_methods() -> ApplyMethods<Self> {
        ApplyMethods::new().event::<ShippedEvent>()
    }

    fn handle(&self, command: ShipmentCommand, emit: &mut Emitter) -> Result<(), AlreadyShipped> {
        match command {
            ShipmentCommand::Ship if self.shipped => Err(AlreadyShipped),
            ShipmentCommand::Ship => {
                emit.emit(ShippedEvent);
                Ok(())
            }
        }
    }
}

// --- Fulfilment saga (stateless) ---

#[derive(Debug, Clone, Default)]
struct Fulfilment;

impl Saga for Fulfilment {
    const NAME: &'static str = "fulfilment";
    type Identity = BasketId;
    type Error = serde_json::Error;

    fn handlers() -> SagaHandlers<Self> {
        SagaHandlers::new().on::<BasketId, CheckedOutEvent>()
    }
}

impl SagaHandles<BasketId, CheckedOutEvent> for Fulfilment {
    fn locate(event: &DomainEvent<BasketId, CheckedOutEvent>) -> Option<BasketId> {
        Some(event.identity.clone())
    }

    fn handle(
        &self,
        event: &DomainEvent<BasketId, CheckedOutEvent>,
        ctx: &mut SagaContext<'_>,
    ) -> Result<(), serde_json::Error> {
        let shipment = ShipmentId::new(format!("ship-{}", event.identity))
            .expect("derived shipment id is never empty");
        ctx.publish_command::<Shipment>(shipment, ShipmentCommand::Ship)
    }
}

// --- Helpers ---

fn definitions() -> Definitions {
    Definitions::builder()
        .event::<BasketCreatedEvent>()
        .event::<ItemAddedEvent>()
        .event::<CheckedOutEvent>()
        .event::<NoteAttachedEvent>()
        .event::<ShippedEvent>()
        .snapshot::<BasketSnapshot>()
        .build()
}

fn builder() -> AggregateStoreBuilder {
    AggregateStoreBuilder::new()
        .definitions(definitions())
        .aggregate::<Basket>()
        .aggregate::<Shipment>()
        .no_idle_timeout()
}

fn basket(id: &str) -> BasketId {
    BasketId::new(id).unwrap()
}

fn stream(id: &str) -> StreamId {
    StreamId::new("basket", id)
}

async fn run(store: &AggregateStore, id: &str, command: BasketCommand) -> Outcome {
    store
        .publish(Command::<Basket>::new(basket(id), command))
        .await
        .outcome
}

async fn fill(store: &AggregateStore, id: &str, items: usize) {
    run(
        store,
        id,
        BasketCommand::Create {
            owner: "ana".into(),
        },
    )
    .await;
    for i in 0..items {
        let outcome = run(
            store,
            id,
            BasketCommand::AddItem {
                name: format!("item-{i}"),
            },
        )
        .await;
        assert!(matches!(outcome, Outcome::Succeeded(Executed::Applied { .. })));
    }
}

#[derive(Debug, Default)]
struct SingleEventJournal {
    inner: InMemoryJournal,
}

#[async_trait]
impl EventJournal for SingleEventJournal {
    async fn append(&self, stream: &StreamId, events: Vec<SerializedEvent>) -> Result<(), JournalError> {
        if events.len() > 1 {
            return Err(JournalError::Unavailable("batch too large".into()));
        }
        self.inner.append(stream, events).await
    }

    async fn read_from(&self, stream: &StreamId, after: u64) -> Result<Vec<SerializedEvent>, JournalError> {
        self.inner.read_from(stream, after).await
    }
}

#[derive(Debug, Default)]
struct BrokenSnapshotStore;

#[async_trait]
impl SnapshotStore for BrokenSnapshotStore {
    async fn save(&self, _: &StreamId, _: SerializedSnapshot) -> Result<(), SnapshotStoreError> {
        Err(SnapshotStoreError::Unavailable("read-only".into()))
    }

    async fn load_latest(&self, _: &StreamId) -> Result<Option<SerializedSnapshot>, SnapshotStoreError> {
        Ok(None)
    }

    async fn delete_up_to(&self, _: &StreamId, _: u64) -> Result<(), SnapshotStoreError> {
        Ok(())
    }
}

// --- Scenarios ---

#[tokio::test]
async fn restart_from_disk_restores_items_and_version() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let store = builder().base_dir(tmp.path()).open().await.unwrap();
        fill(&store, "b-1", 5).await;
    }

    let store = builder().base_dir(tmp.path()).open().await.unwrap();
    let handle = store.get::<Basket>(&basket("b-1")).await.unwrap();
    let state = handle.state().await.unwrap();
    assert_eq!(state.items.len(), 5);
    assert_eq!(state.owner.as_deref(), Some("ana"));
    assert_eq!(handle.version().await.unwrap(), 6);
    assert!(tmp.path().join("streams/basket/b-1/events.jsonl").exists());
}

#[tokio::test]
async fn redelivered_command_runs_once() {
    let journal = Arc::new(InMemoryJournal::new());
    let store = builder().journal(journal.clone()).open().await.unwrap();
    fill(&store, "b-1", 0).await;

    let command = || {
        Command::<Basket>::new(basket("b-1"), BasketCommand::AddItem { name: "milk".into() })
            .with_source_id(SourceId::new("add-milk").unwrap())
    };
    let first = store.publish(command()).await;
    let second = store.publish(command()).await;

    assert!(matches!(first.outcome, Outcome::Succeeded(Executed::Applied { .. })));
    assert_eq!(second.outcome, Outcome::Succeeded(Executed::AlreadyApplied));
    assert_eq!(second.source_id, Some(SourceId::new("add-milk").unwrap()));
    assert_eq!(journal.read_from(&stream("b-1"), 0).await.unwrap().len(), 2);
}

#[tokio::test]
async fn deduplication_survives_restart() {
    let journal = Arc::new(InMemoryJournal::new());
    let meta = CommandMetadata::default().with_source_id(SourceId::new("create-1").unwrap());
    {
        let store = builder().journal(journal.clone()).open().await.unwrap();
        store
            .execute::<Basket>(&basket("b-1"), BasketCommand::Create { owner: "ana".into() }, meta.clone())
            .await
            .unwrap();
    }

    let store = builder().journal(journal).open().await.unwrap();
    let again = store
        .execute::<Basket>(&basket("b-1"), BasketCommand::Create { owner: "ana".into() }, meta)
        .await
        .unwrap();
    assert_eq!(again, Executed::AlreadyApplied);
}

#[tokio::test]
async fn failed_batch_commits_nothing_and_publishes_nothing() {
    let store = builder()
        .journal(Arc::new(SingleEventJournal::default()))
        .open()
        .await
        .unwrap();
    fill(&store, "b-1", 1).await;
    let mut notifications = store.events().subscribe_all();

    let outcome = run(
        &store,
        "b-1",
        BasketCommand::AddMany {
            names: vec!["a".into(), "b".into(), "c".into()],
        },
    )
    .await;

    assert!(matches!(
        outcome,
        Outcome::Failed {
            kind: FailureKind::Persistence,
            ..
        }
    ));
    let handle = store.get::<Basket>(&basket("b-1")).await.unwrap();
    assert_eq!(handle.version().await.unwrap(), 2);
    assert_eq!(handle.state().await.unwrap().items, vec!["item-0"]);
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn snapshot_plus_tail_matches_full_replay() {
    let journal = Arc::new(InMemoryJournal::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    {
        let store = builder()
            .journal(journal.clone())
            .snapshot_store(snapshots.clone())
            .snapshot_strategy::<Basket>(Arc::new(SnapshotEvery(3)))
            .open()
            .await
            .unwrap();
        fill(&store, "b-1", 6).await;
    }
    assert_eq!(snapshots.versions(&stream("b-1")).await, vec![6]);

    let from_snapshot = builder()
        .journal(journal.clone())
        .snapshot_store(snapshots)
        .open()
        .await
        .unwrap();
    let full_replay = builder().journal(journal).open().await.unwrap();

    let a = from_snapshot.get::<Basket>(&basket("b-1")).await.unwrap();
    let b = full_replay.get::<Basket>(&basket("b-1")).await.unwrap();
    assert_eq!(a.state().await.unwrap(), b.state().await.unwrap());
    assert_eq!(a.version().await.unwrap(), 7);
    assert_eq!(b.version().await.unwrap(), 7);
}

#[tokio::test]
async fn snapshot_failures_do_not_fail_commands() {
    let store = builder()
        .snapshot_store(Arc::new(BrokenSnapshotStore))
        .snapshot_strategy::<Basket>(Arc::new(SnapshotEvery(1)))
        .open()
        .await
        .unwrap();

    fill(&store, "b-1", 3).await;
    let handle = store.get::<Basket>(&basket("b-1")).await.unwrap();
    assert_eq!(handle.version().await.unwrap(), 4);
}

#[tokio::test]
async fn saga_commands_carry_correlation_ids() {
    let store = builder().saga::<Fulfilment>().open().await.unwrap();
    let mut shipped = store.events().subscribe::<ShippedEvent>();

    fill(&store, "b-1", 1).await;
    let checkout = Command::<Basket>::new(basket("b-1"), BasketCommand::Checkout)
        .with_correlation_id("req-42");
    assert!(store.publish(checkout).await.is_success());

    let notification = tokio::time::timeout(Duration::from_secs(5), shipped.recv())
        .await
        .expect("shipment should be triggered")
        .expect("stream open");
    assert_eq!(notification.identity(), "ship-b-1");
    let correlation = &notification.metadata().correlation_ids;
    assert!(correlation.contains(&"req-42".to_string()));
    assert!(correlation.contains(&"b-1".to_string()));
    assert!(notification.metadata().source_id.is_some());
}

#[tokio::test]
async fn unfoldable_event_is_a_configuration_failure() {
    let journal = Arc::new(InMemoryJournal::new());
    let store = builder().journal(journal.clone()).open().await.unwrap();
    fill(&store, "b-1", 0).await;

    let outcome = run(&store, "b-1", BasketCommand::AttachNote { note: "hi".into() }).await;

    assert!(matches!(
        outcome,
        Outcome::Failed {
            kind: FailureKind::Configuration,
            ..
        }
    ));
    assert_eq!(journal.read_from(&stream("b-1"), 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn undecodable_history_fails_recovery() {
    let journal = Arc::new(InMemoryJournal::new());
    journal
        .append(
            &stream("b-1"),
            vec![SerializedEvent {
                sequence_number: 1,
                event_name: "Mystery".into(),
                event_version: 1,
                timestamp: Utc::now(),
                metadata: EventMetadata::default(),
                payload: serde_json::json!({}),
            }],
        )
        .await
        .unwrap();
    let store = builder().journal(journal).open().await.unwrap();

    let outcome = run(&store, "b-1", BasketCommand::Checkout).await;
    assert!(matches!(
        outcome,
        Outcome::Failed {
            kind: FailureKind::Recovery,
            ..
        }
    ));
}

#[tokio::test]
async fn default_clock_instant_is_rejected() {
    let store = builder()
        .clock(Arc::new(FixedClock(DateTime::<Utc>::default())))
        .open()
        .await
        .unwrap();

    let outcome = run(
        &store,
        "b-1",
        BasketCommand::Create {
            owner: "ana".into(),
        },
    )
    .await;
    assert!(matches!(
        outcome,
        Outcome::Failed {
            kind: FailureKind::Configuration,
            ..
        }
    ));
}
