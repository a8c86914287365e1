//! In-process fan-out of domain-event notifications.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::event::{AggregateEvent, AnyDomainEvent};

type Subscriber = mpsc::UnboundedSender<AnyDomainEvent>;

/// Queue depth at which a subscriber is reported as falling behind.
pub(crate) const BACKLOG_WARNING: usize = 1024;

/// Reports when a subscriber's queue gets deep, once per episode.
///
/// Fires when the depth first reaches the threshold and re-arms after the
/// queue drains to half of it.
#[derive(Debug)]
pub(crate) struct BacklogWatch {
    threshold: usize,
    behind: bool,
}

impl BacklogWatch {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            threshold,
            behind: false,
        }
    }

    /// Whether `depth` starts a new episode of falling behind.
    pub(crate) fn observe(&mut self, depth: usize) -> bool {
        if depth >= self.threshold {
            return !std::mem::replace(&mut self.behind, true);
        }
        if depth <= self.threshold / 2 {
            self.behind = false;
        }
        false
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    by_type: HashMap<TypeId, Vec<Subscriber>>,
    all: Vec<Subscriber>,
}

/// Publishes every folded live event to the subscribers interested in it.
///
/// Subscribers register for one concrete event type or for everything.
/// Channels are unbounded so a slow subscriber never stalls a host; a
/// subscriber whose receiver was dropped is removed on the next publish.
/// Nothing bounds a stalled subscriber's queue, so consumers should drain
/// promptly; saga managers log a warning once theirs reaches
/// [`BACKLOG_WARNING`] notifications.
/// Notifications from one host arrive in fold order.
#[derive(Debug, Clone, Default)]
pub struct EventStream {
    inner: Arc<Mutex<Subscribers>>,
}

impl EventStream {
    /// Create a stream with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive notifications for events of type `E`.
    pub fn subscribe<E: AggregateEvent>(&self) -> mpsc::UnboundedReceiver<AnyDomainEvent> {
        self.subscribe_to([TypeId::of::<E>()])
    }

    /// Receive notifications for every event.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<AnyDomainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().all.push(tx);
        rx
    }

    /// One receiver for several event types. Each event still arrives once.
    pub(crate) fn subscribe_to(
        &self,
        event_types: impl IntoIterator<Item = TypeId>,
    ) -> mpsc::UnboundedReceiver<AnyDomainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        for event_type in event_types {
            subscribers
                .by_type
                .entry(event_type)
                .or_default()
                .push(tx.clone());
        }
        rx
    }

    pub(crate) fn publish(&self, event: AnyDomainEvent) {
        let mut subscribers = self.lock();
        if let Some(typed) = subscribers.by_type.get_mut(&event.event_type()) {
            typed.retain(|tx| tx.send(event.clone()).is_ok());
        }
        subscribers.all.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscriptions, counting a multi-type one once per type.
    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.lock();
        subscribers.all.len() + subscribers.by_type.values().map(Vec::len).sum::<usize>()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{ItemAdded, ListCreated, ListId};
    use crate::event::{AnyEvent, CommittedEvent};
    use crate::metadata::EventMetadata;
    use chrono::{TimeZone, Utc};

    fn notification(event: Arc<dyn AnyEvent>, seq: u64) -> AnyDomainEvent {
        let committed = CommittedEvent::new(
            ListId::new("l-1").unwrap(),
            event,
            EventMetadata::default(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            seq,
        )
        .unwrap();
        AnyDomainEvent::from_committed(&committed)
    }

    #[test]
    fn backlog_warns_once_per_episode() {
        let mut watch = BacklogWatch::new(4);
        let fired: Vec<bool> = [1, 4, 6, 3, 5, 2, 4]
            .into_iter()
            .map(|depth| watch.observe(depth))
            .collect();
        assert_eq!(fired, vec![false, true, false, false, false, false, true]);
    }

    #[tokio::test]
    async fn typed_subscribers_only_see_their_type() {
        let stream = EventStream::new();
        let mut added = stream.subscribe::<ItemAdded>();
        let mut all = stream.subscribe_all();

        stream.publish(notification(Arc::new(ListCreated { owner: "o".into() }), 1));
        stream.publish(notification(Arc::new(ItemAdded { name: "x".into() }), 2));

        let first = added.recv().await.unwrap();
        assert_eq!(first.version(), 2);
        assert!(added.try_recv().is_err());

        assert_eq!(all.recv().await.unwrap().version(), 1);
        assert_eq!(all.recv().await.unwrap().version(), 2);
    }

    #[tokio::test]
    async fn multi_type_subscription_receives_each_event_once() {
        let stream = EventStream::new();
        let mut rx = stream.subscribe_to([TypeId::of::<ListCreated>(), TypeId::of::<ItemAdded>()]);

        stream.publish(notification(Arc::new(ListCreated { owner: "o".into() }), 1));
        stream.publish(notification(Arc::new(ItemAdded { name: "x".into() }), 2));

        assert_eq!(rx.recv().await.unwrap().version(), 1);
        assert_eq!(rx.recv().await.unwrap().version(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let stream = EventStream::new();
        let rx = stream.subscribe_all();
        let _kept = stream.subscribe::<ItemAdded>();
        assert_eq!(stream.subscriber_count(), 2);

        drop(rx);
        stream.publish(notification(Arc::new(ItemAdded { name: "x".into() }), 1));
        assert_eq!(stream.subscriber_count(), 1);
    }
}
