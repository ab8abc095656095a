//! Per-room change feed.
//!
//! One tokio broadcast channel per room. Every committed change is sent
//! once and delivered to every current subscriber, the author included.
//! Delivery is at-most-once: a subscriber that falls more than `capacity`
//! events behind loses the overflow and must resync from a snapshot.
//!
//! Events are published from inside the room's commit section, so their
//! `seq` order matches commit order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

use battlemap_core::{now_millis, ChangeEvent, ChangeKind, ChangePayload};

/// Snapshot of feed health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedStats {
    pub events_published: u64,
    pub events_dropped: u64,
    pub subscribers: usize,
}

/// Lock-free counters updated on the publish path.
struct AtomicFeedStats {
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

/// Identifies one subscription for [`ChangeFeed::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

pub struct FeedSubscription {
    pub handle: SubscriptionHandle,
    pub rx: broadcast::Receiver<Arc<ChangeEvent>>,
}

pub struct ChangeFeed {
    room_id: Uuid,
    sender: broadcast::Sender<Arc<ChangeEvent>>,
    capacity: usize,
    seq: AtomicU64,
    subscribers: Mutex<HashSet<SubscriptionHandle>>,
    stats: AtomicFeedStats,
}

impl ChangeFeed {
    pub fn new(room_id: Uuid, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            room_id,
            sender,
            capacity,
            seq: AtomicU64::new(0),
            subscribers: Mutex::new(HashSet::new()),
            stats: AtomicFeedStats {
                events_published: AtomicU64::new(0),
                events_dropped: AtomicU64::new(0),
            },
        }
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn subscribe(&self) -> FeedSubscription {
        let handle = SubscriptionHandle(Uuid::new_v4());
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(handle);
        }
        FeedSubscription {
            handle,
            rx: self.sender.subscribe(),
        }
    }

    /// Forget a subscription. Dropping its receiver stops delivery; this
    /// only updates bookkeeping. Returns `false` for unknown handles.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscribers
            .lock()
            .map(|mut subs| subs.remove(&handle))
            .unwrap_or(false)
    }

    /// Stamp the next sequence number and fan the event out. Returns the
    /// published event.
    pub fn publish(&self, kind: ChangeKind, payload: ChangePayload) -> Arc<ChangeEvent> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Arc::new(ChangeEvent {
            seq,
            room_id: self.room_id,
            kind,
            payload,
            committed_at: now_millis(),
        });
        // No receivers is fine: the change is already committed.
        let receivers = self.sender.send(event.clone()).unwrap_or(0);
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "room {} seq {}: {:?} {} {} -> {} subscribers",
            self.room_id,
            seq,
            event.kind,
            event.payload.class(),
            event.payload.entity_id(),
            receivers
        );
        event
    }

    /// Record events a lagging subscriber lost.
    pub fn note_lag(&self, missed: u64) {
        self.stats.events_dropped.fetch_add(missed, Ordering::Relaxed);
    }

    /// Sequence number of the last published event.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FeedStats {
        FeedStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use battlemap_core::{EchelonIndex, Room, Unit};
    use tokio::sync::broadcast::error::RecvError;

    fn unit_payload(room: Uuid) -> ChangePayload {
        ChangePayload::Unit(Unit::new(room, EchelonIndex::FIRST, "inf", "inf", 0.0, 0.0))
    }

    #[tokio::test]
    async fn test_fan_out_includes_author() {
        let room = Uuid::new_v4();
        let feed = ChangeFeed::new(room, 16);
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();
        let mut c = feed.subscribe();

        feed.publish(ChangeKind::Insert, unit_payload(room));

        for sub in [&mut a, &mut b, &mut c] {
            let ev = sub.rx.recv().await.unwrap();
            assert_eq!(ev.seq, 1);
            assert_eq!(ev.room_id, room);
        }
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic() {
        let room = Uuid::new_v4();
        let feed = ChangeFeed::new(room, 16);
        let mut sub = feed.subscribe();
        for _ in 0..5 {
            feed.publish(ChangeKind::Update, unit_payload(room));
        }
        let mut last = 0;
        for _ in 0..5 {
            let ev = sub.rx.recv().await.unwrap();
            assert!(ev.seq > last);
            last = ev.seq;
        }
        assert_eq!(feed.current_seq(), 5);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_sees_lag() {
        let room = Uuid::new_v4();
        let feed = ChangeFeed::new(room, 4);
        let mut sub = feed.subscribe();
        for _ in 0..10 {
            feed.publish(ChangeKind::Update, unit_payload(room));
        }
        match sub.rx.recv().await {
            Err(RecvError::Lagged(n)) => {
                feed.note_lag(n);
                assert_eq!(n, 6);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(feed.stats().events_dropped, 6);
    }

    #[tokio::test]
    async fn test_unsubscribe_bookkeeping() {
        let room = Uuid::new_v4();
        let feed = ChangeFeed::new(room, 8);
        let sub = feed.subscribe();
        let _other = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 2);
        assert!(feed.unsubscribe(sub.handle));
        assert!(!feed.unsubscribe(sub.handle));
        assert_eq!(feed.stats().subscribers, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let owner = Uuid::new_v4();
        let r = Room::new("empty", owner, "m");
        let feed = ChangeFeed::new(r.id, 8);
        let ev = feed.publish(ChangeKind::Update, ChangePayload::Room(r));
        assert_eq!(ev.seq, 1);
        assert_eq!(feed.stats().events_published, 1);
    }
}
