//! Broadcast of durable events to matching subscriptions.
//!
//! Every connection owns one bounded [`DeliveryQueue`]. The broadcaster only
//! ever `try_send`s into it: a full queue drops that event for that
//! connection alone and records a gap the connection reports to its client.

use crate::metrics::counters;
use crate::registry::{ConnId, SubscriptionRegistry};
use ostrich_common::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tracing::{debug, warn};

/// One event addressed to one subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Subscription id the event matched.
    pub sub_id: Arc<str>,
    /// The durable event.
    pub event: Arc<Event>,
}

#[derive(Debug, Default)]
struct DropState {
    gap: AtomicU64,
    total: AtomicU64,
}

/// Sending half of a connection's delivery queue.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<Delivery>,
    drops: Arc<DropState>,
    close: Arc<Notify>,
}

/// Receiving half of a connection's delivery queue.
#[derive(Debug)]
pub struct DeliveryReceiver {
    rx: mpsc::Receiver<Delivery>,
    drops: Arc<DropState>,
    close: Arc<Notify>,
}

/// Creates a delivery queue holding at most `capacity` events.
#[must_use]
pub fn channel(capacity: usize) -> (DeliveryQueue, DeliveryReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let drops = Arc::new(DropState::default());
    let close = Arc::new(Notify::new());
    (
        DeliveryQueue {
            tx,
            drops: drops.clone(),
            close: close.clone(),
        },
        DeliveryReceiver { rx, drops, close },
    )
}

impl DeliveryQueue {
    /// Events dropped for this connection since it connected.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.drops.total.load(Ordering::Relaxed)
    }
}

impl DeliveryReceiver {
    /// Receives the next delivery. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Returns the number of events dropped since the last call and resets it.
    pub fn take_gap(&self) -> u64 {
        self.drops.gap.swap(0, Ordering::Relaxed)
    }

    /// Resolves when the broadcaster asks this connection to close.
    pub async fn closed(&self) {
        self.close.notified().await;
    }

    /// The close signal, for waiting on it while also receiving.
    #[must_use]
    pub fn close_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.close)
    }

    /// Discards everything still queued.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutStats {
    /// Subscriptions the event matched.
    pub matched: usize,
    /// Deliveries enqueued.
    pub delivered: usize,
    /// Deliveries dropped on full queues.
    pub dropped: usize,
}

/// Pushes durable events to every matching subscription without blocking.
pub struct BroadcastFanout {
    registry: Arc<SubscriptionRegistry>,
    max_drops: u64,
    sequence: Mutex<()>,
}

/// Exclusive right to make one event durable and broadcast it.
///
/// Held from before the storage write until after the broadcast, so events
/// from different writer shards reach subscribers in the order they became
/// durable.
pub type OrderTicket<'a> = MutexGuard<'a, ()>;

impl BroadcastFanout {
    /// Creates a fan-out over `registry`. A connection whose total drops
    /// reach `max_drops` is asked to close; 0 never closes.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, max_drops: u64) -> Self {
        Self {
            registry,
            max_drops,
            sequence: Mutex::new(()),
        }
    }

    /// The registry this fan-out matches against.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Waits for the right to write and then broadcast one event.
    pub async fn ticket(&self) -> OrderTicket<'_> {
        self.sequence.lock().await
    }

    /// Delivers `event` to every matching subscription.
    ///
    /// Must only be called once `event` is durable, while holding the
    /// [`OrderTicket`] taken before it was written.
    pub fn broadcast(&self, event: &Arc<Event>) -> FanoutStats {
        let matches = self.registry.matching(event);
        let mut stats = FanoutStats {
            matched: matches.len(),
            ..FanoutStats::default()
        };

        let mut current: Option<(ConnId, DeliveryQueue)> = None;
        for (conn, sub_id) in matches {
            let queue = match &current {
                Some((c, q)) if *c == conn => q.clone(),
                _ => match self.registry.queue(conn) {
                    Some(q) => {
                        current = Some((conn, q.clone()));
                        q
                    }
                    None => continue,
                },
            };
            let delivery = Delivery {
                sub_id,
                event: Arc::clone(event),
            };
            match queue.tx.try_send(delivery) {
                Ok(()) => stats.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    stats.dropped += 1;
                    self.record_drop(conn, &queue);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(cid = conn, "delivery queue closed, removing connection");
                    self.registry.disconnect(conn);
                }
            }
        }

        if stats.delivered > 0 {
            counters::deliveries_total(stats.delivered as u64);
        }
        stats
    }

    fn record_drop(&self, conn: ConnId, queue: &DeliveryQueue) {
        counters::deliveries_dropped_total("queue_full");
        queue.drops.gap.fetch_add(1, Ordering::Relaxed);
        let total = queue.drops.total.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_drops > 0 && total == self.max_drops {
            warn!(cid = conn, drops = total, "slow subscriber exceeded drop limit");
            queue.close.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostrich_common::Filter;
    use std::time::Duration;

    fn event(kind: u16) -> Arc<Event> {
        Arc::new(Event {
            id: format!("{kind:064x}"),
            pubkey: "b".repeat(64),
            created_at: 1_700_000_000,
            kind,
            tags: vec![],
            content: String::new(),
            sig: "c".repeat(128),
        })
    }

    fn setup(max_drops: u64) -> (Arc<SubscriptionRegistry>, BroadcastFanout) {
        let registry = Arc::new(SubscriptionRegistry::new(10, 10));
        let fanout = BroadcastFanout::new(registry.clone(), max_drops);
        (registry, fanout)
    }

    #[tokio::test]
    async fn delivers_to_matching_subscriptions_only() {
        let (registry, fanout) = setup(0);
        let (q1, mut r1) = channel(8);
        let (q2, mut r2) = channel(8);
        registry.connect(1, q1);
        registry.connect(2, q2);
        registry
            .register(1, "notes", vec![Filter::new().kinds(vec![1])])
            .unwrap();
        registry
            .register(2, "meta", vec![Filter::new().kinds(vec![0])])
            .unwrap();

        let stats = fanout.broadcast(&event(1));
        assert_eq!(stats.matched, 1);
        assert_eq!(stats.delivered, 1);

        let d = r1.recv().await.unwrap();
        assert_eq!(&*d.sub_id, "notes");
        assert_eq!(d.event.kind, 1);
        assert!(r2.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_does_not_block_others() {
        let (registry, fanout) = setup(0);
        let (slow, slow_rx) = channel(1);
        let (fast, mut fast_rx) = channel(16);
        registry.connect(1, slow);
        registry.connect(2, fast);
        registry.register(1, "s", vec![Filter::new()]).unwrap();
        registry.register(2, "f", vec![Filter::new()]).unwrap();

        for kind in 1..=5 {
            fanout.broadcast(&event(kind));
        }
        for kind in 1..=5 {
            let d = tokio::time::timeout(Duration::from_secs(1), fast_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(d.event.kind, kind, "order preserved for the fast reader");
        }
        assert_eq!(slow_rx.take_gap(), 4);
        assert_eq!(slow_rx.take_gap(), 0);
    }

    #[tokio::test]
    async fn drop_limit_requests_close() {
        let (registry, fanout) = setup(2);
        let (q, rx) = channel(1);
        registry.connect(1, q.clone());
        registry.register(1, "s", vec![Filter::new()]).unwrap();

        fanout.broadcast(&event(1));
        fanout.broadcast(&event(2));
        fanout.broadcast(&event(3));
        assert_eq!(q.dropped(), 2);
        tokio::time::timeout(Duration::from_secs(1), rx.closed())
            .await
            .expect("close requested");
    }

    #[tokio::test]
    async fn closed_queue_removes_connection() {
        let (registry, fanout) = setup(0);
        let (q, rx) = channel(4);
        registry.connect(1, q);
        registry.register(1, "s", vec![Filter::new()]).unwrap();
        drop(rx);

        let stats = fanout.broadcast(&event(1));
        assert_eq!(stats.delivered, 0);
        assert!(registry.queue(1).is_none());
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn drain_discards_pending() {
        let (q, mut rx) = channel(4);
        for kind in 0..3 {
            q.tx.try_send(Delivery {
                sub_id: Arc::from("s"),
                event: event(kind),
            })
            .unwrap();
        }
        assert_eq!(rx.drain(), 3);
    }
}
