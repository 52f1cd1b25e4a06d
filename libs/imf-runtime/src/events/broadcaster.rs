//! Fan-out of events to any number of transport subscribers.
//!
//! ```text
//! publish(event)
//!     │
//!     ├──► [queue 1] ──► delivery task 1 ──► transport1.deliver()
//!     │    (bounded, drop-oldest)
//!     ├──► [queue 2] ──► delivery task 2 ──► transport2.deliver()
//!     │
//!     └──► [queue N] ──► delivery task N ──► transportN.deliver()
//! ```
//!
//! - `publish` never waits: it appends to every connected queue and returns.
//! - A full queue loses its oldest unread event; other queues are untouched.
//! - Each subscriber sees events in publish order. There is no ordering
//!   between subscribers.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, watch};

use super::throttle::ThrottledLog;
use super::{Event, Transport};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
const OVERFLOW_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberState {
    Connected,
    Draining,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStats {
    pub id: u64,
    pub state: SubscriberState,
    pub capacity: usize,
    pub queued: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// Reported (not raised) when a subscriber queue discards an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("subscriber {subscriber} queue overflow: {dropped} event(s) dropped")]
pub struct SubscriberQueueOverflow {
    pub subscriber: u64,
    pub dropped: u64,
}

enum Push {
    Queued,
    Displaced,
    Rejected,
}

enum Step {
    Deliver(Arc<Event>),
    Wait,
    Exit,
}

struct SlotInner {
    state: SubscriberState,
    queue: VecDeque<Arc<Event>>,
}

struct Slot {
    id: u64,
    capacity: usize,
    inner: Mutex<SlotInner>,
    wake: Notify,
    state_tx: watch::Sender<SubscriberState>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Slot {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            inner: Mutex::new(SlotInner {
                state: SubscriberState::Connected,
                queue: VecDeque::with_capacity(capacity.min(64)),
            }),
            wake: Notify::new(),
            state_tx: watch::Sender::new(SubscriberState::Connected),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: Arc<Event>) -> Push {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.state != SubscriberState::Connected {
                return Push::Rejected;
            }
            let displaced = if inner.queue.len() >= self.capacity {
                inner.queue.pop_front();
                true
            } else {
                false
            };
            inner.queue.push_back(event);
            if displaced { Push::Displaced } else { Push::Queued }
        };
        if matches!(outcome, Push::Displaced) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.wake.notify_one();
        outcome
    }

    fn next_step(&self) -> Step {
        let mut inner = self.inner.lock();
        match inner.state {
            SubscriberState::Connected => match inner.queue.pop_front() {
                Some(event) => Step::Deliver(event),
                None => Step::Wait,
            },
            SubscriberState::Draining | SubscriberState::Closed => Step::Exit,
        }
    }

    /// Stops accepting events and discards whatever is still queued.
    fn begin_drain(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state != SubscriberState::Connected {
                return;
            }
            inner.state = SubscriberState::Draining;
            inner.queue.clear();
        }
        self.state_tx.send_replace(SubscriberState::Draining);
        self.wake.notify_one();
    }

    fn finish(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = SubscriberState::Closed;
            inner.queue.clear();
        }
        self.state_tx.send_replace(SubscriberState::Closed);
    }

    fn state(&self) -> SubscriberState {
        self.inner.lock().state
    }

    fn stats(&self) -> SubscriberStats {
        let (state, queued) = {
            let inner = self.inner.lock();
            (inner.state, inner.queue.len())
        };
        SubscriberStats {
            id: self.id,
            state,
            capacity: self.capacity,
            queued,
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

struct Hub {
    slots: RwLock<HashMap<u64, Arc<Slot>>>,
    next_id: AtomicU64,
    default_capacity: usize,
    dropped_total: AtomicU64,
    overflow_log: ThrottledLog,
}

impl Hub {
    fn detach(&self, id: u64) -> bool {
        let removed = self.slots.write().remove(&id);
        match removed {
            Some(slot) => {
                slot.begin_drain();
                tracing::debug!(subscriber = id, "subscriber detached");
                true
            }
            None => false,
        }
    }
}

/// Typed publish/subscribe hub. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    hub: Arc<Hub>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBroadcaster {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            hub: Arc::new(Hub {
                slots: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                default_capacity: default_capacity.max(1),
                dropped_total: AtomicU64::new(0),
                overflow_log: ThrottledLog::new(OVERFLOW_LOG_INTERVAL),
            }),
        }
    }

    /// Attaches a transport with the default queue capacity.
    ///
    /// Spawns the subscriber's delivery task, so it must be called from
    /// within a Tokio runtime.
    pub fn subscribe(&self, transport: Arc<dyn Transport>) -> SubscriptionHandle {
        self.subscribe_with_capacity(transport, self.hub.default_capacity)
    }

    pub fn subscribe_with_capacity(
        &self,
        transport: Arc<dyn Transport>,
        capacity: usize,
    ) -> SubscriptionHandle {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(id, capacity.max(1)));
        self.hub.slots.write().insert(id, Arc::clone(&slot));

        tokio::spawn(deliver_loop(
            Arc::clone(&slot),
            transport,
            Arc::downgrade(&self.hub),
        ));
        tracing::debug!(subscriber = id, capacity = slot.capacity, "subscriber attached");

        SubscriptionHandle {
            id,
            hub: Arc::downgrade(&self.hub),
            slot,
        }
    }

    /// Queues `event` for every connected subscriber and returns how many
    /// received it.
    pub fn publish(&self, event: Event) -> usize {
        let event = Arc::new(event);
        let mut reached = 0;
        let slots = self.hub.slots.read();
        for slot in slots.values() {
            match slot.push(Arc::clone(&event)) {
                Push::Queued => reached += 1,
                Push::Displaced => {
                    reached += 1;
                    self.hub.dropped_total.fetch_add(1, Ordering::Relaxed);
                    if let Some(suppressed) = self.hub.overflow_log.permit() {
                        let report = SubscriberQueueOverflow {
                            subscriber: slot.id,
                            dropped: slot.dropped.load(Ordering::Relaxed),
                        };
                        tracing::warn!(
                            subscriber = slot.id,
                            dropped = report.dropped,
                            suppressed,
                            "{report}"
                        );
                    }
                }
                Push::Rejected => {}
            }
        }
        reached
    }

    /// Detaches a subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.hub.detach(id)
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.hub.slots.read().len()
    }

    /// Events discarded across all subscribers since creation.
    pub fn dropped_events(&self) -> u64 {
        self.hub.dropped_total.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Vec<SubscriberStats> {
        let mut stats: Vec<_> = self.hub.slots.read().values().map(|s| s.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Detaches every subscriber.
    pub fn close_all(&self) {
        let slots: Vec<_> = self.hub.slots.write().drain().map(|(_, s)| s).collect();
        for slot in &slots {
            slot.begin_drain();
        }
        if !slots.is_empty() {
            tracing::debug!(count = slots.len(), "all subscribers detached");
        }
    }
}

async fn deliver_loop(slot: Arc<Slot>, transport: Arc<dyn Transport>, hub: Weak<Hub>) {
    loop {
        match slot.next_step() {
            Step::Deliver(event) => match transport.deliver(&event).await {
                Ok(()) => {
                    slot.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(subscriber = slot.id, error = %e, "delivery failed; detaching subscriber");
                    match hub.upgrade() {
                        Some(hub) => {
                            hub.detach(slot.id);
                        }
                        None => slot.begin_drain(),
                    }
                }
            },
            Step::Wait => slot.wake.notified().await,
            Step::Exit => break,
        }
    }
    transport.close().await;
    slot.finish();
}

/// Owner of one subscription. Dropping it unsubscribes.
pub struct SubscriptionHandle {
    id: u64,
    hub: Weak<Hub>,
    slot: Arc<Slot>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        self.slot.state()
    }

    pub fn stats(&self) -> SubscriberStats {
        self.slot.stats()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Resolves once the delivery task has finished and the transport has
    /// been closed.
    pub async fn closed(&self) {
        let mut rx = self.slot.state_tx.subscribe();
        // The sender lives in the slot we hold, so this only ends at `Closed`.
        if rx.wait_for(|s| *s == SubscriberState::Closed).await.is_err() {
            tracing::trace!(subscriber = self.id, "subscriber state channel closed");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        match self.hub.upgrade() {
            Some(hub) => {
                hub.detach(self.id);
            }
            None => self.slot.begin_drain(),
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
