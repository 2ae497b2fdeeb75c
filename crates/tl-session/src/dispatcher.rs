//! Event dispatcher: routes uncorrelated inbound envelopes to topic
//! subscribers.
//!
//! Topic keys are a pure function of the payload-type tag and the symbol id
//! inside the payload (`ticks:42`, `depth:42`, `candles:42:M5`,
//! `execution`).  Within one topic, delivery order equals transport receive
//! order — the read loop is the only producer.  No ordering is promised
//! across topics.

use crate::hooks::Metrics;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tl_protocol::{DepthEvent, Envelope, SpotEvent, decode_body, tags};
use tokio::sync::{Notify, broadcast};
use tracing::trace;

/// Late responses to cancelled/expired requests land here, observable for
/// diagnostics.
pub const ORPHAN_TOPIC: &str = "orphan";
/// Refresh snapshots re-fetched after a reconnect are published here.
pub const MODEL_TOPIC: &str = "model";

const RAW_TAP_CAPACITY: usize = 128;

// ---------------------------------------------------------------------------
// Queue policies
// ---------------------------------------------------------------------------

/// What a full subscriber queue does with the next item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Suspend delivery (and the read loop) until space frees up.  Used for
    /// low-volume streams that must not lose items; never for ticks.
    Block,
    /// Evict the head and enqueue the new item.
    DropOldest,
    /// Replace a pending item with the same coalescing key (symbol id);
    /// falls back to DropOldest when no key matches and the queue is full.
    CoalesceLatest,
}

struct QueueItem {
    coalesce_key: Option<i64>,
    envelope: Envelope,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    closed: bool,
}

/// One subscriber's bounded delivery queue.
pub struct TopicQueue {
    state: Mutex<QueueState>,
    /// Signaled when space frees up or the queue closes; block-policy pushes
    /// wait on it.
    space: Notify,
    /// Signaled when an item arrives or the queue closes; pops wait on it.
    ready: Notify,
    capacity: usize,
    policy: QueuePolicy,
    metrics: Arc<Metrics>,
}

impl TopicQueue {
    pub fn new(capacity: usize, policy: QueuePolicy, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            space: Notify::new(),
            ready: Notify::new(),
            capacity,
            policy,
            metrics,
        })
    }

    /// Offer one envelope according to the queue policy.
    ///
    /// Only `Block` can suspend; the other policies return immediately.
    pub async fn push(&self, coalesce_key: Option<i64>, envelope: Envelope) {
        let mut item = Some(QueueItem {
            coalesce_key,
            envelope,
        });
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            // Register interest before checking state, so a close or pop
            // that lands in between cannot be missed.
            space.as_mut().enable();
            {
                let mut state = self.state.lock().expect("queue lock");
                if state.closed {
                    return;
                }
                match self.policy {
                    QueuePolicy::Block => {
                        if state.items.len() < self.capacity {
                            state.items.push_back(item.take().expect("push item"));
                            drop(state);
                            self.ready.notify_one();
                            return;
                        }
                        // full: wait below for a pop to free space
                    }
                    QueuePolicy::DropOldest => {
                        if state.items.len() >= self.capacity {
                            state.items.pop_front();
                            self.metrics.incr_inbound_dropped();
                        }
                        state.items.push_back(item.take().expect("push item"));
                        drop(state);
                        self.ready.notify_one();
                        return;
                    }
                    QueuePolicy::CoalesceLatest => {
                        let taken = item.take().expect("push item");
                        if let Some(pos) = taken.coalesce_key.and_then(|key| {
                            state.items.iter().position(|i| i.coalesce_key == Some(key))
                        }) {
                            state.items[pos] = taken;
                        } else {
                            if state.items.len() >= self.capacity {
                                state.items.pop_front();
                                self.metrics.incr_inbound_dropped();
                            }
                            state.items.push_back(taken);
                        }
                        drop(state);
                        self.ready.notify_one();
                        return;
                    }
                }
            }
            space.await;
        }
    }

    /// Take the next envelope, suspending while the queue is empty.
    ///
    /// Returns `None` only once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Envelope> {
        loop {
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            {
                let mut state = self.state.lock().expect("queue lock");
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space.notify_one();
                    return Some(item.envelope);
                }
                if state.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Close the queue: pending items remain poppable, pushes become no-ops,
    /// blocked pushers and poppers wake up.  Idempotent.
    pub fn close(&self) {
        self.state.lock().expect("queue lock").closed = true;
        self.space.notify_waiters();
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("queue lock").closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Topic classification
// ---------------------------------------------------------------------------

/// Compute the topic keys (and coalescing key) for one inbound envelope.
///
/// Pure function of the tag and the symbol id inside the payload.  An
/// envelope whose payload fails to decode classifies to no topics.
pub fn classify(envelope: &Envelope) -> (Vec<String>, Option<i64>) {
    match envelope.payload_type {
        tags::SPOT_EVENT => match decode_body::<SpotEvent>(&envelope.payload) {
            Ok(event) => {
                let mut topics = vec![format!("ticks:{}", event.symbol_id)];
                for bar in &event.trendbars {
                    topics.push(format!(
                        "candles:{}:{}",
                        event.symbol_id,
                        bar.period.as_str()
                    ));
                }
                (topics, Some(event.symbol_id))
            }
            Err(_) => (Vec::new(), None),
        },
        tags::DEPTH_EVENT => match decode_body::<DepthEvent>(&envelope.payload) {
            Ok(event) => (vec![format!("depth:{}", event.symbol_id)], Some(event.symbol_id)),
            Err(_) => (Vec::new(), None),
        },
        tags::EXECUTION_EVENT => (vec!["execution".to_owned()], None),
        _ => (Vec::new(), None),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct Slot {
    subscription_id: u64,
    queue: Arc<TopicQueue>,
}

/// Topic table plus the raw-envelope tap.
pub struct Dispatcher {
    topics: Mutex<HashMap<String, Vec<Slot>>>,
    raw_tap: broadcast::Sender<Envelope>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        let (raw_tap, _) = broadcast::channel(RAW_TAP_CAPACITY);
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            raw_tap,
            metrics,
        })
    }

    /// Attach a subscriber queue under a topic key.
    pub fn register(&self, topic: &str, subscription_id: u64, queue: Arc<TopicQueue>) {
        self.topics
            .lock()
            .expect("topic lock")
            .entry(topic.to_owned())
            .or_default()
            .push(Slot {
                subscription_id,
                queue,
            });
    }

    /// Detach a subscriber from every one of its topics.
    pub fn deregister(&self, topics: &[String], subscription_id: u64) {
        let mut table = self.topics.lock().expect("topic lock");
        for topic in topics {
            if let Some(slots) = table.get_mut(topic) {
                slots.retain(|s| s.subscription_id != subscription_id);
                if slots.is_empty() {
                    table.remove(topic);
                }
            }
        }
    }

    /// Route one uncorrelated inbound envelope.
    pub async fn dispatch(&self, envelope: Envelope) {
        let (topic_keys, coalesce_key) = classify(&envelope);
        if topic_keys.is_empty() {
            trace!(payload_type = envelope.payload_type, "unrouted inbound envelope");
            self.metrics.incr_inbound_unrouted();
            return;
        }
        for topic in &topic_keys {
            self.publish_with_key(topic, coalesce_key, envelope.clone())
                .await;
        }
    }

    /// Deliver an envelope to a topic's subscribers directly (orphans, model
    /// events injected by the supervisor).
    pub async fn publish(&self, topic: &str, envelope: Envelope) {
        self.publish_with_key(topic, None, envelope).await;
    }

    async fn publish_with_key(&self, topic: &str, coalesce_key: Option<i64>, envelope: Envelope) {
        let slots: Vec<Arc<TopicQueue>> = {
            let table = self.topics.lock().expect("topic lock");
            match table.get(topic) {
                Some(slots) => slots.iter().map(|s| s.queue.clone()).collect(),
                None => return,
            }
        };
        for queue in slots {
            queue.push(coalesce_key, envelope.clone()).await;
        }
    }

    /// Every inbound envelope passes through here before any routing.
    pub fn tap_send(&self, envelope: &Envelope) {
        // Lagging tap receivers lose old envelopes; the tap never blocks.
        let _ = self.raw_tap.send(envelope.clone());
    }

    pub fn tap(&self) -> broadcast::Receiver<Envelope> {
        self.raw_tap.subscribe()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("topic lock").len()
    }
}
