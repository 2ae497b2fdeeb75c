//! Stream registry: the live subscription set.
//!
//! The registry owns every subscription's queue registration and its
//! resubscribe recipe.  Streams hold a [`Subscription`] handle — a weak
//! capability back to the registry, so dropping the session never leaves a
//! stream pointing at freed state.  After each reconnect the supervisor asks
//! the registry to rearm everything still alive.

use crate::dispatcher::{Dispatcher, QueuePolicy, TopicQueue};
use crate::error::SessionError;
use crate::hooks::Metrics;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tl_protocol::Envelope;
use tracing::{debug, warn};

/// One request of a resubscribe recipe: enough to rearm a subscription on a
/// fresh, authenticated session.
#[derive(Debug, Clone)]
pub struct RecipeStep {
    pub payload_type: u32,
    pub payload: Bytes,
}

struct Entry {
    topics: Vec<String>,
    queue: Arc<TopicQueue>,
    recipe: Vec<RecipeStep>,
}

pub struct StreamRegistry {
    entries: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
}

impl StreamRegistry {
    pub fn new(dispatcher: Arc<Dispatcher>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dispatcher,
            metrics,
        })
    }

    /// Allocate a bounded queue, register it under every topic, and record
    /// the recipe for reconnect rearm.
    pub fn open(
        self: &Arc<Self>,
        topics: Vec<String>,
        capacity: usize,
        policy: QueuePolicy,
        recipe: Vec<RecipeStep>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = TopicQueue::new(capacity, policy, self.metrics.clone());
        for topic in &topics {
            self.dispatcher.register(topic, id, queue.clone());
        }
        self.entries.lock().expect("registry lock").insert(
            id,
            Entry {
                topics: topics.clone(),
                queue: queue.clone(),
                recipe,
            },
        );
        debug!(subscription_id = id, ?topics, "subscription opened");
        Subscription {
            id,
            queue,
            registry: Arc::downgrade(self),
        }
    }

    /// Remove one subscription and end its stream.
    pub fn close(&self, id: u64) {
        let entry = self.entries.lock().expect("registry lock").remove(&id);
        if let Some(entry) = entry {
            self.dispatcher.deregister(&entry.topics, id);
            entry.queue.close();
            debug!(subscription_id = id, "subscription closed");
        }
    }

    /// Close every subscription; used on fatal auth and explicit disconnect.
    pub fn close_all(&self) {
        let drained: Vec<(u64, Entry)> = self
            .entries
            .lock()
            .expect("registry lock")
            .drain()
            .collect();
        for (id, entry) in drained {
            self.dispatcher.deregister(&entry.topics, id);
            entry.queue.close();
        }
    }

    /// Re-issue every live subscription's recipe, best-effort.
    ///
    /// A failed rearm logs and continues: the consumer sees a possibly empty
    /// interval on that stream, not an end-of-stream.
    pub async fn rearm_all<F, Fut>(&self, send: F)
    where
        F: Fn(u32, Bytes) -> Fut,
        Fut: Future<Output = Result<Bytes, SessionError>>,
    {
        let recipes: Vec<(u64, Vec<RecipeStep>)> = self
            .entries
            .lock()
            .expect("registry lock")
            .iter()
            .map(|(id, entry)| (*id, entry.recipe.clone()))
            .collect();
        for (id, recipe) in recipes {
            for step in recipe {
                if let Err(e) = send(step.payload_type, step.payload).await {
                    warn!(
                        subscription_id = id,
                        payload_type = step.payload_type,
                        error = %e,
                        "failed to rearm subscription"
                    );
                    break;
                }
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().expect("registry lock").len()
    }
}

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// A stream's handle on its queue.  Dropping it closes the subscription and
/// removes it from the registry.
pub struct Subscription {
    id: u64,
    queue: Arc<TopicQueue>,
    registry: Weak<StreamRegistry>,
}

impl Subscription {
    /// Next raw envelope; `None` once the subscription is closed and drained.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        self.queue.pop().await
    }

    pub fn close(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.close(self.id);
        } else {
            // Session already gone; just end the stream.
            self.queue.close();
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
