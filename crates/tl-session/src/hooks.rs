//! Hook points and session metrics.
//!
//! Hooks run sequentially in the task that triggered them — the request
//! path for send/response hooks, the supervisor for reconnect hooks — and
//! never in the read loop, so a slow hook only delays its own request.

use crate::error::SessionError;
use bytes::Bytes;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Observer seam for request and reconnect lifecycles.
///
/// All methods default to no-ops; implement the ones you need.
#[async_trait::async_trait]
pub trait SessionHooks: Send + Sync {
    async fn pre_send_request(&self, _payload_type: u32, _correlation_id: &str) {}
    async fn post_send_request(&self, _payload_type: u32, _correlation_id: &str) {}
    async fn post_response(
        &self,
        _payload_type: u32,
        _correlation_id: &str,
        _outcome: &Result<Bytes, SessionError>,
    ) {
    }
    async fn reconnect_attempt(&self, _attempt: u32) {}
    async fn reconnect_success(&self, _attempt: u32) {}
    async fn reconnect_fatal(&self, _reason: &SessionError) {}
}

/// Ordered fan-out to every registered hook.
#[derive(Clone, Default)]
pub struct HookBus {
    hooks: Vec<std::sync::Arc<dyn SessionHooks>>,
}

impl HookBus {
    pub fn new(hooks: Vec<std::sync::Arc<dyn SessionHooks>>) -> Self {
        Self { hooks }
    }

    pub async fn pre_send_request(&self, payload_type: u32, correlation_id: &str) {
        for hook in &self.hooks {
            hook.pre_send_request(payload_type, correlation_id).await;
        }
    }

    pub async fn post_send_request(&self, payload_type: u32, correlation_id: &str) {
        for hook in &self.hooks {
            hook.post_send_request(payload_type, correlation_id).await;
        }
    }

    pub async fn post_response(
        &self,
        payload_type: u32,
        correlation_id: &str,
        outcome: &Result<Bytes, SessionError>,
    ) {
        for hook in &self.hooks {
            hook.post_response(payload_type, correlation_id, outcome)
                .await;
        }
    }

    pub async fn reconnect_attempt(&self, attempt: u32) {
        for hook in &self.hooks {
            hook.reconnect_attempt(attempt).await;
        }
    }

    pub async fn reconnect_success(&self, attempt: u32) {
        for hook in &self.hooks {
            hook.reconnect_success(attempt).await;
        }
    }

    pub async fn reconnect_fatal(&self, reason: &SessionError) {
        for hook in &self.hooks {
            hook.reconnect_fatal(reason).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Session counters.  All monotonic; read with [`Metrics::snapshot`].
#[derive(Debug, Default)]
pub struct Metrics {
    requests_sent: AtomicU64,
    bytes_sent: AtomicU64,
    responses_received: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    orphans: AtomicU64,
    inbound_dropped: AtomicU64,
    inbound_unrouted: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnect_successes: AtomicU64,
    latency: Mutex<Latency>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Latency {
    count: u64,
    min_us: u64,
    max_us: u64,
    sum_us: u64,
}

impl Metrics {
    pub fn incr_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_responses_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cancellations(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_orphans(&self) {
        self.orphans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_inbound_unrouted(&self) {
        self.inbound_unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconnect_successes(&self) {
        self.reconnect_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one request's pre-send to post-response latency.
    pub fn record_latency(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut latency = self.latency.lock().expect("latency lock");
        if latency.count == 0 {
            latency.min_us = us;
            latency.max_us = us;
        } else {
            latency.min_us = latency.min_us.min(us);
            latency.max_us = latency.max_us.max(us);
        }
        latency.count += 1;
        latency.sum_us = latency.sum_us.saturating_add(us);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = *self.latency.lock().expect("latency lock");
        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            orphans: self.orphans.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            inbound_unrouted: self.inbound_unrouted.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnect_successes: self.reconnect_successes.load(Ordering::Relaxed),
            latency_count: latency.count,
            latency_min_us: latency.min_us,
            latency_max_us: latency.max_us,
            latency_sum_us: latency.sum_us,
        }
    }
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_sent: u64,
    pub bytes_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub orphans: u64,
    pub inbound_dropped: u64,
    pub inbound_unrouted: u64,
    pub reconnect_attempts: u64,
    pub reconnect_successes: u64,
    pub latency_count: u64,
    pub latency_min_us: u64,
    pub latency_max_us: u64,
    pub latency_sum_us: u64,
}
