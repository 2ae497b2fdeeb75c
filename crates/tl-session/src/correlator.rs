//! Request–response correlator.
//!
//! Maps each in-flight correlation id to a one-shot completion sink with a
//! deadline.  An entry is resolved exactly once — by the matching inbound
//! envelope, by deadline expiry, by caller cancellation, or by transport
//! loss — and removed in the same step.  Correlation ids are uuid-v4 and
//! never reused while pending.

use crate::error::SessionError;
use crate::hooks::Metrics;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tl_protocol::{Envelope, ErrorRes, decode_body, tags};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Housekeeping granularity: expired entries resolve within one tick.
pub const HOUSEKEEPING_TICK: Duration = Duration::from_millis(100);

struct PendingEntry {
    tx: oneshot::Sender<Result<Bytes, SessionError>>,
    deadline: Instant,
    /// Cancels the queued frame if it has not reached the wire yet.
    cancel_send: CancellationToken,
}

pub struct Correlator {
    pending: Mutex<HashMap<String, PendingEntry>>,
    metrics: Arc<Metrics>,
}

impl Correlator {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    /// Register a fresh pending request and hand back the caller's half.
    ///
    /// `cancel_send` must be the send job's token so that cancellation and
    /// expiry can stop the frame before the wire.
    pub fn register(
        self: &Arc<Self>,
        timeout: Duration,
        cancel_send: CancellationToken,
    ) -> PendingReply {
        let correlation_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            tx,
            deadline: Instant::now() + timeout,
            cancel_send,
        };
        let previous = self
            .pending
            .lock()
            .expect("pending lock")
            .insert(correlation_id.clone(), entry);
        debug_assert!(previous.is_none(), "correlation id collision");
        PendingReply {
            correlation_id,
            rx,
            correlator: Arc::downgrade(self),
            resolved: false,
        }
    }

    /// Deliver an inbound correlated envelope to its pending entry.
    ///
    /// Returns the envelope back when nothing is pending under its id (a
    /// late response after cancellation or expiry) so the caller can route
    /// it to the orphan topic.
    pub fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        let Some(id) = envelope.correlation_id.as_deref() else {
            return Some(envelope);
        };
        let entry = self.pending.lock().expect("pending lock").remove(id);
        let Some(entry) = entry else {
            return Some(envelope);
        };
        self.metrics.incr_responses_received();
        let outcome = if envelope.payload_type == tags::ERROR_RES {
            match decode_body::<ErrorRes>(&envelope.payload) {
                Ok(body) => Err(SessionError::remote(body)),
                Err(e) => Err(SessionError::Protocol(format!(
                    "malformed error response: {e}"
                ))),
            }
        } else {
            Ok(envelope.payload)
        };
        let _ = entry.tx.send(outcome);
        None
    }

    /// Resolve an entry with `Cancelled` and stop its frame if still queued.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(correlation_id);
        match entry {
            Some(entry) => {
                entry.cancel_send.cancel();
                self.metrics.incr_cancellations();
                let _ = entry.tx.send(Err(SessionError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Remove an entry without delivering anything (dropped caller).
    fn deregister(&self, correlation_id: &str) {
        let entry = self
            .pending
            .lock()
            .expect("pending lock")
            .remove(correlation_id);
        if let Some(entry) = entry {
            entry.cancel_send.cancel();
            self.metrics.incr_cancellations();
        }
    }

    /// Fail every pending entry; used on transport loss and fatal auth.
    pub fn fail_all(&self, make_err: impl Fn() -> SessionError) {
        let drained: Vec<(String, PendingEntry)> = self
            .pending
            .lock()
            .expect("pending lock")
            .drain()
            .collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), "failing all pending requests");
        }
        for (_, entry) in drained {
            entry.cancel_send.cancel();
            let _ = entry.tx.send(Err(make_err()));
        }
    }

    /// Resolve every entry whose deadline has passed.  Housekeeping body.
    pub fn expire_due(&self, now: Instant) {
        let expired: Vec<(String, PendingEntry)> = {
            let mut pending = self.pending.lock().expect("pending lock");
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };
        for (id, entry) in expired {
            debug!(correlation_id = %id, "request deadline expired");
            entry.cancel_send.cancel();
            self.metrics.incr_timeouts();
            let _ = entry.tx.send(Err(SessionError::Timeout));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }
}

/// Periodic deadline scan; one task per session.
pub async fn run_housekeeping(correlator: Arc<Correlator>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(HOUSEKEEPING_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            _ = tick.tick() => correlator.expire_due(Instant::now()),
        }
    }
}

// ---------------------------------------------------------------------------
// PendingReply
// ---------------------------------------------------------------------------

/// The caller's half of a pending request.
///
/// `wait()` resolves with the response payload or the typed error.
/// `cancel()` resolves the request with `Cancelled` and stops the frame if
/// it has not been written yet.  Dropping an unresolved reply deregisters
/// the entry silently — a cancelled request never delivers a value.
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<Result<Bytes, SessionError>>,
    correlator: std::sync::Weak<Correlator>,
    resolved: bool,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Await the resolution.
    pub async fn wait(mut self) -> Result<Bytes, SessionError> {
        let outcome = (&mut self.rx).await;
        self.resolved = true;
        match outcome {
            Ok(result) => result,
            // Sender dropped without resolving: the session went away.
            Err(_) => Err(SessionError::Closed),
        }
    }

    /// Cancel the request.  Safe to call at any point before resolution.
    pub fn cancel(&self) {
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.cancel(&self.correlation_id);
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // Only deregister when nothing was delivered yet; a resolved entry
        // is already gone from the map.
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.deregister(&self.correlation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tl_protocol::encode_body;

    fn correlator() -> Arc<Correlator> {
        Correlator::new(Arc::new(Metrics::default()))
    }

    #[tokio::test]
    async fn response_resolves_pending_entry() {
        let correlator = correlator();
        let reply = correlator.register(Duration::from_secs(5), CancellationToken::new());
        let id = reply.correlation_id().to_owned();

        let unmatched = correlator.resolve(Envelope::with_correlation(
            2101,
            Bytes::from_static(b"\x01"),
            id,
        ));
        assert!(unmatched.is_none());
        assert_eq!(reply.wait().await.unwrap(), Bytes::from_static(b"\x01"));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_ids() {
        let correlator = correlator();
        let a = correlator.register(Duration::from_secs(5), CancellationToken::new());
        let b = correlator.register(Duration::from_secs(5), CancellationToken::new());
        assert_ne!(a.correlation_id(), b.correlation_id());
        assert_eq!(correlator.pending_count(), 2);
    }

    #[tokio::test]
    async fn error_response_resolves_with_remote_error() {
        let correlator = correlator();
        let reply = correlator.register(Duration::from_secs(5), CancellationToken::new());
        let id = reply.correlation_id().to_owned();

        let body = encode_body(&ErrorRes {
            error_code: "TRADING_BAD_VOLUME".to_owned(),
            description: "volume below minimum".to_owned(),
            maintenance_end_ms: None,
        })
        .unwrap();
        correlator.resolve(Envelope::with_correlation(tags::ERROR_RES, body, id));

        match reply.wait().await {
            Err(SessionError::Remote { code, .. }) => assert_eq!(code, "TRADING_BAD_VOLUME"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_resolves_timeout_and_cancels_send() {
        let correlator = correlator();
        let send_token = CancellationToken::new();
        let reply = correlator.register(Duration::from_millis(100), send_token.clone());

        tokio::time::sleep(Duration::from_millis(150)).await;
        correlator.expire_due(Instant::now());

        assert!(matches!(reply.wait().await, Err(SessionError::Timeout)));
        assert!(send_token.is_cancelled());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_resolves_cancelled_and_stops_frame() {
        let correlator = correlator();
        let send_token = CancellationToken::new();
        let reply = correlator.register(Duration::from_secs(5), send_token.clone());

        reply.cancel();
        assert!(send_token.is_cancelled());
        assert!(matches!(reply.wait().await, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn late_response_after_cancel_is_returned_as_orphan() {
        let correlator = correlator();
        let reply = correlator.register(Duration::from_secs(5), CancellationToken::new());
        let id = reply.correlation_id().to_owned();
        reply.cancel();

        let envelope = Envelope::with_correlation(2101, Bytes::new(), id);
        let orphan = correlator.resolve(envelope.clone());
        assert_eq!(orphan, Some(envelope));
    }

    #[tokio::test]
    async fn dropping_reply_deregisters_entry() {
        let correlator = correlator();
        let send_token = CancellationToken::new();
        let reply = correlator.register(Duration::from_secs(5), send_token.clone());
        drop(reply);
        assert_eq!(correlator.pending_count(), 0);
        assert!(send_token.is_cancelled());
    }

    #[tokio::test]
    async fn fail_all_resolves_every_entry_with_transport_loss() {
        let correlator = correlator();
        let a = correlator.register(Duration::from_secs(5), CancellationToken::new());
        let b = correlator.register(Duration::from_secs(5), CancellationToken::new());

        correlator.fail_all(|| SessionError::TransportLost);

        assert!(matches!(a.wait().await, Err(SessionError::TransportLost)));
        assert!(matches!(b.wait().await, Err(SessionError::TransportLost)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn resolution_happens_at_most_once() {
        let correlator = correlator();
        let reply = correlator.register(Duration::from_secs(5), CancellationToken::new());
        let id = reply.correlation_id().to_owned();

        correlator.resolve(Envelope::with_correlation(2101, Bytes::new(), id.clone()));
        // Second delivery under the same id finds no entry.
        let dup = Envelope::with_correlation(2101, Bytes::new(), id);
        assert!(correlator.resolve(dup).is_some());
    }
}
