//! Rate-limited send scheduler.
//!
//! A token bucket with integer capacity N is refilled to N once per second.
//! Every outbound frame — user requests, auth, keepalives — consumes one
//! token; there are no priority lanes, because the rate limit is a contract
//! with the server.  The scheduler is the single writer of the socket.
//!
//! The job queue outlives any one connection: after a reconnect the next
//! scheduler re-acquires the shared receiver, so a frame queued before the
//! loss is still written (unless its cancellation token fired in the
//! meantime — cancellation state, not queue identity, decides a frame's
//! fate).

use crate::error::SessionError;
use crate::hooks::Metrics;
use crate::transport::FrameWriter;
use bytes::Bytes;
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const REFILL_INTERVAL: Duration = Duration::from_secs(1);

/// One frame waiting for the wire.
#[derive(Debug)]
pub struct SendJob {
    /// Encoded envelope, without the length prefix (the codec adds it).
    pub frame: Bytes,
    /// Cancelled jobs are discarded before the socket write.
    pub cancel: CancellationToken,
    pub correlation_id: Option<String>,
}

impl SendJob {
    pub fn new(frame: Bytes, correlation_id: Option<String>) -> Self {
        Self {
            frame,
            cancel: CancellationToken::new(),
            correlation_id,
        }
    }
}

pub type SendQueue = Arc<Mutex<mpsc::Receiver<SendJob>>>;

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

/// Integer token bucket refilled to capacity once per second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    tokens: u32,
    window_start: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            tokens: capacity,
            window_start: Instant::now(),
        }
    }

    /// Take one token, suspending until the next refill when empty.
    pub async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            if now.duration_since(self.window_start) >= REFILL_INTERVAL {
                self.tokens = self.capacity;
                self.window_start = now;
            }
            if self.tokens > 0 {
                self.tokens -= 1;
                return;
            }
            tokio::time::sleep_until(self.window_start + REFILL_INTERVAL).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

/// Drain the shared job queue onto one connection's writer half.
///
/// Returns `Ok(())` when the connection token is cancelled or the session
/// shuts down, `Err` when the socket write fails (the caller reports the
/// loss to the supervisor).
pub async fn run_send_loop(
    mut writer: FrameWriter,
    queue: SendQueue,
    rate_limit: u32,
    last_write: watch::Sender<Instant>,
    metrics: Arc<Metrics>,
    conn_cancel: CancellationToken,
) -> Result<(), SessionError> {
    let mut bucket = TokenBucket::new(rate_limit);
    let mut rx = queue.lock().await;

    loop {
        let job = tokio::select! {
            biased;
            () = conn_cancel.cancelled() => return Ok(()),
            job = rx.recv() => match job {
                Some(job) => job,
                // All senders gone: the session is being dropped.
                None => return Ok(()),
            },
        };

        if job.cancel.is_cancelled() {
            trace!(correlation_id = ?job.correlation_id, "discarding cancelled frame");
            continue;
        }

        tokio::select! {
            biased;
            () = conn_cancel.cancelled() => return Ok(()),
            () = bucket.acquire() => {}
        }

        // Re-check: the caller may have cancelled while we waited for a token.
        if job.cancel.is_cancelled() {
            trace!(correlation_id = ?job.correlation_id, "discarding cancelled frame");
            continue;
        }

        let frame_len = job.frame.len();
        if let Err(e) = writer.send(job.frame).await {
            debug!(error = %e, "socket write failed");
            return Err(SessionError::Io(e));
        }
        metrics.add_bytes_sent(frame_len as u64 + tl_protocol::LENGTH_PREFIX_BYTES as u64);
        let _ = last_write.send(Instant::now());
    }
}
