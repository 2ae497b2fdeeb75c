//! Heartbeat engine.
//!
//! Watches the instant of the last successfully written frame.  After
//! `heartbeat_idle` without a write it enqueues a keepalive, which passes
//! through the rate bucket like every other frame.  Inbound keepalives are
//! answered by the read loop via [`keepalive_job`].

use crate::limiter::SendJob;
use bytes::Bytes;
use tl_protocol::{Envelope, tags};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Build the job for one keepalive frame.  No correlation id; keepalives
/// never surface to user streams.
pub fn keepalive_job() -> SendJob {
    let frame = Envelope::new(tags::KEEPALIVE, Bytes::new())
        .encode()
        .expect("keepalive envelope is always well-formed");
    SendJob::new(frame, None)
}

pub struct HeartbeatEngine {
    idle: std::time::Duration,
    send_tx: mpsc::Sender<SendJob>,
    last_write: watch::Receiver<Instant>,
}

impl HeartbeatEngine {
    pub fn new(
        idle: std::time::Duration,
        send_tx: mpsc::Sender<SendJob>,
        last_write: watch::Receiver<Instant>,
    ) -> Self {
        Self {
            idle,
            send_tx,
            last_write,
        }
    }

    /// Timer task: one per session, runs until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let deadline = *self.last_write.borrow_and_update() + self.idle;
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return,
                changed = self.last_write.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // A frame went out; recompute the idle deadline.
                }
                () = tokio::time::sleep_until(deadline) => {
                    trace!("idle interval elapsed, enqueueing keepalive");
                    if self.send_tx.send(keepalive_job()).await.is_err() {
                        return;
                    }
                    // Wait for the keepalive (or anything else) to reach the
                    // wire before arming the timer again, so a stalled
                    // bucket does not flood the queue.
                    tokio::select! {
                        biased;
                        () = shutdown.cancelled() => return,
                        changed = self.last_write.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Read-loop reply to a server keepalive: enqueue one of ours right away.
pub fn reply_to_keepalive(send_tx: &mpsc::Sender<SendJob>) {
    if send_tx.try_send(keepalive_job()).is_err() {
        debug!("send queue full, dropping keepalive reply");
    }
}
