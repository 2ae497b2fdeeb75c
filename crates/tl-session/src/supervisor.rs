//! Reconnect supervisor.
//!
//! Owns the connection lifecycle: it establishes connections (spawning the
//! per-connection read and write tasks and driving the auth handshake),
//! watches for transport-loss reports, and runs the backoff + re-auth +
//! refresh + rearm cycle.  Recovery is refresh-only: server state is
//! re-read, but trading requests are never replayed.

use crate::auth::SessionState;
use crate::config::SessionConfig;
use crate::dispatcher::MODEL_TOPIC;
use crate::error::SessionError;
use crate::limiter;
use crate::session::{self, SessionCore, internal_request};
use crate::transport;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tl_protocol::{Envelope, ReconcileReq, SymbolsListReq, TraderReq, encode_body, tags};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A transport-loss report from a read or write task.
#[derive(Debug)]
pub(crate) struct LossEvent {
    /// The connection generation the reporting task belonged to; stale
    /// reports from already-replaced connections are ignored.
    pub epoch: u64,
    pub error: SessionError,
}

/// Handle on one live connection's tasks.
pub(crate) struct ConnGuard {
    pub cancel: CancellationToken,
    pub epoch: u64,
}

/// Open the transport, spawn the per-connection tasks, and drive the
/// handshake to `Ready`.  On handshake failure the connection is torn down
/// before the error is returned.
pub(crate) async fn establish(core: &Arc<SessionCore>) -> Result<ConnGuard, SessionError> {
    core.auth.set_state(SessionState::Connecting);
    // Bound the TCP+TLS dial so a black-holed gateway cannot stall the
    // reconnect cycle.
    let (reader, writer) =
        match tokio::time::timeout(core.cfg.request_timeout, transport::connect(&core.cfg)).await {
            Ok(result) => result?,
            Err(_) => return Err(SessionError::Timeout),
        };

    let mut epoch = 0;
    core.epoch_tx.send_modify(|v| {
        *v += 1;
        epoch = *v;
    });

    let conn_cancel = core.shutdown.child_token();
    tokio::spawn(session::run_read_loop(
        core.clone(),
        reader,
        conn_cancel.clone(),
        epoch,
    ));
    {
        let core = core.clone();
        let conn_cancel = conn_cancel.clone();
        tokio::spawn(async move {
            let result = limiter::run_send_loop(
                writer,
                core.send_queue.clone(),
                core.cfg.rate_limit_per_second,
                core.last_write_tx.clone(),
                core.metrics.clone(),
                conn_cancel,
            )
            .await;
            if let Err(error) = result {
                let _ = core.loss_tx.try_send(LossEvent { epoch, error });
            }
        });
    }

    let handshake = core
        .auth
        .run_handshake(|payload_type, body| {
            internal_request(core, payload_type, body, core.cfg.request_timeout)
        })
        .await;
    match handshake {
        Ok(()) => Ok(ConnGuard {
            cancel: conn_cancel,
            epoch,
        }),
        Err(e) => {
            conn_cancel.cancel();
            Err(e)
        }
    }
}

/// The supervisor task: one per session, runs until shutdown or fatal.
pub(crate) async fn run(
    core: Arc<SessionCore>,
    mut loss_rx: mpsc::Receiver<LossEvent>,
    mut conn: ConnGuard,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = core.shutdown.cancelled() => {
                conn.cancel.cancel();
                return;
            }
            event = loss_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        if event.epoch < conn.epoch {
            debug!(epoch = event.epoch, "ignoring stale transport-loss report");
            continue;
        }
        warn!(error = %event.error, "transport lost");
        conn.cancel.cancel();
        core.correlator.fail_all(|| SessionError::TransportLost);

        if !core.cfg.reconnect_enabled {
            core.auth.set_state(SessionState::Disconnected);
            core.registry.close_all();
            return;
        }

        core.auth.set_state(SessionState::Reconnecting);
        match reconnect_cycle(&core).await {
            Ok(new_conn) => conn = new_conn,
            Err(e) => {
                warn!(error = %e, "reconnect failed permanently");
                core.auth.set_state(SessionState::Fatal);
                core.hooks.reconnect_fatal(&e).await;
                core.correlator
                    .fail_all(|| SessionError::AuthFailed("session is fatal".to_owned()));
                core.registry.close_all();
                return;
            }
        }
    }
}

/// Back off, re-establish, refresh server state, rearm subscriptions.
///
/// Retriable failures loop with exponential backoff; a non-retriable auth
/// failure (or attempt exhaustion) is returned and ends the session.
async fn reconnect_cycle(core: &Arc<SessionCore>) -> Result<ConnGuard, SessionError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        core.metrics.incr_reconnect_attempts();
        core.hooks.reconnect_attempt(attempt).await;
        let delay = backoff_delay(&core.cfg, attempt);
        if core.cfg.diagnostics {
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
        }
        tokio::select! {
            biased;
            () = core.shutdown.cancelled() => return Err(SessionError::Closed),
            () = tokio::time::sleep(delay) => {}
        }

        core.auth.set_state(SessionState::Reconnecting);
        match establish(core).await {
            Ok(conn) => {
                refresh_models(core).await;
                core.registry
                    .rearm_all(|payload_type, payload| {
                        internal_request(core, payload_type, payload, core.cfg.request_timeout)
                    })
                    .await;
                core.metrics.incr_reconnect_successes();
                core.hooks.reconnect_success(attempt).await;
                info!(attempt, "reconnected");
                return Ok(conn);
            }
            Err(e @ SessionError::AuthFailed(_)) => return Err(e),
            Err(e) => {
                warn!(attempt, error = %e, "reconnect attempt failed");
                if let Some(max) = core.cfg.reconnect_max_attempts {
                    if attempt >= max {
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Refresh-only recovery: re-fetch the symbols catalog, account info, and
/// the positions/orders reconcile snapshot, publishing each response on the
/// `model` topic.  Best-effort — a failed fetch logs and moves on.
async fn refresh_models(core: &Arc<SessionCore>) {
    let fetches = [
        (
            tags::SYMBOLS_LIST_REQ,
            tags::SYMBOLS_LIST_RES,
            encode_body(&SymbolsListReq {}),
        ),
        (tags::TRADER_REQ, tags::TRADER_RES, encode_body(&TraderReq {})),
        (
            tags::RECONCILE_REQ,
            tags::RECONCILE_RES,
            encode_body(&ReconcileReq {}),
        ),
    ];
    for (req_tag, res_tag, body) in fetches {
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(payload_type = req_tag, error = %e, "cannot encode refresh request");
                continue;
            }
        };
        match internal_request(core, req_tag, body, core.cfg.request_timeout).await {
            Ok(payload) => {
                core.dispatcher
                    .publish(MODEL_TOPIC, Envelope::new(res_tag, payload))
                    .await;
            }
            Err(e) => {
                warn!(payload_type = req_tag, error = %e, "refresh fetch failed");
            }
        }
    }
}

/// Exponential backoff with ±20% jitter: base 500 ms, factor 2, cap 30 s by
/// default.
fn backoff_delay(cfg: &SessionConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let base_ms = cfg.reconnect_backoff_base.as_millis() as u64;
    let cap_ms = cfg.reconnect_backoff_cap.as_millis() as u64;
    let capped = base_ms.saturating_mul(1_u64 << shift).min(cap_ms);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped as f64 * jitter) as u64)
}
