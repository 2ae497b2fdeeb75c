//! The public session handle and the per-session runtime wiring.
//!
//! A `Session` composes one transport, one correlator, one dispatcher, one
//! registry, one auth state machine, and one reconnect supervisor.  Exactly
//! one read-loop task owns the socket's read half and one scheduler task
//! owns the write half; everything else communicates through channels.

use crate::auth::{AuthFsm, SessionState};
use crate::config::SessionConfig;
use crate::correlator::{self, Correlator, PendingReply};
use crate::dispatcher::{Dispatcher, MODEL_TOPIC, ORPHAN_TOPIC, QueuePolicy};
use crate::error::SessionError;
use crate::heartbeat::{self, HeartbeatEngine};
use crate::hooks::{HookBus, Metrics, MetricsSnapshot, SessionHooks};
use crate::limiter::{SendJob, SendQueue};
use crate::registry::{RecipeStep, StreamRegistry, Subscription};
use crate::streams::{
    CandleStream, DepthStream, EnvelopeStream, ExecutionStream, TickStream,
};
use crate::supervisor::{self, LossEvent};
use crate::transport::FrameReader;
use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tl_protocol::{
    Envelope, SubscribeDepthReq, SubscribeSpotsReq, SubscribeTrendbarReq, TrendbarPeriod,
    encode_body, tags,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Depth of the outbound job queue shared by all senders.
const SEND_QUEUE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// SessionCore
// ---------------------------------------------------------------------------

/// Everything the runtime tasks share.  Owned behind one `Arc`; the public
/// [`Session`] is a cheap handle on it.
pub(crate) struct SessionCore {
    pub(crate) cfg: SessionConfig,
    pub(crate) auth: AuthFsm,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) registry: Arc<StreamRegistry>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) hooks: HookBus,
    pub(crate) send_tx: mpsc::Sender<SendJob>,
    pub(crate) send_queue: SendQueue,
    pub(crate) last_write_tx: watch::Sender<Instant>,
    /// Bumped on every established connection; depth books rebuild on it.
    pub(crate) epoch_tx: watch::Sender<u64>,
    pub(crate) loss_tx: mpsc::Sender<LossEvent>,
    pub(crate) shutdown: CancellationToken,
}

impl SessionCore {
    fn new(cfg: SessionConfig, hooks: HookBus) -> (Arc<Self>, mpsc::Receiver<LossEvent>) {
        let metrics = Arc::new(Metrics::default());
        let dispatcher = Dispatcher::new(metrics.clone());
        let registry = StreamRegistry::new(dispatcher.clone(), metrics.clone());
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (last_write_tx, _) = watch::channel(Instant::now());
        let (epoch_tx, _) = watch::channel(0);
        let (loss_tx, loss_rx) = mpsc::channel(8);
        let core = Arc::new(Self {
            auth: AuthFsm::new(&cfg),
            correlator: Correlator::new(metrics.clone()),
            dispatcher,
            registry,
            metrics,
            hooks,
            send_tx,
            send_queue: Arc::new(tokio::sync::Mutex::new(send_rx)),
            last_write_tx,
            epoch_tx,
            loss_tx,
            shutdown: CancellationToken::new(),
            cfg,
        });
        (core, loss_rx)
    }
}

/// Register, encode, and enqueue one correlated request; no readiness gate,
/// no hooks.  Used by the handshake, the supervisor, and subscribe calls.
pub(crate) async fn internal_request(
    core: &Arc<SessionCore>,
    payload_type: u32,
    payload: Bytes,
    timeout: Duration,
) -> Result<Bytes, SessionError> {
    let reply = start_request(core, payload_type, payload, timeout).await?;
    reply.wait().await
}

/// The enqueue half of [`internal_request`].
pub(crate) async fn start_request(
    core: &Arc<SessionCore>,
    payload_type: u32,
    payload: Bytes,
    timeout: Duration,
) -> Result<PendingReply, SessionError> {
    let job_cancel = CancellationToken::new();
    let reply = core.correlator.register(timeout, job_cancel.clone());
    let envelope = Envelope::with_correlation(payload_type, payload, reply.correlation_id());
    let frame = envelope.encode()?;
    let job = SendJob {
        frame,
        cancel: job_cancel,
        correlation_id: Some(reply.correlation_id().to_owned()),
    };
    if core.send_tx.send(job).await.is_err() {
        return Err(SessionError::Closed);
    }
    core.metrics.incr_requests_sent();
    Ok(reply)
}

/// Tear the whole session down.  Idempotent; used by `disconnect` and by
/// the drop guard.
pub(crate) fn teardown(core: &Arc<SessionCore>) {
    core.shutdown.cancel();
    if core.auth.state() != SessionState::Fatal {
        core.auth.set_state(SessionState::Disconnected);
    }
    core.correlator.fail_all(|| SessionError::TransportLost);
    core.registry.close_all();
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// One per connection.  Owns the read half; decodes envelopes and routes
/// them to the correlator (correlated) or the dispatcher (pushes).
pub(crate) async fn run_read_loop(
    core: Arc<SessionCore>,
    mut reader: FrameReader,
    conn_cancel: CancellationToken,
    epoch: u64,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = conn_cancel.cancelled() => return,
            frame = reader.next() => frame,
        };
        match frame {
            None => {
                report_loss(&core, epoch, SessionError::TransportLost);
                return;
            }
            Some(Err(e)) => {
                report_loss(&core, epoch, SessionError::Io(e));
                return;
            }
            Some(Ok(buf)) => match Envelope::decode(buf.freeze()) {
                Ok(envelope) => handle_envelope(&core, envelope).await,
                Err(e) => {
                    warn!(error = %e, "malformed envelope, dropping connection");
                    report_loss(&core, epoch, e.into());
                    return;
                }
            },
        }
    }
}

async fn handle_envelope(core: &Arc<SessionCore>, envelope: Envelope) {
    core.dispatcher.tap_send(&envelope);
    if envelope.payload_type == tags::KEEPALIVE {
        heartbeat::reply_to_keepalive(&core.send_tx);
        return;
    }
    if envelope.correlation_id.is_some() {
        if let Some(orphan) = core.correlator.resolve(envelope) {
            core.metrics.incr_orphans();
            core.dispatcher.publish(ORPHAN_TOPIC, orphan).await;
        }
    } else {
        core.dispatcher.dispatch(envelope).await;
    }
}

fn report_loss(core: &Arc<SessionCore>, epoch: u64, error: SessionError) {
    let _ = core.loss_tx.try_send(LossEvent { epoch, error });
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Cancels the runtime when the last public handle goes away.
struct ShutdownGuard {
    core: Arc<SessionCore>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        teardown(&self.core);
    }
}

/// Tears the runtime down if `connect` is dropped mid-flight (caller
/// cancellation), so a half-opened transport never leaks its tasks.
struct ConnectAbort {
    core: Arc<SessionCore>,
    armed: bool,
}

impl Drop for ConnectAbort {
    fn drop(&mut self) {
        if self.armed {
            self.core.shutdown.cancel();
            self.core.auth.set_state(SessionState::Disconnected);
        }
    }
}

/// The public handle.  Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
    _guard: Arc<ShutdownGuard>,
}

impl Session {
    /// Connect, authenticate, and start the runtime tasks.
    pub async fn connect(cfg: SessionConfig) -> Result<Self, SessionError> {
        Self::connect_with_hooks(cfg, Vec::new()).await
    }

    /// `connect` with observer hooks attached from the first frame on.
    pub async fn connect_with_hooks(
        cfg: SessionConfig,
        hooks: Vec<Arc<dyn SessionHooks>>,
    ) -> Result<Self, SessionError> {
        cfg.validate()?;
        if cfg.diagnostics {
            info!(host = %cfg.host, port = cfg.port, tls = cfg.tls, "connecting session");
        }
        let (core, loss_rx) = SessionCore::new(cfg, HookBus::new(hooks));
        let mut abort = ConnectAbort {
            core: core.clone(),
            armed: true,
        };
        // Deadline scanning must already run while the handshake is in
        // flight, or an unanswered auth request would hang forever.
        tokio::spawn(correlator::run_housekeeping(
            core.correlator.clone(),
            core.shutdown.clone(),
        ));
        match supervisor::establish(&core).await {
            Ok(conn) => {
                let engine = HeartbeatEngine::new(
                    core.cfg.heartbeat_idle,
                    core.send_tx.clone(),
                    core.last_write_tx.subscribe(),
                );
                tokio::spawn(engine.run(core.shutdown.clone()));
                tokio::spawn(supervisor::run(core.clone(), loss_rx, conn));
                abort.armed = false;
                Ok(Self {
                    _guard: Arc::new(ShutdownGuard { core: core.clone() }),
                    core,
                })
            }
            Err(e) => {
                // The abort guard cancels the runtime on this path too.
                Err(e)
            }
        }
    }

    /// Run `f` against a connected session, guaranteeing disconnect on every
    /// exit path.
    pub async fn run_scoped<T, F, Fut>(cfg: SessionConfig, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = T>,
    {
        let session = Self::connect(cfg).await?;
        let out = f(session.clone()).await;
        session.disconnect().await;
        Ok(out)
    }

    /// Stop the session: fail in-flight requests, end all streams, close the
    /// transport.  Idempotent and safe to call concurrently.
    pub async fn disconnect(&self) {
        teardown(&self.core);
    }

    /// Send one typed-opaque request and await its response payload.
    ///
    /// Fails with `NotReady`, `Timeout`, `Cancelled`, `TransportLost`,
    /// `Remote`, or `AuthFailed`.  `timeout` defaults to the configured
    /// request timeout.
    pub async fn send_request(
        &self,
        payload_type: u32,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes, SessionError> {
        let started = Instant::now();
        let reply = self.request(payload_type, payload, timeout).await?;
        let correlation_id = reply.correlation_id().to_owned();
        let outcome = reply.wait().await;
        self.core
            .hooks
            .post_response(payload_type, &correlation_id, &outcome)
            .await;
        if outcome.is_ok() {
            self.core.metrics.record_latency(started.elapsed());
        }
        outcome
    }

    /// The cancellable form of [`send_request`](Self::send_request): the
    /// returned [`PendingReply`] can be awaited or cancelled.
    pub async fn request(
        &self,
        payload_type: u32,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<PendingReply, SessionError> {
        self.core.auth.wait_ready().await?;
        let timeout = timeout.unwrap_or(self.core.cfg.request_timeout);
        let job_cancel = CancellationToken::new();
        let reply = self.core.correlator.register(timeout, job_cancel.clone());
        let correlation_id = reply.correlation_id().to_owned();
        self.core
            .hooks
            .pre_send_request(payload_type, &correlation_id)
            .await;
        let envelope = Envelope::with_correlation(payload_type, payload, &*correlation_id);
        let frame = envelope.encode()?;
        let job = SendJob {
            frame,
            cancel: job_cancel,
            correlation_id: Some(correlation_id.clone()),
        };
        if self.core.send_tx.send(job).await.is_err() {
            return Err(SessionError::Closed);
        }
        self.core.metrics.incr_requests_sent();
        self.core
            .hooks
            .post_send_request(payload_type, &correlation_id)
            .await;
        Ok(reply)
    }

    // -- typed subscriptions --

    /// Subscribe to spot ticks for one or more symbols on one subscription.
    ///
    /// With `coalesce_latest`, a burst on one symbol keeps only the newest
    /// pending tick per symbol.
    pub async fn subscribe_ticks(
        &self,
        symbol_ids: &[i64],
        coalesce_latest: bool,
    ) -> Result<TickStream, SessionError> {
        self.core.auth.wait_ready().await?;
        let topics = symbol_ids.iter().map(|id| format!("ticks:{id}")).collect();
        let body = encode_body(&SubscribeSpotsReq {
            symbol_ids: symbol_ids.to_vec(),
        })?;
        let policy = if coalesce_latest {
            QueuePolicy::CoalesceLatest
        } else {
            QueuePolicy::DropOldest
        };
        let subscription = self
            .open_and_arm(
                topics,
                self.core.cfg.tick_queue_size,
                policy,
                vec![RecipeStep {
                    payload_type: tags::SUBSCRIBE_SPOTS_REQ,
                    payload: body,
                }],
            )
            .await?;
        Ok(TickStream::new(subscription))
    }

    /// Subscribe to incremental depth for one symbol; yields a book snapshot
    /// per applied delta.
    pub async fn subscribe_depth(&self, symbol_id: i64) -> Result<DepthStream, SessionError> {
        self.core.auth.wait_ready().await?;
        let body = encode_body(&SubscribeDepthReq { symbol_id })?;
        let policy = if self.core.cfg.drop_inbound_when_full {
            QueuePolicy::DropOldest
        } else {
            QueuePolicy::Block
        };
        let subscription = self
            .open_and_arm(
                vec![format!("depth:{symbol_id}")],
                self.core.cfg.depth_queue_size,
                policy,
                vec![RecipeStep {
                    payload_type: tags::SUBSCRIBE_DEPTH_REQ,
                    payload: body,
                }],
            )
            .await?;
        Ok(DepthStream::new(
            subscription,
            symbol_id,
            self.core.epoch_tx.subscribe(),
            self.core.cfg.depth_max_levels,
        ))
    }

    /// Subscribe to live trendbars for one (symbol, period) pair.
    ///
    /// Live bars ride on spot events, so the recipe arms both the spot and
    /// the trendbar subscription.
    pub async fn subscribe_candles(
        &self,
        symbol_id: i64,
        period: TrendbarPeriod,
    ) -> Result<CandleStream, SessionError> {
        self.core.auth.wait_ready().await?;
        let spots = encode_body(&SubscribeSpotsReq {
            symbol_ids: vec![symbol_id],
        })?;
        let bars = encode_body(&SubscribeTrendbarReq { symbol_id, period })?;
        let subscription = self
            .open_and_arm(
                vec![format!("candles:{symbol_id}:{}", period.as_str())],
                self.core.cfg.candle_queue_size,
                QueuePolicy::DropOldest,
                vec![
                    RecipeStep {
                        payload_type: tags::SUBSCRIBE_SPOTS_REQ,
                        payload: spots,
                    },
                    RecipeStep {
                        payload_type: tags::SUBSCRIBE_TRENDBAR_REQ,
                        payload: bars,
                    },
                ],
            )
            .await?;
        Ok(CandleStream::new(subscription, symbol_id, period))
    }

    /// Subscribe to execution events.  No wire request is needed — the
    /// server pushes them to every authenticated session — so nothing is
    /// rearmed on reconnect either.
    pub async fn subscribe_execution(&self) -> Result<ExecutionStream, SessionError> {
        self.core.auth.wait_ready().await?;
        let subscription = self.core.registry.open(
            vec!["execution".to_owned()],
            self.core.cfg.execution_queue_size,
            QueuePolicy::Block,
            Vec::new(),
        );
        Ok(ExecutionStream::new(subscription))
    }

    /// Model events: the refresh snapshots (symbols catalog, account info,
    /// positions/orders reconcile) re-fetched by the supervisor after every
    /// reconnect.  Consumers see an unmarked refresh, exactly as the server
    /// state was re-read.
    pub async fn subscribe_model(&self) -> Result<EnvelopeStream, SessionError> {
        self.core.auth.wait_ready().await?;
        let policy = if self.core.cfg.drop_inbound_when_full {
            QueuePolicy::DropOldest
        } else {
            QueuePolicy::Block
        };
        let subscription = self.core.registry.open(
            vec![MODEL_TOPIC.to_owned()],
            self.core.cfg.inbound_queue_size,
            policy,
            Vec::new(),
        );
        Ok(EnvelopeStream::new(subscription))
    }

    /// The generic subscription surface: raw envelopes for caller-chosen
    /// topics, queue size, policy, and resubscribe recipe.
    pub async fn subscribe(
        &self,
        topics: Vec<String>,
        queue_size: usize,
        policy: QueuePolicy,
        recipe: Vec<RecipeStep>,
    ) -> Result<EnvelopeStream, SessionError> {
        self.core.auth.wait_ready().await?;
        let subscription = self.open_and_arm(topics, queue_size, policy, recipe).await?;
        Ok(EnvelopeStream::new(subscription))
    }

    /// Register the queue first so no event is missed, then emit the
    /// subscribe request(s).  A failed arm closes the subscription again.
    async fn open_and_arm(
        &self,
        topics: Vec<String>,
        queue_size: usize,
        policy: QueuePolicy,
        recipe: Vec<RecipeStep>,
    ) -> Result<Subscription, SessionError> {
        let subscription =
            self.core
                .registry
                .open(topics, queue_size, policy, recipe.clone());
        for step in recipe {
            if let Err(e) = internal_request(
                &self.core,
                step.payload_type,
                step.payload,
                self.core.cfg.request_timeout,
            )
            .await
            {
                subscription.close();
                return Err(e);
            }
        }
        Ok(subscription)
    }

    // -- introspection --

    pub fn state(&self) -> SessionState {
        self.core.auth.state()
    }

    /// Watch every session state transition.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.core.auth.watch()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.core.correlator.pending_count()
    }

    /// Subscriptions currently alive.
    pub fn live_subscriptions(&self) -> usize {
        self.core.registry.live_count()
    }

    /// Every inbound envelope, before any routing.  Diagnostics only;
    /// lagging receivers lose old envelopes.
    pub fn raw_tap(&self) -> broadcast::Receiver<Envelope> {
        self.core.dispatcher.tap()
    }

    /// Store a refreshed access token for the next account authentication
    /// (typically after the external HTTPS refresh flow).
    pub fn update_access_token(&self, token: impl Into<String>) {
        self.core.auth.update_access_token(token.into());
    }
}
