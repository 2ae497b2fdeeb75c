// mock_broker: A mock broker gateway for testing session clients.
//
// Accepts framed-envelope connections, answers the two-step auth handshake,
// acks subscribe/unsubscribe and refresh requests, and lets tests push
// server events, override responses per payload type, swallow requests, or
// drop every live connection to force a transport reset.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tl_protocol::{
    AccountAuthReq, AccountAuthRes, AppAuthRes, Envelope, ErrorRes, ReconcileRes, SymbolsListRes,
    TraderRes, decode_body, encode_body, tags,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// One inbound envelope with its arrival instant (for rate assertions).
#[derive(Debug, Clone)]
pub struct ReceivedEnvelope {
    pub envelope: Envelope,
    pub at: Instant,
}

type Responder = Box<dyn Fn(&Envelope) -> Option<Envelope> + Send + Sync>;

enum ConnCmd {
    Push(Envelope),
    Close,
}

struct ServerState {
    connections: Mutex<HashMap<u64, mpsc::UnboundedSender<ConnCmd>>>,
    accepted: AtomicU64,
    received: Mutex<Vec<ReceivedEnvelope>>,
    responders: Mutex<HashMap<u32, Responder>>,
    swallowed: Mutex<HashSet<u32>>,
    app_auth_rejection: Mutex<Option<ErrorRes>>,
}

/// A mock broker gateway for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound port.
///
/// # Protocol behavior
///
/// - `AppAuthReq` is answered with `AppAuthRes` (or the configured
///   rejection), `AccountAuthReq` with `AccountAuthRes`; both echo the
///   request's correlation id.
/// - Subscribe/unsubscribe requests are acked with their empty `…Res`
///   envelope; refresh requests get empty snapshot bodies.
/// - Keepalives and unknown payload types get no response.
pub struct MockBrokerServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    /// Handle to the background accept loop; dropped with the server.
    _task: tokio::task::JoinHandle<()>,
}

impl MockBrokerServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            connections: Mutex::new(HashMap::new()),
            accepted: AtomicU64::new(0),
            received: Mutex::new(Vec::new()),
            responders: Mutex::new(HashMap::new()),
            swallowed: Mutex::new(HashSet::new()),
            app_auth_rejection: Mutex::new(None),
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, accept_state).await;
        });

        Ok(Self {
            addr,
            state,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    // -- test controls --

    /// Override the response for one payload type.  Returning `None`
    /// swallows the request.
    pub fn respond_with(
        &self,
        payload_type: u32,
        f: impl Fn(&Envelope) -> Option<Envelope> + Send + Sync + 'static,
    ) {
        self.state
            .responders
            .lock()
            .unwrap()
            .insert(payload_type, Box::new(f));
    }

    /// Never respond to this payload type (timeout scenarios).
    pub fn swallow(&self, payload_type: u32) {
        self.state.swallowed.lock().unwrap().insert(payload_type);
    }

    /// Make app auth fail with the given remote error code.
    pub fn reject_app_auth(&self, error_code: &str, description: &str) {
        *self.state.app_auth_rejection.lock().unwrap() = Some(ErrorRes {
            error_code: error_code.to_owned(),
            description: description.to_owned(),
            maintenance_end_ms: None,
        });
    }

    /// Clear a previously configured app-auth rejection.
    pub fn accept_app_auth(&self) {
        *self.state.app_auth_rejection.lock().unwrap() = None;
    }

    /// Push a server event to every live connection.
    pub fn push(&self, envelope: Envelope) {
        let connections = self.state.connections.lock().unwrap();
        for tx in connections.values() {
            let _ = tx.send(ConnCmd::Push(envelope.clone()));
        }
    }

    /// Drop every live connection, forcing clients into reconnect.
    pub fn drop_connections(&self) {
        let mut connections = self.state.connections.lock().unwrap();
        for (_, tx) in connections.drain() {
            let _ = tx.send(ConnCmd::Close);
        }
    }

    /// Everything received so far, with arrival instants.
    pub fn received(&self) -> Vec<ReceivedEnvelope> {
        self.state.received.lock().unwrap().clone()
    }

    /// Count of received envelopes with the given payload type.
    pub fn received_count(&self, payload_type: u32) -> usize {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.envelope.payload_type == payload_type)
            .count()
    }

    /// Total connections accepted since start.
    pub fn accepted_connections(&self) -> u64 {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Connections currently live.
    pub fn live_connections(&self) -> usize {
        self.state.connections.lock().unwrap().len()
    }

    // -- internal --

    async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
        let mut next_id: u64 = 1;
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let conn_id = next_id;
                    next_id += 1;
                    state.accepted.fetch_add(1, Ordering::SeqCst);
                    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                    state
                        .connections
                        .lock()
                        .unwrap()
                        .insert(conn_id, cmd_tx);
                    let conn_state = state.clone();
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(conn_state.clone(), stream, cmd_rx).await;
                        conn_state.connections.lock().unwrap().remove(&conn_id);
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        state: Arc<ServerState>,
        stream: TcpStream,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnCmd>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(tl_protocol::LENGTH_PREFIX_BYTES)
            .max_frame_length(tl_protocol::DEFAULT_MAX_FRAME_BYTES)
            .new_codec();
        let mut framed = Framed::new(stream, codec);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Push(envelope)) => {
                        framed.send(envelope.encode()?).await?;
                    }
                    Some(ConnCmd::Close) | None => break,
                },
                frame = framed.next() => {
                    let Some(frame) = frame else { break };
                    let envelope = match Envelope::decode(frame?.freeze()) {
                        Ok(envelope) => envelope,
                        Err(_) => continue,
                    };
                    state.received.lock().unwrap().push(ReceivedEnvelope {
                        envelope: envelope.clone(),
                        at: Instant::now(),
                    });
                    if let Some(response) = Self::response_for(&state, &envelope) {
                        framed.send(response.encode()?).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn response_for(state: &ServerState, request: &Envelope) -> Option<Envelope> {
        if state
            .swallowed
            .lock()
            .unwrap()
            .contains(&request.payload_type)
        {
            return None;
        }
        if let Some(responder) = state.responders.lock().unwrap().get(&request.payload_type) {
            return responder(request);
        }
        let correlation = request.correlation_id.clone()?;

        let reply = |payload_type: u32, payload: Bytes| {
            Some(Envelope::with_correlation(
                payload_type,
                payload,
                correlation.clone(),
            ))
        };

        match request.payload_type {
            tags::APP_AUTH_REQ => {
                if let Some(rejection) = state.app_auth_rejection.lock().unwrap().as_ref() {
                    return reply(tags::ERROR_RES, encode_body(rejection).ok()?);
                }
                reply(tags::APP_AUTH_RES, encode_body(&AppAuthRes {}).ok()?)
            }
            tags::ACCOUNT_AUTH_REQ => {
                let account_id = decode_body::<AccountAuthReq>(&request.payload)
                    .map(|r| r.account_id)
                    .unwrap_or_default();
                reply(
                    tags::ACCOUNT_AUTH_RES,
                    encode_body(&AccountAuthRes { account_id }).ok()?,
                )
            }
            tags::SUBSCRIBE_SPOTS_REQ => reply(tags::SUBSCRIBE_SPOTS_RES, Bytes::new()),
            tags::UNSUBSCRIBE_SPOTS_REQ => reply(tags::UNSUBSCRIBE_SPOTS_RES, Bytes::new()),
            tags::SUBSCRIBE_DEPTH_REQ => reply(tags::SUBSCRIBE_DEPTH_RES, Bytes::new()),
            tags::UNSUBSCRIBE_DEPTH_REQ => reply(tags::UNSUBSCRIBE_DEPTH_RES, Bytes::new()),
            tags::SUBSCRIBE_TRENDBAR_REQ => reply(tags::SUBSCRIBE_TRENDBAR_RES, Bytes::new()),
            tags::UNSUBSCRIBE_TRENDBAR_REQ => reply(tags::UNSUBSCRIBE_TRENDBAR_RES, Bytes::new()),
            tags::SYMBOLS_LIST_REQ => reply(
                tags::SYMBOLS_LIST_RES,
                encode_body(&SymbolsListRes {
                    symbols: Vec::new(),
                })
                .ok()?,
            ),
            tags::TRADER_REQ => reply(
                tags::TRADER_RES,
                encode_body(&TraderRes {
                    account_id: 0,
                    balance: 0,
                    currency: "USD".to_owned(),
                })
                .ok()?,
            ),
            tags::RECONCILE_REQ => reply(
                tags::RECONCILE_RES,
                encode_body(&ReconcileRes {
                    positions: Vec::new(),
                    orders: Vec::new(),
                })
                .ok()?,
            ),
            // Keepalives and unknown types get no reply.
            _ => None,
        }
    }
}
