//! Authentication state machine.
//!
//! `Disconnected → Connecting → AppAuthenticating → AccountAuthenticating →
//! Ready`, with `Ready → Reconnecting → AppAuthenticating → …` after a
//! transport loss and any state `→ Fatal` on a non-retriable credential
//! failure.  User requests are gated on `Ready` by [`AuthFsm::wait_ready`].

use crate::config::SessionConfig;
use crate::error::SessionError;
use std::sync::Mutex;
use tl_protocol::{AccountAuthReq, AppAuthReq, encode_body, tags};
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AppAuthenticating,
    AccountAuthenticating,
    Ready,
    Reconnecting,
    Fatal,
}

impl SessionState {
    /// A state that will progress to `Ready` on its own; callers wait
    /// through these instead of failing fast.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::AppAuthenticating
                | SessionState::AccountAuthenticating
                | SessionState::Reconnecting
        )
    }
}

/// Remote error codes that permanently end the session.
const FATAL_AUTH_CODES: &[&str] = &[
    "CH_CLIENT_AUTH_FAILURE",
    "CH_ACCESS_TOKEN_INVALID",
    "CH_ACCOUNT_DISABLED",
];

/// Whether a remote auth error code is beyond retry.
pub fn is_fatal_auth_code(code: &str) -> bool {
    FATAL_AUTH_CODES.contains(&code)
}

pub struct AuthFsm {
    state_tx: watch::Sender<SessionState>,
    client_id: String,
    client_secret: String,
    account_id: i64,
    /// Refreshed out-of-band; the next account auth uses the latest value.
    access_token: Mutex<String>,
}

impl AuthFsm {
    pub fn new(cfg: &SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            state_tx,
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            account_id: cfg.account_id,
            access_token: Mutex::new(cfg.access_token.clone()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn set_state(&self, state: SessionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(?state, "session state");
        }
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Store a freshly acquired access token for the next account auth.
    pub fn update_access_token(&self, token: String) {
        *self.access_token.lock().expect("token lock") = token;
    }

    /// Drive the two-step handshake over an already-open transport.
    ///
    /// `send` issues one correlated request and returns the response
    /// payload.  Remote errors with a fatal code map to `AuthFailed`;
    /// everything else is handed back for the supervisor's retry logic.
    pub async fn run_handshake<F, Fut>(&self, send: F) -> Result<(), SessionError>
    where
        F: Fn(u32, bytes::Bytes) -> Fut,
        Fut: Future<Output = Result<bytes::Bytes, SessionError>>,
    {
        self.set_state(SessionState::AppAuthenticating);
        let app_req = encode_body(&AppAuthReq {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        })?;
        Self::check_auth_step(send(tags::APP_AUTH_REQ, app_req).await)?;

        self.set_state(SessionState::AccountAuthenticating);
        let account_req = encode_body(&AccountAuthReq {
            account_id: self.account_id,
            access_token: self.access_token.lock().expect("token lock").clone(),
        })?;
        Self::check_auth_step(send(tags::ACCOUNT_AUTH_REQ, account_req).await)?;

        self.set_state(SessionState::Ready);
        info!(account_id = self.account_id, "session authenticated");
        Ok(())
    }

    fn check_auth_step(outcome: Result<bytes::Bytes, SessionError>) -> Result<(), SessionError> {
        match outcome {
            Ok(_) => Ok(()),
            Err(e) => match e.remote_code() {
                Some(code) if is_fatal_auth_code(code) => {
                    Err(SessionError::AuthFailed(code.to_owned()))
                }
                _ => Err(e),
            },
        }
    }

    /// Gate for user requests: pass in `Ready`, wait through transient
    /// states, fail fast otherwise.
    pub async fn wait_ready(&self) -> Result<(), SessionError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                SessionState::Ready => return Ok(()),
                SessionState::Fatal => {
                    return Err(SessionError::AuthFailed("session is fatal".to_owned()));
                }
                SessionState::Disconnected => return Err(SessionError::NotReady),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(SessionError::NotReady);
            }
        }
    }
}
