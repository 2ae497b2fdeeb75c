//! Session configuration.
//!
//! Three sources, lowest to highest effort: `SessionConfig::default()` plus
//! struct updates, a TOML file (`from_toml_path`), or process environment
//! variables under the `TRADELINK_` prefix (`from_env`).
//!
//! # TOML layout
//!
//! ```toml
//! [server]
//! host = "demo.gateway.tradelink.io"
//! port = 5035
//! tls = true
//!
//! [auth]
//! client_id = "..."
//! client_secret = "..."
//! account_id = 1002034
//! access_token = "..."          # or: access_token_file = "/run/secrets/token"
//!
//! [limits]
//! rate_limit_per_second = 5
//! request_timeout_secs = 5
//! heartbeat_idle_secs = 20
//!
//! [reconnect]
//! enabled = true
//! backoff_base_ms = 500
//! backoff_cap_ms = 30000
//! ```
//!
//! # Token file format
//! Raw token string on a single line; trimmed on read.

use crate::error::SessionError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Demo-environment gateway host.
pub const DEMO_HOST: &str = "demo.gateway.tradelink.io";
/// Live-environment gateway host.
pub const LIVE_HOST: &str = "live.gateway.tradelink.io";
/// The gateway port shared by both environments.
pub const DEFAULT_PORT: u16 = 5035;

/// Environment variable prefix recognized by [`SessionConfig::from_env`].
pub const ENV_PREFIX: &str = "TRADELINK_";

// ---------------------------------------------------------------------------
// Config type
// ---------------------------------------------------------------------------

/// Everything the session runtime needs; every knob has a default.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Plain TCP when false; used by the test harness.
    pub tls: bool,

    pub client_id: String,
    pub client_secret: String,
    pub account_id: i64,
    pub access_token: String,

    pub max_frame_bytes: usize,
    pub rate_limit_per_second: u32,
    pub heartbeat_idle: Duration,
    pub request_timeout: Duration,

    pub inbound_queue_size: usize,
    pub tick_queue_size: usize,
    pub depth_queue_size: usize,
    pub candle_queue_size: usize,
    pub execution_queue_size: usize,
    /// When true, full stream queues evict their oldest entry; when false,
    /// delivery blocks the read loop until the consumer catches up.
    pub drop_inbound_when_full: bool,
    /// Book depth retained per side in depth snapshots.
    pub depth_max_levels: usize,

    pub reconnect_enabled: bool,
    pub reconnect_backoff_base: Duration,
    pub reconnect_backoff_cap: Duration,
    /// `None` = retry forever.
    pub reconnect_max_attempts: Option<u32>,

    /// Verbose connect/reconnect logging.
    pub diagnostics: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEMO_HOST.to_owned(),
            port: DEFAULT_PORT,
            tls: true,
            client_id: String::new(),
            client_secret: String::new(),
            account_id: 0,
            access_token: String::new(),
            max_frame_bytes: tl_protocol::DEFAULT_MAX_FRAME_BYTES,
            rate_limit_per_second: 5,
            heartbeat_idle: Duration::from_secs(20),
            request_timeout: Duration::from_secs(5),
            inbound_queue_size: 64,
            tick_queue_size: 256,
            depth_queue_size: 256,
            candle_queue_size: 64,
            execution_queue_size: 64,
            drop_inbound_when_full: true,
            depth_max_levels: 50,
            reconnect_enabled: true,
            reconnect_backoff_base: Duration::from_millis(500),
            reconnect_backoff_cap: Duration::from_secs(30),
            reconnect_max_attempts: None,
            diagnostics: false,
        }
    }
}

impl SessionConfig {
    /// Check invariants that would otherwise surface as confusing runtime
    /// behavior. Called by `Session::connect`.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.host.is_empty() {
            return Err(SessionError::Config("host must not be empty".to_owned()));
        }
        if self.port == 0 {
            return Err(SessionError::Config("port must not be 0".to_owned()));
        }
        if self.rate_limit_per_second == 0 {
            return Err(SessionError::Config(
                "rate_limit_per_second must be at least 1".to_owned(),
            ));
        }
        if self.max_frame_bytes < 1024 {
            return Err(SessionError::Config(
                "max_frame_bytes must be at least 1024".to_owned(),
            ));
        }
        for (name, size) in [
            ("inbound_queue_size", self.inbound_queue_size),
            ("tick_queue_size", self.tick_queue_size),
            ("depth_queue_size", self.depth_queue_size),
            ("candle_queue_size", self.candle_queue_size),
            ("execution_queue_size", self.execution_queue_size),
        ] {
            if size == 0 {
                return Err(SessionError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.reconnect_backoff_base > self.reconnect_backoff_cap {
            return Err(SessionError::Config(
                "reconnect_backoff_base must not exceed reconnect_backoff_cap".to_owned(),
            ));
        }
        Ok(())
    }

    /// Load from the process environment under [`ENV_PREFIX`].
    ///
    /// Unset variables keep their defaults; set-but-unparseable variables are
    /// a `Config` error rather than a silent fallback.
    pub fn from_env() -> Result<Self, SessionError> {
        let mut cfg = Self::default();
        if let Some(v) = env_var("HOST") {
            cfg.host = v;
        }
        if let Some(v) = env_var("PORT") {
            cfg.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = env_var("TLS") {
            cfg.tls = parse_env("TLS", &v)?;
        }
        if let Some(v) = env_var("CLIENT_ID") {
            cfg.client_id = v;
        }
        if let Some(v) = env_var("CLIENT_SECRET") {
            cfg.client_secret = v;
        }
        if let Some(v) = env_var("ACCOUNT_ID") {
            cfg.account_id = parse_env("ACCOUNT_ID", &v)?;
        }
        if let Some(v) = env_var("ACCESS_TOKEN") {
            cfg.access_token = v;
        }
        if let Some(v) = env_var("RATE_LIMIT_PER_SECOND") {
            cfg.rate_limit_per_second = parse_env("RATE_LIMIT_PER_SECOND", &v)?;
        }
        if let Some(v) = env_var("REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout = Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = env_var("HEARTBEAT_IDLE_SECS") {
            cfg.heartbeat_idle = Duration::from_secs(parse_env("HEARTBEAT_IDLE_SECS", &v)?);
        }
        if let Some(v) = env_var("RECONNECT_ENABLED") {
            cfg.reconnect_enabled = parse_env("RECONNECT_ENABLED", &v)?;
        }
        if let Some(v) = env_var("DIAGNOSTICS") {
            cfg.diagnostics = parse_env("DIAGNOSTICS", &v)?;
        }
        Ok(cfg)
    }

    /// Load from a TOML file.
    pub fn from_toml_path(path: &Path) -> Result<Self, SessionError> {
        let toml_str = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("reading config file '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&toml_str)
    }

    /// Load from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, SessionError> {
        let raw: RawConfig =
            toml::from_str(toml_str).map_err(|e| SessionError::Config(e.to_string()))?;
        let mut cfg = Self::default();

        if let Some(server) = raw.server {
            if let Some(host) = server.host {
                cfg.host = host;
            }
            if let Some(port) = server.port {
                cfg.port = port;
            }
            if let Some(tls) = server.tls {
                cfg.tls = tls;
            }
        }

        if let Some(auth) = raw.auth {
            if let Some(v) = auth.client_id {
                cfg.client_id = v;
            }
            if let Some(v) = auth.client_secret {
                cfg.client_secret = v;
            }
            if let Some(v) = auth.account_id {
                cfg.account_id = v;
            }
            match (auth.access_token, auth.access_token_file) {
                (Some(_), Some(_)) => {
                    return Err(SessionError::Config(
                        "auth.access_token and auth.access_token_file are mutually exclusive"
                            .to_owned(),
                    ));
                }
                (Some(token), None) => cfg.access_token = token,
                (None, Some(path)) => cfg.access_token = read_token_file(&path)?,
                (None, None) => {}
            }
        }

        if let Some(limits) = raw.limits {
            if let Some(v) = limits.max_frame_bytes {
                cfg.max_frame_bytes = v;
            }
            if let Some(v) = limits.rate_limit_per_second {
                cfg.rate_limit_per_second = v;
            }
            if let Some(v) = limits.request_timeout_secs {
                cfg.request_timeout = Duration::from_secs(v);
            }
            if let Some(v) = limits.heartbeat_idle_secs {
                cfg.heartbeat_idle = Duration::from_secs(v);
            }
        }

        if let Some(queues) = raw.queues {
            if let Some(v) = queues.inbound {
                cfg.inbound_queue_size = v;
            }
            if let Some(v) = queues.ticks {
                cfg.tick_queue_size = v;
            }
            if let Some(v) = queues.depth {
                cfg.depth_queue_size = v;
            }
            if let Some(v) = queues.candles {
                cfg.candle_queue_size = v;
            }
            if let Some(v) = queues.execution {
                cfg.execution_queue_size = v;
            }
            if let Some(v) = queues.drop_inbound_when_full {
                cfg.drop_inbound_when_full = v;
            }
            if let Some(v) = queues.depth_max_levels {
                cfg.depth_max_levels = v;
            }
        }

        if let Some(reconnect) = raw.reconnect {
            if let Some(v) = reconnect.enabled {
                cfg.reconnect_enabled = v;
            }
            if let Some(v) = reconnect.backoff_base_ms {
                cfg.reconnect_backoff_base = Duration::from_millis(v);
            }
            if let Some(v) = reconnect.backoff_cap_ms {
                cfg.reconnect_backoff_cap = Duration::from_millis(v);
            }
            if let Some(v) = reconnect.max_attempts {
                cfg.reconnect_max_attempts = Some(v);
            }
        }

        if let Some(v) = raw.diagnostics {
            cfg.diagnostics = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn parse_env<T: std::str::FromStr>(suffix: &str, value: &str) -> Result<T, SessionError> {
    value
        .parse()
        .map_err(|_| SessionError::Config(format!("cannot parse {ENV_PREFIX}{suffix}={value:?}")))
}

fn read_token_file(path: &str) -> Result<String, SessionError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SessionError::Config(format!("reading token file '{path}': {e}")))?;
    Ok(content.trim().to_owned())
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServer>,
    auth: Option<RawAuth>,
    limits: Option<RawLimits>,
    queues: Option<RawQueues>,
    reconnect: Option<RawReconnect>,
    diagnostics: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    host: Option<String>,
    port: Option<u16>,
    tls: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    client_id: Option<String>,
    client_secret: Option<String>,
    account_id: Option<i64>,
    access_token: Option<String>,
    access_token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    max_frame_bytes: Option<usize>,
    rate_limit_per_second: Option<u32>,
    request_timeout_secs: Option<u64>,
    heartbeat_idle_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawQueues {
    inbound: Option<usize>,
    ticks: Option<usize>,
    depth: Option<usize>,
    candles: Option<usize>,
    execution: Option<usize>,
    drop_inbound_when_full: Option<bool>,
    depth_max_levels: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawReconnect {
    enabled: Option<bool>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    max_attempts: Option<u32>,
}
