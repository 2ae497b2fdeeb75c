//! Reserved message bodies.
//!
//! These are the only payloads the session decodes itself: the auth
//! handshake, the generic error, the stream events it must route by symbol,
//! and the refresh snapshots re-fetched after a reconnect.  Bodies are
//! serialized with bincode; everything not listed here crosses the session
//! as opaque bytes.
//!
//! Prices are integers in 1/100_000 price units throughout, as the server
//! encodes them.  [`price_to_f64`] converts for display.

use serde::{Deserialize, Serialize};

/// Fixed-point denominator for all price fields.
pub const PRICE_SCALE: u64 = 100_000;

/// Convert a fixed-point price into a display value.
pub fn price_to_f64(units: u64) -> f64 {
    units as f64 / PRICE_SCALE as f64
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// First handshake step: application credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAuthReq {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAuthRes {}

/// Second handshake step: account access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAuthReq {
    pub account_id: i64,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAuthRes {
    pub account_id: i64,
}

// ---------------------------------------------------------------------------
// Generic error
// ---------------------------------------------------------------------------

/// The server's generic error response.
///
/// `error_code` is a stable machine-readable string (e.g.
/// `CH_ACCESS_TOKEN_INVALID`); `maintenance_end_ms` is set when the request
/// was rejected because of a maintenance window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRes {
    pub error_code: String,
    pub description: String,
    pub maintenance_end_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeSpotsReq {
    pub symbol_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeSpotsReq {
    pub symbol_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeDepthReq {
    pub symbol_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeDepthReq {
    pub symbol_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeTrendbarReq {
    pub symbol_id: i64,
    pub period: TrendbarPeriod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeTrendbarReq {
    pub symbol_id: i64,
    pub period: TrendbarPeriod,
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// A spot tick.  Either side may be absent when only one side moved.
/// Carries current-bar trendbars for every live-trendbar subscription on the
/// symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotEvent {
    pub symbol_id: i64,
    pub bid: Option<u64>,
    pub ask: Option<u64>,
    pub trendbars: Vec<Trendbar>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendbarPeriod {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
}

impl TrendbarPeriod {
    /// Stable label used in topic keys.
    pub fn as_str(self) -> &'static str {
        match self {
            TrendbarPeriod::M1 => "M1",
            TrendbarPeriod::M5 => "M5",
            TrendbarPeriod::M15 => "M15",
            TrendbarPeriod::M30 => "M30",
            TrendbarPeriod::H1 => "H1",
            TrendbarPeriod::H4 => "H4",
            TrendbarPeriod::D1 => "D1",
            TrendbarPeriod::W1 => "W1",
        }
    }
}

/// Current state of one bar, re-sent on every contributing tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trendbar {
    pub period: TrendbarPeriod,
    pub timestamp_minutes: u64,
    pub open: u64,
    pub high: u64,
    pub low: u64,
    pub close: u64,
    pub volume: u64,
}

/// A candle as yielded to stream consumers: a trendbar pinned to its symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol_id: i64,
    pub period: TrendbarPeriod,
    pub timestamp_minutes: u64,
    pub open: u64,
    pub high: u64,
    pub low: u64,
    pub close: u64,
    pub volume: u64,
}

impl Candle {
    pub fn from_trendbar(symbol_id: i64, bar: &Trendbar) -> Self {
        Self {
            symbol_id,
            period: bar.period,
            timestamp_minutes: bar.timestamp_minutes,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        }
    }
}

/// One incremental depth update: quotes added or changed, plus ids removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthEvent {
    pub symbol_id: i64,
    pub new_quotes: Vec<DepthQuote>,
    pub deleted_quote_ids: Vec<u64>,
}

/// A single depth quote.  Exactly one of `bid`/`ask` is set on a well-formed
/// quote; malformed quotes are skipped by the book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthQuote {
    pub id: u64,
    pub size: u64,
    pub bid: Option<u64>,
    pub ask: Option<u64>,
}

// ---------------------------------------------------------------------------
// Execution events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionType {
    OrderAccepted,
    OrderFilled,
    OrderReplaced,
    OrderCancelled,
    OrderRejected,
    OrderExpired,
    OrderPartialFill,
    Swap,
    DepositWithdraw,
    BonusDepositWithdraw,
}

/// Order/position lifecycle push.  Fields beyond the type are optional
/// because not every event kind carries them (a swap has no order id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_type: ExecutionType,
    pub order_id: Option<i64>,
    pub position_id: Option<i64>,
    pub symbol_id: Option<i64>,
    pub volume: Option<i64>,
    pub price: Option<u64>,
}

// ---------------------------------------------------------------------------
// Refresh snapshots (re-fetched by the reconnect supervisor)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolsListReq {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolsListRes {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol_id: i64,
    pub name: String,
    pub digits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraderReq {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraderRes {
    pub account_id: i64,
    /// Balance in cents of the deposit currency.
    pub balance: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReq {}

/// Open positions and working orders, as one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileRes {
    pub positions: Vec<PositionSnapshot>,
    pub orders: Vec<OrderSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub position_id: i64,
    pub symbol_id: i64,
    pub volume: i64,
    pub entry_price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order_id: i64,
    pub symbol_id: i64,
    pub volume: i64,
    pub limit_price: Option<u64>,
}
