// tl-protocol: Wire envelope and reserved message bodies for the broker RPC.
//
// Every frame on the wire is a 4-byte big-endian length followed by one
// encoded `Envelope`.  The envelope carries a numeric payload-type tag, an
// opaque payload, and an optional correlation id echoed by the server on the
// matching response.  The session treats payloads as opaque bytes except for
// the small reserved set defined in `messages` (auth, error, keepalive, and
// the stream events it must route by symbol).

mod envelope;
mod messages;
pub mod tags;

pub use envelope::{Envelope, MAX_CORRELATION_ID_LEN, WireError, decode_body, encode_body};
pub use messages::{
    AccountAuthReq, AccountAuthRes, AppAuthReq, AppAuthRes, Candle, DepthEvent, DepthQuote,
    ErrorRes, ExecutionEvent, ExecutionType, OrderSnapshot, PositionSnapshot, ReconcileReq,
    ReconcileRes, SpotEvent, SubscribeDepthReq, SubscribeSpotsReq, SubscribeTrendbarReq,
    SymbolInfo, SymbolsListReq, SymbolsListRes, TraderReq, TraderRes, Trendbar, TrendbarPeriod,
    UnsubscribeDepthReq, UnsubscribeSpotsReq, UnsubscribeTrendbarReq, price_to_f64,
};

/// Hard ceiling on one frame's encoded envelope, matching the server contract.
/// Connections that produce a larger frame are torn down as protocol errors.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 15 * 1024 * 1024;

/// Number of bytes in the length prefix preceding every envelope.
pub const LENGTH_PREFIX_BYTES: usize = 4;
