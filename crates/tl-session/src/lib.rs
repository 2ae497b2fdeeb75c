// tl-session: The session runtime for the broker's binary RPC service.
//
// One persistent TLS connection carries typed request/response traffic and
// the push streams (ticks, depth, candles, executions).  This crate owns
// the hard part: framing, the auth state machine, the request-response
// correlator with timeouts and cancellation, the rate-limited send
// scheduler, topic dispatch with backpressure, and the reconnect +
// stream-recovery supervisor.
//
// The payload bodies themselves are opaque here except for the reserved set
// defined in `tl-protocol`.

pub mod auth;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod hooks;
pub mod limiter;
pub mod registry;
mod session;
pub mod streams;
mod supervisor;
pub mod transport;

pub use auth::SessionState;
pub use config::{DEFAULT_PORT, DEMO_HOST, ENV_PREFIX, LIVE_HOST, SessionConfig};
pub use correlator::PendingReply;
pub use dispatcher::{MODEL_TOPIC, ORPHAN_TOPIC, QueuePolicy};
pub use error::SessionError;
pub use hooks::{Metrics, MetricsSnapshot, SessionHooks};
pub use registry::RecipeStep;
pub use session::Session;
pub use streams::{
    CandleStream, DepthBook, DepthLevel, DepthSnapshot, DepthStream, EnvelopeStream,
    ExecutionStream, Tick, TickStream,
};
