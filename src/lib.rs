//! tradelink: Async client for a broker's length-prefixed binary RPC
//! service.
//!
//! The façade crate: re-exports the session runtime (`tl-session`) and the
//! wire protocol types (`tl-protocol`).
//!
//! ```no_run
//! use tradelink::{Session, SessionConfig};
//!
//! # async fn example() -> Result<(), tradelink::SessionError> {
//! let cfg = SessionConfig::from_env()?;
//! let session = Session::connect(cfg).await?;
//!
//! let mut ticks = session.subscribe_ticks(&[1, 2], false).await?;
//! while let Some(tick) = ticks.recv().await {
//!     println!("{tick:?}");
//! }
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub use tl_protocol as protocol;
pub use tl_protocol::{Envelope, WireError, tags};
pub use tl_session::{
    CandleStream, DepthBook, DepthLevel, DepthSnapshot, DepthStream, EnvelopeStream,
    ExecutionStream, MODEL_TOPIC, Metrics, MetricsSnapshot, ORPHAN_TOPIC, PendingReply,
    QueuePolicy, RecipeStep, Session, SessionConfig, SessionError, SessionHooks, SessionState,
    Tick, TickStream,
};
