//! Typed consumers over dispatcher subscriptions.
//!
//! Every stream owns exactly one [`Subscription`] and yields items with
//! `recv()`; `None` means the stream ended (explicit close, fatal session,
//! or session drop).  A reconnect never ends a stream — the consumer just
//! sees a gap while the supervisor rearms the subscription.

mod candle;
mod depth;
mod execution;
mod tick;

pub use candle::CandleStream;
pub use depth::{DepthBook, DepthLevel, DepthSnapshot, DepthStream};
pub use execution::ExecutionStream;
pub use tick::{Tick, TickStream};

use crate::registry::Subscription;
use tl_protocol::Envelope;

/// The generic subscription surface: raw envelopes for a caller-chosen
/// topic set, queue size, and policy.
pub struct EnvelopeStream {
    subscription: Subscription,
}

impl EnvelopeStream {
    pub(crate) fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    /// Next raw envelope on any of the subscribed topics.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.subscription.next_envelope().await
    }

    /// End the stream and deregister the subscription.
    pub fn close(&self) {
        self.subscription.close();
    }
}
