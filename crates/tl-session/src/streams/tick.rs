//! Tick streams: one or many symbols over a single subscription.

use crate::registry::Subscription;
use tl_protocol::{SpotEvent, decode_body};
use tracing::trace;

/// An immutable tick.  Prices are integer 1/100_000 units; either side can
/// be absent when only the other moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub symbol_id: i64,
    pub bid: Option<u64>,
    pub ask: Option<u64>,
}

/// Async iterator of ticks for the subscribed symbol set.
///
/// Queue policy is drop-oldest, or coalesce-latest-by-symbol when the
/// stream was opened with coalescing.
pub struct TickStream {
    subscription: Subscription,
}

impl TickStream {
    pub(crate) fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    /// Next tick; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Tick> {
        loop {
            let envelope = self.subscription.next_envelope().await?;
            match decode_body::<SpotEvent>(&envelope.payload) {
                Ok(event) => {
                    return Some(Tick {
                        symbol_id: event.symbol_id,
                        bid: event.bid,
                        ask: event.ask,
                    });
                }
                Err(e) => {
                    trace!(error = %e, "skipping undecodable spot event");
                }
            }
        }
    }

    /// End the stream and deregister the subscription.
    pub fn close(&self) {
        self.subscription.close();
    }
}
