//! Candle stream: current-bar trendbars for one (symbol, period) pair.

use crate::registry::Subscription;
use tl_protocol::{Candle, SpotEvent, TrendbarPeriod, decode_body};
use tracing::trace;

/// Yields the current bar each time a spot tick carries trendbar data for
/// the subscribed timeframe.
pub struct CandleStream {
    subscription: Subscription,
    symbol_id: i64,
    period: TrendbarPeriod,
}

impl CandleStream {
    pub(crate) fn new(subscription: Subscription, symbol_id: i64, period: TrendbarPeriod) -> Self {
        Self {
            subscription,
            symbol_id,
            period,
        }
    }

    /// Next candle; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Candle> {
        loop {
            let envelope = self.subscription.next_envelope().await?;
            match decode_body::<SpotEvent>(&envelope.payload) {
                Ok(event) if event.symbol_id == self.symbol_id => {
                    if let Some(bar) = event.trendbars.iter().find(|b| b.period == self.period) {
                        return Some(Candle::from_trendbar(event.symbol_id, bar));
                    }
                }
                Ok(_) => {}
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
