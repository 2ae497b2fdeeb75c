//! Execution stream: order/position lifecycle events.
//!
//! Execution events flow without an explicit subscription and are therefore
//! not rearmed on reconnect; position/order reconciliation after a gap is
//! the supervisor's refresh job.

use crate::registry::Subscription;
use tl_protocol::{ExecutionEvent, decode_body};
use tracing::trace;

pub struct ExecutionStream {
    subscription: Subscription,
}

impl ExecutionStream {
    pub(crate) fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    /// Next execution event; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            let envelope = self.subscription.next_envelope().await?;
            match decode_body::<ExecutionEvent>(&envelope.payload) {
                Ok(event) => return Some(event),
                Err(e) => {
                    trace!(error = %e, "skipping undecodable execution event");
                }
            }
        }
    }

    /// End the stream and deregister the subscription.
    pub fn close(&self) {
        self.subscription.close();
    }
}
