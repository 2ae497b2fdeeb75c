//! Depth stream: a per-symbol order book rebuilt from incremental updates.
//!
//! Each `DepthEvent` adds quotes and removes quote ids; the stream yields a
//! full snapshot after every applied delta.  The book rebuilds from scratch
//! after a reconnect — deltas never cross a session boundary, so the stream
//! clears its state whenever the session epoch advances.

use crate::registry::Subscription;
use std::collections::{BTreeMap, HashMap};
use tl_protocol::{DepthEvent, decode_body};
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy)]
struct BookQuote {
    side: Side,
    price: u64,
    size: u64,
}

/// One aggregated price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthLevel {
    /// Price in 1/100_000 units.
    pub price: u64,
    pub volume: u64,
}

/// The book after one applied delta: bids descending, asks ascending, both
/// truncated to the configured level cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthSnapshot {
    pub symbol_id: i64,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<u64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<u64> {
        self.asks.first().map(|l| l.price)
    }

    /// Best-ask minus best-bid, in price units; `None` with an empty side.
    pub fn spread(&self) -> Option<u64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.saturating_sub(bid)),
            _ => None,
        }
    }

    pub fn bid_volume(&self) -> u64 {
        self.bids.iter().map(|l| l.volume).sum()
    }

    pub fn ask_volume(&self) -> u64 {
        self.asks.iter().map(|l| l.volume).sum()
    }
}

// ---------------------------------------------------------------------------
// DepthBook
// ---------------------------------------------------------------------------

/// Quote-id keyed book state for one symbol.
pub struct DepthBook {
    symbol_id: i64,
    quotes: HashMap<u64, BookQuote>,
}

impl DepthBook {
    pub fn new(symbol_id: i64) -> Self {
        Self {
            symbol_id,
            quotes: HashMap::new(),
        }
    }

    /// Apply one delta: removals first, then adds/changes.  Quotes with
    /// neither or both sides set are skipped.
    pub fn apply(&mut self, event: &DepthEvent) {
        for id in &event.deleted_quote_ids {
            self.quotes.remove(id);
        }
        for quote in &event.new_quotes {
            let entry = match (quote.bid, quote.ask) {
                (Some(price), None) => BookQuote {
                    side: Side::Bid,
                    price,
                    size: quote.size,
                },
                (None, Some(price)) => BookQuote {
                    side: Side::Ask,
                    price,
                    size: quote.size,
                },
                _ => {
                    trace!(quote_id = quote.id, "skipping malformed depth quote");
                    continue;
                }
            };
            self.quotes.insert(quote.id, entry);
        }
    }

    pub fn clear(&mut self) {
        self.quotes.clear();
    }

    /// Aggregate quotes into price levels, sorted and truncated per side.
    pub fn snapshot(&self, max_levels: usize) -> DepthSnapshot {
        let mut bids: BTreeMap<u64, u64> = BTreeMap::new();
        let mut asks: BTreeMap<u64, u64> = BTreeMap::new();
        for quote in self.quotes.values() {
            let side = match quote.side {
                Side::Bid => &mut bids,
                Side::Ask => &mut asks,
            };
            *side.entry(quote.price).or_insert(0) += quote.size;
        }
        DepthSnapshot {
            symbol_id: self.symbol_id,
            bids: bids
                .into_iter()
                .rev()
                .take(max_levels)
                .map(|(price, volume)| DepthLevel { price, volume })
                .collect(),
            asks: asks
                .into_iter()
                .take(max_levels)
                .map(|(price, volume)| DepthLevel { price, volume })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// DepthStream
// ---------------------------------------------------------------------------

/// Async iterator of depth snapshots for one symbol.
pub struct DepthStream {
    subscription: Subscription,
    book: DepthBook,
    epoch: watch::Receiver<u64>,
    seen_epoch: u64,
    max_levels: usize,
}

impl DepthStream {
    pub(crate) fn new(
        subscription: Subscription,
        symbol_id: i64,
        epoch: watch::Receiver<u64>,
        max_levels: usize,
    ) -> Self {
        let seen_epoch = *epoch.borrow();
        Self {
            subscription,
            book: DepthBook::new(symbol_id),
            epoch,
            seen_epoch,
            max_levels,
        }
    }

    /// Next snapshot, produced after the next applied delta.
    pub async fn recv(&mut self) -> Option<DepthSnapshot> {
        loop {
            let envelope = self.subscription.next_envelope().await?;
            let current_epoch = *self.epoch.borrow();
            if current_epoch != self.seen_epoch {
                // New connection: the server restreams the full book.
                self.book.clear();
                self.seen_epoch = current_epoch;
            }
            match decode_body::<DepthEvent>(&envelope.payload) {
                Ok(event) => {
                    self.book.apply(&event);
                    return Some(self.book.snapshot(self.max_levels));
                }
                Err(e) => {
                    trace!(error = %e, "skipping undecodable depth event");
                }
            }
        }
    }

    /// End the stream and deregister the subscription.
    pub fn close(&self) {
        self.subscription.close();
    }
}
