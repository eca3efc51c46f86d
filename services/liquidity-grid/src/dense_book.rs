//! Dense, tick-indexed order book
//!
//! One quantity slot per tick over `[min_price, min_price + len × tick)`,
//! separately for bids and asks. This is the live-feed source of truth;
//! the Band Selector and the dense ingestion path both read from it.
//!
//! Deltas carry absolute quantities. Their prices are mapped to tick
//! indices with exact decimal arithmetic; a price outside the covered
//! range is dropped rather than resizing the book.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use types::errors::TypeError;
use types::ids::InstrumentId;
use types::market::{BookDelta, Side};
use types::numeric::Price;

/// A non-zero level of a dense book, addressed by tick index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DenseLevel {
    pub tick_index: u32,
    pub quantity: f64,
}

/// Bounded capture of a dense book's non-zero levels, best-first per side.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DenseBookView {
    pub min_price: f64,
    pub tick_size: f64,
    pub timestamp_ms: i64,
    pub bid_levels: Vec<DenseLevel>,
    pub ask_levels: Vec<DenseLevel>,
}

impl DenseBookView {
    pub fn is_empty(&self) -> bool {
        self.bid_levels.is_empty() && self.ask_levels.is_empty()
    }

    pub fn price_at(&self, tick_index: u32) -> f64 {
        self.min_price + tick_index as f64 * self.tick_size
    }
}

#[derive(Debug, Clone)]
pub struct DenseOrderBook {
    instrument: InstrumentId,
    min_price: Decimal,
    tick_size: Decimal,
    bids: Vec<f64>,
    asks: Vec<f64>,
    timestamp_ms: i64,
}

impl DenseOrderBook {
    /// Book covering `levels` ticks starting at `min_price`.
    pub fn new(
        instrument: InstrumentId,
        min_price: Price,
        tick_size: Price,
        levels: usize,
    ) -> Result<Self, TypeError> {
        if tick_size.is_zero() {
            return Err(TypeError::InvalidPrice("tick size must be positive".to_string()));
        }
        if levels == 0 || levels > u32::MAX as usize {
            return Err(TypeError::InvalidQuantity(format!("level count {}", levels)));
        }
        Ok(Self {
            instrument,
            min_price: min_price.as_decimal(),
            tick_size: tick_size.as_decimal(),
            bids: vec![0.0; levels],
            asks: vec![0.0; levels],
            timestamp_ms: 0,
        })
    }

    /// Book of `levels` ticks centered on `center`, floored at zero.
    pub fn centered(
        instrument: InstrumentId,
        center: Price,
        tick_size: Price,
        levels: usize,
    ) -> Result<Self, TypeError> {
        let half = tick_size.as_decimal() * Decimal::from(levels / 2);
        let min = (center.as_decimal() - half).max(Decimal::ZERO);
        Self::new(instrument, Price::try_new(min)?, tick_size, levels)
    }

    pub fn instrument(&self) -> &InstrumentId {
        &self.instrument
    }

    pub fn len(&self) -> usize {
        self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.best_bid_index().is_none() && self.best_ask_index().is_none()
    }

    pub fn min_price(&self) -> f64 {
        self.min_price.to_f64().unwrap_or(0.0)
    }

    pub fn tick_size(&self) -> f64 {
        self.tick_size.to_f64().unwrap_or(0.0)
    }

    pub fn bids(&self) -> &[f64] {
        &self.bids
    }

    pub fn asks(&self) -> &[f64] {
        &self.asks
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn set_timestamp(&mut self, timestamp_ms: i64) {
        self.timestamp_ms = timestamp_ms;
    }

    pub fn price_at(&self, index: usize) -> f64 {
        self.min_price() + index as f64 * self.tick_size()
    }

    /// Nearest tick index for `price`, if it falls inside the book.
    pub fn tick_index(&self, price: Price) -> Option<usize> {
        let offset = (price.as_decimal() - self.min_price) / self.tick_size;
        let idx = offset.round();
        if idx.is_sign_negative() && !idx.is_zero() {
            return None;
        }
        let idx = idx.to_usize()?;
        (idx < self.len()).then_some(idx)
    }

    /// Apply one absolute level update. Returns false if it was out of range.
    pub fn apply_delta(&mut self, delta: &BookDelta) -> bool {
        let Some(idx) = self.tick_index(delta.price) else {
            debug!(
                instrument = %self.instrument,
                price = %delta.price,
                "Dropping delta outside dense range"
            );
            return false;
        };
        let qty = delta.quantity.to_f64();
        match delta.side {
            Side::Buy => self.bids[idx] = qty,
            Side::Sell => self.asks[idx] = qty,
        }
        true
    }

    /// Apply a batch stamped at `timestamp_ms`. Returns the applied count.
    pub fn apply_deltas(&mut self, deltas: &[BookDelta], timestamp_ms: i64) -> usize {
        let applied = deltas.iter().filter(|d| self.apply_delta(d)).count();
        self.timestamp_ms = timestamp_ms;
        applied
    }

    pub fn clear(&mut self) {
        self.bids.iter_mut().for_each(|q| *q = 0.0);
        self.asks.iter_mut().for_each(|q| *q = 0.0);
    }

    /// Highest index with a positive bid quantity.
    pub fn best_bid_index(&self) -> Option<usize> {
        self.bids.iter().rposition(|&q| q > 0.0)
    }

    /// Lowest index with a positive ask quantity.
    pub fn best_ask_index(&self) -> Option<usize> {
        self.asks.iter().position(|&q| q > 0.0)
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.best_bid_index().map(|i| self.price_at(i))
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.best_ask_index().map(|i| self.price_at(i))
    }

    /// Mean of best bid and ask, or whichever side exists.
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    /// Mid price, or the middle of the covered range for an empty book.
    pub fn center_price(&self) -> f64 {
        self.mid_price()
            .unwrap_or_else(|| self.price_at(self.len() / 2))
    }

    /// Up to `max_per_side` non-zero levels per side, scanned outward from
    /// the best price.
    pub fn capture_dense_non_zero(&self, max_per_side: usize) -> DenseBookView {
        let mut view = DenseBookView {
            min_price: self.min_price(),
            tick_size: self.tick_size(),
            timestamp_ms: self.timestamp_ms,
            bid_levels: Vec::new(),
            ask_levels: Vec::new(),
        };
        if let Some(best) = self.best_bid_index() {
            view.bid_levels = self.bids[..=best]
                .iter()
                .enumerate()
                .rev()
                .filter(|&(_, &q)| q > 0.0)
                .take(max_per_side)
                .map(|(i, &q)| DenseLevel {
                    tick_index: i as u32,
                    quantity: q,
                })
                .collect();
        }
        if let Some(best) = self.best_ask_index() {
            view.ask_levels = self.asks[best..]
                .iter()
                .enumerate()
                .filter(|&(_, &q)| q > 0.0)
                .take(max_per_side)
                .map(|(i, &q)| DenseLevel {
                    tick_index: (best + i) as u32,
                    quantity: q,
                })
                .collect();
        }
        view
    }
}
