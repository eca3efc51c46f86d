//! Market events consumed by the liquidity grid
//!
//! - `Trade`: a public print, immutable once received
//! - `OrderBookSnapshot`: sparse book (explicit non-zero levels)
//! - `BookDelta`: absolute level update used to maintain a dense book
//!
//! All timestamps are Unix milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::InstrumentId;
use crate::numeric::{Price, Quantity};

/// Aggressor side of a trade, or book side of a delta (Buy = bid).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// A public trade print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: InstrumentId,
    pub price: Price,
    pub size: Quantity,
    /// Aggressor side.
    pub side: Side,
    pub timestamp_ms: i64,
}

impl Trade {
    pub fn new(
        instrument: InstrumentId,
        price: Price,
        size: Quantity,
        side: Side,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            instrument,
            price,
            size,
            side,
            timestamp_ms,
        }
    }

    /// Trades with a zero size carry no information and are dropped.
    pub fn is_well_formed(&self) -> bool {
        self.size.is_positive()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}

/// A single (price, quantity) level of a sparse book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

impl BookLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity }
    }
}

/// Sparse order book snapshot.
///
/// Bids are ordered by price descending (best first), asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub instrument: InstrumentId,
    pub timestamp_ms: i64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    pub fn new(instrument: InstrumentId, timestamp_ms: i64) -> Self {
        Self {
            instrument,
            timestamp_ms,
            bids: Vec::new(),
            asks: Vec::new(),
        }
    }

    /// Build a snapshot from unsorted levels, sorting each side best-first.
    pub fn from_levels(
        instrument: InstrumentId,
        timestamp_ms: i64,
        mut bids: Vec<BookLevel>,
        mut asks: Vec<BookLevel>,
    ) -> Self {
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        Self {
            instrument,
            timestamp_ms,
            bids,
            asks,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    /// Average of best bid and best ask, or whichever side exists.
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        }
    }

    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Copy of this book re-stamped at `timestamp_ms` (carry-forward).
    pub fn restamped(&self, timestamp_ms: i64) -> Self {
        Self {
            timestamp_ms,
            ..self.clone()
        }
    }
}

/// Absolute update of one price level. A zero quantity removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDelta {
    /// Buy updates the bid side, Sell the ask side.
    pub side: Side,
    pub price: Price,
    pub quantity: Quantity,
}

impl BookDelta {
    pub fn new(side: Side, price: Price, quantity: Quantity) -> Self {
        Self {
            side,
            price,
            quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample_book() -> OrderBookSnapshot {
        OrderBookSnapshot::from_levels(
            InstrumentId::new("X"),
            1_700_000_000_000,
            vec![BookLevel::new(98.0, 2.0), BookLevel::new(99.0, 1.0)],
            vec![BookLevel::new(102.0, 3.0), BookLevel::new(101.0, 4.0)],
        )
    }

    #[test]
    fn test_from_levels_sorts_best_first() {
        let book = sample_book();
        assert_eq!(book.best_bid(), Some(99.0));
        assert_eq!(book.best_ask(), Some(101.0));
        assert_eq!(book.bids[1].price, 98.0);
        assert_eq!(book.asks[1].price, 102.0);
    }

    #[test]
    fn test_mid_price() {
        let book = sample_book();
        assert_eq!(book.mid_price(), Some(100.0));

        let mut one_sided = book.clone();
        one_sided.asks.clear();
        assert_eq!(one_sided.mid_price(), Some(99.0));
        assert!(!one_sided.is_two_sided());

        let empty = OrderBookSnapshot::new(InstrumentId::new("X"), 0);
        assert_eq!(empty.mid_price(), None);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_restamped_keeps_levels() {
        let book = sample_book();
        let later = book.restamped(1_700_000_000_100);
        assert_eq!(later.timestamp_ms, 1_700_000_000_100);
        assert_eq!(later.bids, book.bids);
        assert_eq!(later.asks, book.asks);
    }

    #[test]
    fn test_trade_well_formed() {
        let trade = Trade::new(
            InstrumentId::new("X"),
            Price::from_u64(100),
            Quantity::from_str("0.5").unwrap(),
            Side::Buy,
            1_700_000_000_000,
        );
        assert!(trade.is_well_formed());
        assert_eq!(trade.timestamp().unwrap().timestamp_millis(), 1_700_000_000_000);

        let zero = Trade {
            size: Quantity::ZERO,
            ..trade
        };
        assert!(!zero.is_well_formed());
    }

    #[test]
    fn test_side_serialization() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::from_str::<Side>("\"SELL\"").unwrap(), Side::Sell);
    }

    #[test]
    fn test_trade_serialization_roundtrip() {
        let trade = Trade::new(
            InstrumentId::new("X"),
            Price::from_str("100.5").unwrap(),
            Quantity::from_u64(2),
            Side::Sell,
            42,
        );
        let json = serde_json::to_string(&trade).unwrap();
        let back: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(trade, back);
    }
}
