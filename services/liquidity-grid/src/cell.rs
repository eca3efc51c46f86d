//! Grid cell values and the published snapshot type

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Which side of the book a cell aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

/// One materialized time range × price range × side liquidity value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellInstance {
    pub time_start_ms: i64,
    pub time_end_ms: i64,
    pub price_min: f64,
    pub price_max: f64,
    pub liquidity: f32,
    pub side: BookSide,
}

impl CellInstance {
    pub fn is_bid(&self) -> bool {
        self.side == BookSide::Bid
    }

    pub fn price_center(&self) -> f64 {
        (self.price_min + self.price_max) / 2.0
    }
}

/// Identity of an engine slice by its time range.
///
/// Engines refresh slice storage in place, so addresses say nothing about
/// whether a slice has been seen before; the `(start, end)` value does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SliceRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl SliceRange {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        Self { start_ms, end_ms }
    }
}

/// Immutable cell list shared between the producer and any readers.
pub type PublishedSnapshot = Arc<[CellInstance]>;
