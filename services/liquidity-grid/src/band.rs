//! Band Selector
//!
//! Reduces a dense book to a sparse snapshot bounded to a price window
//! around mid, so that repeated aggregation stays cheap:
//!
//! - half-band from the configured mode, floored to a small positive value,
//!   or the fixed-dollar default when the mode yields nothing
//! - band clamped to the book's tick range
//! - bids scanned downward and asks upward from the band edges nearest mid,
//!   positive quantities only, capped per side
//! - top-of-book fallback for any side that has a best price but produced
//!   no level, so the engine's clock always advances
//!
//! Sparse books from a full-depth feed go through the same window in
//! [`select_sparse_band`], with the engine's price resolution as the tick.

use tracing::trace;
use types::market::{BookLevel, OrderBookSnapshot};

use crate::config::{BandConfig, BandMode};
use crate::dense_book::DenseOrderBook;

const MIN_HALF_BAND: f64 = 1e-6;
const INDEX_EPSILON: f64 = 1e-9;

/// Result of banding a dense book.
#[derive(Debug, Clone, PartialEq)]
pub struct BandSelection {
    pub snapshot: OrderBookSnapshot,
    pub mid_price: f64,
    pub half_band: f64,
}

/// Half-width of the band for `mid` under `config`.
pub fn half_band(config: &BandConfig, mid: f64, tick_size: f64) -> f64 {
    let raw = match config.mode {
        BandMode::FixedDollar => config.value,
        BandMode::PercentMid => mid.abs() * config.value,
        BandMode::Ticks => config.value * tick_size,
    };
    if !(raw > 0.0) || !raw.is_finite() {
        return config.default_half_band;
    }
    match config.mode {
        BandMode::Ticks => raw.max(tick_size),
        _ => raw.max(MIN_HALF_BAND),
    }
}

/// Build a banded sparse snapshot of `book`.
///
/// `default_mid` is used only when the book has neither a bid nor an ask.
pub fn select_band(book: &DenseOrderBook, config: &BandConfig, default_mid: f64) -> BandSelection {
    let tick = book.tick_size();
    let min_price = book.min_price();
    let best_bid_idx = book.best_bid_index();
    let best_ask_idx = book.best_ask_index();
    let mid = book.mid_price().unwrap_or(default_mid);

    let max_half = book.len() as f64 * tick * 0.5;
    let half = half_band(config, mid, tick).min(max_half);
    let band_min = mid - half;
    let band_max = mid + half;

    let mut snapshot = OrderBookSnapshot::new(book.instrument().clone(), book.timestamp_ms());

    if tick > 0.0 && book.len() > 0 {
        let last = (book.len() - 1) as f64;
        let lo = ((band_min - min_price) / tick - INDEX_EPSILON).ceil().max(0.0);
        let hi = ((band_max - min_price) / tick + INDEX_EPSILON).floor().min(last);

        if lo <= hi {
            let (lo, hi) = (lo as usize, hi as usize);
            let cap = config.max_levels_per_side;

            snapshot.bids = (lo..=hi)
                .rev()
                .filter(|&i| book.bids()[i] > 0.0)
                .take(cap)
                .map(|i| BookLevel::new(book.price_at(i), book.bids()[i]))
                .collect();

            snapshot.asks = (lo..=hi)
                .filter(|&i| book.asks()[i] > 0.0)
                .take(cap)
                .map(|i| BookLevel::new(book.price_at(i), book.asks()[i]))
                .collect();
        }
    }

    if snapshot.bids.is_empty() {
        if let Some(i) = best_bid_idx {
            snapshot.bids.push(BookLevel::new(book.price_at(i), book.bids()[i]));
        }
    }
    if snapshot.asks.is_empty() {
        if let Some(i) = best_ask_idx {
            snapshot.asks.push(BookLevel::new(book.price_at(i), book.asks()[i]));
        }
    }

    trace!(
        mid,
        half,
        bids = snapshot.bids.len(),
        asks = snapshot.asks.len(),
        "Banded dense book"
    );

    BandSelection {
        snapshot,
        mid_price: mid,
        half_band: half,
    }
}

/// Bound a sparse book to the band around its own mid.
///
/// Levels keep the side ordering of [`OrderBookSnapshot`]. A side whose
/// levels all fall outside the band keeps its best level.
pub fn select_sparse_band(book: &OrderBookSnapshot, config: &BandConfig, tick_size: f64) -> BandSelection {
    let mid = book.mid_price().unwrap_or(0.0);
    let half = half_band(config, mid, tick_size);
    let band_min = mid - half - INDEX_EPSILON;
    let band_max = mid + half + INDEX_EPSILON;
    let cap = config.max_levels_per_side;

    let in_band = |l: &&BookLevel| l.quantity > 0.0 && l.price >= band_min && l.price <= band_max;
    let mut bids: Vec<BookLevel> = book.bids.iter().filter(in_band).copied().collect();
    let mut asks: Vec<BookLevel> = book.asks.iter().filter(in_band).copied().collect();
    bids.sort_by(|a, b| b.price.total_cmp(&a.price));
    asks.sort_by(|a, b| a.price.total_cmp(&b.price));
    bids.truncate(cap);
    asks.truncate(cap);

    if bids.is_empty() {
        let best = book
            .bids
            .iter()
            .filter(|l| l.quantity > 0.0)
            .max_by(|a, b| a.price.total_cmp(&b.price));
        bids.extend(best.copied());
    }
    if asks.is_empty() {
        let best = book
            .asks
            .iter()
            .filter(|l| l.quantity > 0.0)
            .min_by(|a, b| a.price.total_cmp(&b.price));
        asks.extend(best.copied());
    }

    trace!(
        mid,
        half,
        bids_in = book.bids.len(),
        asks_in = book.asks.len(),
        bids = bids.len(),
        asks = asks.len(),
        "Banded sparse book"
    );

    BandSelection {
        snapshot: OrderBookSnapshot {
            instrument: book.instrument.clone(),
            timestamp_ms: book.timestamp_ms,
            bids,
            asks,
        },
        mid_price: mid,
        half_band: half,
    }
}
