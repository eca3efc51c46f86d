//! Time-series aggregation engine
//!
//! The processor talks to the engine only through [`LiquidityEngine`]; the
//! engine's internal bucketing is its own business. [`TimeSeriesEngine`] is
//! the in-process implementation:
//!
//! - one bucket map per registered timeframe, keyed by bucket start
//! - a snapshot is folded into the current bucket of every timeframe
//! - the bucket is updated in place, so a slice keeps its time range while
//!   its content changes
//! - prices are quantized to the price resolution (tick)
//! - bounded retention per timeframe, and a bounded tick span per slice

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use types::market::OrderBookSnapshot;

use crate::dense_book::DenseBookView;

/// Timeframes registered by default (ms).
pub const DEFAULT_TIMEFRAMES_MS: [i64; 9] = [100, 250, 500, 1000, 2000, 5000, 10_000, 30_000, 60_000];

pub const DEFAULT_PRICE_RESOLUTION: f64 = 1.0;

/// Buckets kept per timeframe before the oldest is evicted.
pub const DEFAULT_MAX_SLICES_PER_TIMEFRAME: usize = 20_000;

/// Depth kept per side, in ticks from that side's best level.
pub const MAX_DEPTH_TICKS: i64 = 4096;

/// Widest tick range one slice may cover. Levels that would widen a slice
/// past this are dropped.
pub const MAX_TICKS_PER_SLICE: i64 = 16_384;

/// Aggregated metrics of one price level within a slice.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LevelMetrics {
    /// Snapshots in which this level had a positive quantity.
    pub snapshot_count: u32,
    pub total_quantity: f64,
    pub peak_quantity: f64,
}

impl LevelMetrics {
    fn record(&mut self, quantity: f64) {
        self.snapshot_count += 1;
        self.total_quantity += quantity;
        if quantity > self.peak_quantity {
            self.peak_quantity = quantity;
        }
    }

    /// Mean resting quantity over the snapshots that saw the level.
    pub fn display_value(&self) -> f32 {
        if self.snapshot_count == 0 {
            return 0.0;
        }
        (self.total_quantity / self.snapshot_count as f64) as f32
    }
}

/// One time bucket of per-tick bid/ask metrics.
///
/// Level `i` of either side sits at price `(min_tick + i) × tick_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityTimeSlice {
    pub start_ms: i64,
    pub end_ms: i64,
    pub duration_ms: i64,
    pub tick_size: f64,
    pub min_tick: i64,
    pub bid_metrics: Vec<LevelMetrics>,
    pub ask_metrics: Vec<LevelMetrics>,
}

impl LiquidityTimeSlice {
    pub fn new(start_ms: i64, duration_ms: i64, tick_size: f64) -> Self {
        Self {
            start_ms,
            end_ms: start_ms + duration_ms,
            duration_ms,
            tick_size,
            min_tick: 0,
            bid_metrics: Vec::new(),
            ask_metrics: Vec::new(),
        }
    }

    pub fn price_for_level(&self, index: usize) -> f64 {
        (self.min_tick + index as i64) as f64 * self.tick_size
    }

    pub fn is_empty(&self) -> bool {
        self.bid_metrics.is_empty() && self.ask_metrics.is_empty()
    }

    /// Grow both sides so that `tick` is addressable; returns its index, or
    /// `None` when the slice would exceed [`MAX_TICKS_PER_SLICE`].
    fn ensure_tick(&mut self, tick: i64) -> Option<usize> {
        if self.is_empty() {
            self.min_tick = tick;
        }
        let max_tick = self.min_tick + self.bid_metrics.len().max(1) as i64 - 1;
        if max_tick.max(tick) - self.min_tick.min(tick) >= MAX_TICKS_PER_SLICE {
            return None;
        }
        if tick < self.min_tick {
            let grow = (self.min_tick - tick) as usize;
            for side in [&mut self.bid_metrics, &mut self.ask_metrics] {
                side.splice(0..0, std::iter::repeat(LevelMetrics::default()).take(grow));
            }
            self.min_tick = tick;
        }
        let idx = (tick - self.min_tick) as usize;
        for side in [&mut self.bid_metrics, &mut self.ask_metrics] {
            if side.len() <= idx {
                side.resize(idx + 1, LevelMetrics::default());
            }
        }
        Some(idx)
    }

    /// Fold one snapshot in; returns how many levels did not fit.
    fn record(&mut self, bids: &BTreeMap<i64, f64>, asks: &BTreeMap<i64, f64>) -> usize {
        let mut dropped = 0;
        // nearest to mid first, so a wide book loses its far levels
        for (&tick, &qty) in bids.iter().rev() {
            match self.ensure_tick(tick) {
                Some(idx) => self.bid_metrics[idx].record(qty),
                None => dropped += 1,
            }
        }
        for (&tick, &qty) in asks {
            match self.ensure_tick(tick) {
                Some(idx) => self.ask_metrics[idx].record(qty),
                None => dropped += 1,
            }
        }
        dropped
    }
}

/// Aggregation oracle consumed by the grid processor.
pub trait LiquidityEngine: Send {
    /// Fold a sparse snapshot into the bucket containing its timestamp.
    fn add_snapshot(&mut self, snapshot: &OrderBookSnapshot);

    /// Fold a dense capture into the bucket containing its timestamp.
    fn add_dense_snapshot(&mut self, view: &DenseBookView);

    /// Slices of `timeframe_ms` intersecting `[start_ms, end_ms)`, ordered by start.
    fn visible_slices(&self, timeframe_ms: i64, start_ms: i64, end_ms: i64) -> Vec<&LiquidityTimeSlice>;

    /// Timeframe giving at most `target_cells` columns over the range.
    fn suggest_timeframe(&self, start_ms: i64, end_ms: i64, target_cells: usize) -> i64;

    fn set_price_resolution(&mut self, resolution: f64);

    fn price_resolution(&self) -> f64;

    fn add_timeframe(&mut self, timeframe_ms: i64);
}

/// In-process multi-timeframe bucket aggregator.
#[derive(Debug)]
pub struct TimeSeriesEngine {
    timeframes: Vec<i64>,
    slices: HashMap<i64, BTreeMap<i64, LiquidityTimeSlice>>,
    price_resolution: f64,
    max_slices_per_timeframe: usize,
    snapshots_ingested: u64,
}

impl Default for TimeSeriesEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesEngine {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MAX_SLICES_PER_TIMEFRAME)
    }

    pub fn with_retention(max_slices_per_timeframe: usize) -> Self {
        Self {
            timeframes: DEFAULT_TIMEFRAMES_MS.to_vec(),
            slices: HashMap::new(),
            price_resolution: DEFAULT_PRICE_RESOLUTION,
            max_slices_per_timeframe: max_slices_per_timeframe.max(1),
            snapshots_ingested: 0,
        }
    }

    pub fn timeframes(&self) -> &[i64] {
        &self.timeframes
    }

    pub fn snapshots_ingested(&self) -> u64 {
        self.snapshots_ingested
    }

    pub fn slice_count(&self, timeframe_ms: i64) -> usize {
        self.slices.get(&timeframe_ms).map_or(0, |m| m.len())
    }

    fn quantize(&self, price: f64) -> Option<i64> {
        if !price.is_finite() {
            return None;
        }
        Some((price / self.price_resolution).round() as i64)
    }

    /// Sum quantities per tick within one snapshot.
    fn collapse<I>(&self, levels: I) -> BTreeMap<i64, f64>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut by_tick = BTreeMap::new();
        for (price, qty) in levels {
            if !(qty > 0.0) {
                continue;
            }
            if let Some(tick) = self.quantize(price) {
                *by_tick.entry(tick).or_insert(0.0) += qty;
            }
        }
        by_tick
    }

    fn ingest(&mut self, timestamp_ms: i64, mut bids: BTreeMap<i64, f64>, mut asks: BTreeMap<i64, f64>) {
        if bids.is_empty() && asks.is_empty() {
            return;
        }
        // stale levels far from the touch would blow up every slice
        if let Some((&best_bid, _)) = bids.last_key_value() {
            bids.retain(|&tick, _| tick >= best_bid - MAX_DEPTH_TICKS);
        }
        if let Some((&best_ask, _)) = asks.first_key_value() {
            asks.retain(|&tick, _| tick <= best_ask + MAX_DEPTH_TICKS);
        }

        let resolution = self.price_resolution;
        let retention = self.max_slices_per_timeframe;
        let mut dropped = 0;
        for &tf in &self.timeframes {
            let start = timestamp_ms.div_euclid(tf) * tf;
            let buckets = self.slices.entry(tf).or_default();
            dropped += buckets
                .entry(start)
                .or_insert_with(|| LiquidityTimeSlice::new(start, tf, resolution))
                .record(&bids, &asks);
            while buckets.len() > retention {
                buckets.pop_first();
            }
        }
        if dropped > 0 {
            debug!(timestamp_ms, dropped, "Levels outside the slice span dropped");
        }
        self.snapshots_ingested += 1;
    }
}

impl LiquidityEngine for TimeSeriesEngine {
    fn add_snapshot(&mut self, snapshot: &OrderBookSnapshot) {
        let bids = self.collapse(snapshot.bids.iter().map(|l| (l.price, l.quantity)));
        let asks = self.collapse(snapshot.asks.iter().map(|l| (l.price, l.quantity)));
        self.ingest(snapshot.timestamp_ms, bids, asks);
    }

    fn add_dense_snapshot(&mut self, view: &DenseBookView) {
        let bids = self.collapse(
            view.bid_levels
                .iter()
                .map(|l| (view.price_at(l.tick_index), l.quantity)),
        );
        let asks = self.collapse(
            view.ask_levels
                .iter()
                .map(|l| (view.price_at(l.tick_index), l.quantity)),
        );
        self.ingest(view.timestamp_ms, bids, asks);
    }

    fn visible_slices(&self, timeframe_ms: i64, start_ms: i64, end_ms: i64) -> Vec<&LiquidityTimeSlice> {
        if timeframe_ms <= 0 || end_ms <= start_ms {
            return Vec::new();
        }
        let Some(buckets) = self.slices.get(&timeframe_ms) else {
            return Vec::new();
        };
        let lo = start_ms.saturating_sub(timeframe_ms).saturating_add(1);
        if lo >= end_ms {
            return Vec::new();
        }
        buckets
            .range(lo..end_ms)
            .map(|(_, slice)| slice)
            .filter(|slice| slice.end_ms > start_ms)
            .collect()
    }

    fn suggest_timeframe(&self, start_ms: i64, end_ms: i64, target_cells: usize) -> i64 {
        let smallest = self.timeframes.first().copied().unwrap_or(DEFAULT_TIMEFRAMES_MS[0]);
        let span = end_ms.saturating_sub(start_ms);
        if span <= 0 || target_cells == 0 {
            return smallest;
        }
        self.timeframes
            .iter()
            .copied()
            .find(|&tf| span / tf <= target_cells as i64)
            .or_else(|| self.timeframes.last().copied())
            .unwrap_or(smallest)
    }

    fn set_price_resolution(&mut self, resolution: f64) {
        if !(resolution.is_finite() && resolution > 0.0) {
            debug!(resolution, "Ignoring invalid price resolution");
            return;
        }
        if resolution == self.price_resolution {
            return;
        }
        info!(
            from = self.price_resolution,
            to = resolution,
            "Price resolution changed, discarding buckets"
        );
        self.price_resolution = resolution;
        self.slices.clear();
    }

    fn price_resolution(&self) -> f64 {
        self.price_resolution
    }

    fn add_timeframe(&mut self, timeframe_ms: i64) {
        if timeframe_ms <= 0 {
            return;
        }
        if let Err(pos) = self.timeframes.binary_search(&timeframe_ms) {
            self.timeframes.insert(pos, timeframe_ms);
            debug!(timeframe_ms, "Registered timeframe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense_book::DenseLevel;
    use types::ids::InstrumentId;
    use types::market::BookLevel;

    fn book(ts: i64, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBookSnapshot {
        OrderBookSnapshot::from_levels(
            InstrumentId::new("X"),
            ts,
            bids.iter().map(|&(p, q)| BookLevel::new(p, q)).collect(),
            asks.iter().map(|&(p, q)| BookLevel::new(p, q)).collect(),
        )
    }

    #[test]
    fn test_snapshot_lands_in_bucket() {
        let mut engine = TimeSeriesEngine::new();
        engine.add_snapshot(&book(1_050, &[(99.0, 2.0)], &[(101.0, 3.0)]));

        let slices = engine.visible_slices(100, 0, 10_000);
        assert_eq!(slices.len(), 1);
        let slice = slices[0];
        assert_eq!((slice.start_ms, slice.end_ms), (1_000, 1_100));
        assert_eq!(slice.min_tick, 99);
        assert_eq!(slice.bid_metrics[0].snapshot_count, 1);
        assert_eq!(slice.ask_metrics[2].display_value(), 3.0);
        assert_eq!(slice.price_for_level(2), 101.0);
        // every default timeframe got the snapshot
        assert_eq!(engine.slice_count(60_000), 1);
    }

    #[test]
    fn test_same_bucket_updates_in_place() {
        let mut engine = TimeSeriesEngine::new();
        engine.add_snapshot(&book(1_000, &[(99.0, 2.0)], &[]));
        engine.add_snapshot(&book(1_040, &[(99.0, 4.0)], &[]));
        assert_eq!(engine.slice_count(100), 1);
        let slice = engine.visible_slices(100, 1_000, 1_100)[0];
        assert_eq!(slice.bid_metrics[0].snapshot_count, 2);
        assert_eq!(slice.bid_metrics[0].display_value(), 3.0);
        assert_eq!(slice.bid_metrics[0].peak_quantity, 4.0);
    }

    #[test]
    fn test_levels_collapse_per_tick_within_snapshot() {
        let mut engine = TimeSeriesEngine::new();
        engine.set_price_resolution(5.0);
        engine.add_snapshot(&book(0, &[(99.0, 1.0), (100.5, 2.0)], &[]));
        let slice = engine.visible_slices(100, 0, 100)[0];
        assert_eq!(slice.min_tick, 20);
        assert_eq!(slice.bid_metrics.len(), 1);
        assert_eq!(slice.bid_metrics[0].snapshot_count, 1);
        assert_eq!(slice.bid_metrics[0].total_quantity, 3.0);
    }

    #[test]
    fn test_stale_levels_far_from_touch_dropped() {
        let mut engine = TimeSeriesEngine::new();
        engine.add_snapshot(&book(
            0,
            &[(99.0, 1.0), (98.0, 1.0)],
            &[(101.0, 1.0), (100_000.0, 5.0)],
        ));
        let slice = engine.visible_slices(100, 0, 100)[0];
        assert_eq!(slice.min_tick, 98);
        assert_eq!(slice.bid_metrics.len(), 4);
        assert_eq!(slice.ask_metrics[3].snapshot_count, 1);
    }

    #[test]
    fn test_slice_span_is_bounded() {
        let mut engine = TimeSeriesEngine::new();
        engine.add_snapshot(&book(0, &[(1.0, 1.0)], &[(1_000_000.0, 1.0)]));
        assert_eq!(engine.snapshots_ingested(), 1);
        for &tf in engine.timeframes() {
            let slice = engine.visible_slices(tf, 0, tf)[0];
            assert!(slice.bid_metrics.len() as i64 <= MAX_TICKS_PER_SLICE);
            assert_eq!(slice.bid_metrics.len(), slice.ask_metrics.len());
            // the bid is kept, the far ask did not fit
            assert_eq!(slice.bid_metrics[0].snapshot_count, 1);
        }
    }

    #[test]
    fn test_ensure_tick_grows_downward() {
        let mut engine = TimeSeriesEngine::new();
        engine.add_snapshot(&book(0, &[], &[(105.0, 1.0)]));
        engine.add_snapshot(&book(10, &[(95.0, 1.0)], &[]));
        let slice = engine.visible_slices(100, 0, 100)[0];
        assert_eq!(slice.min_tick, 95);
        assert_eq!(slice.bid_metrics.len(), slice.ask_metrics.len());
        assert_eq!(slice.ask_metrics[10].snapshot_count, 1);
        assert_eq!(slice.bid_metrics[0].snapshot_count, 1);
    }

    #[test]
    fn test_visible_slices_range() {
        let mut engine = TimeSeriesEngine::new();
        for ts in (0..1_000).step_by(100) {
            engine.add_snapshot(&book(ts, &[(99.0, 1.0)], &[]));
        }
        let slices = engine.visible_slices(100, 250, 520);
        let starts: Vec<i64> = slices.iter().map(|s| s.start_ms).collect();
        assert_eq!(starts, vec![200, 300, 400, 500]);
        assert!(engine.visible_slices(100, 5_000, 6_000).is_empty());
        assert!(engine.visible_slices(77, 0, 1_000).is_empty());
        assert_eq!(engine.visible_slices(100, i64::MIN, i64::MAX).len(), 10);
    }

    #[test]
    fn test_dense_snapshot() {
        let mut engine = TimeSeriesEngine::new();
        let view = DenseBookView {
            min_price: 90.0,
            tick_size: 0.5,
            timestamp_ms: 300,
            bid_levels: vec![DenseLevel { tick_index: 18, quantity: 2.0 }],
            ask_levels: vec![DenseLevel { tick_index: 22, quantity: 1.0 }],
        };
        engine.add_dense_snapshot(&view);
        let slice = engine.visible_slices(100, 300, 400)[0];
        assert_eq!(slice.min_tick, 99);
        assert_eq!(slice.ask_metrics[2].snapshot_count, 1);
    }

    #[test]
    fn test_empty_snapshot_ignored() {
        let mut engine = TimeSeriesEngine::new();
        engine.add_snapshot(&book(0, &[(99.0, 0.0)], &[]));
        assert_eq!(engine.snapshots_ingested(), 0);
        assert_eq!(engine.slice_count(100), 0);
    }

    #[test]
    fn test_suggest_timeframe() {
        let engine = TimeSeriesEngine::new();
        assert_eq!(engine.suggest_timeframe(0, 60_000, 2000), 100);
        assert_eq!(engine.suggest_timeframe(0, 600_000, 2000), 500);
        assert_eq!(engine.suggest_timeframe(0, i64::MAX / 2, 10), 60_000);
        assert_eq!(engine.suggest_timeframe(10, 10, 2000), 100);
    }

    #[test]
    fn test_add_timeframe_keeps_order() {
        let mut engine = TimeSeriesEngine::new();
        engine.add_timeframe(50);
        engine.add_timeframe(50);
        engine.add_timeframe(-5);
        assert_eq!(engine.timeframes()[0], 50);
        assert_eq!(engine.timeframes().len(), DEFAULT_TIMEFRAMES_MS.len() + 1);
    }

    #[test]
    fn test_resolution_change_discards_buckets() {
        let mut engine = TimeSeriesEngine::new();
        engine.add_snapshot(&book(0, &[(99.0, 1.0)], &[]));
        engine.set_price_resolution(1.0);
        assert_eq!(engine.slice_count(100), 1);
        engine.set_price_resolution(2.5);
        assert_eq!(engine.slice_count(100), 0);
        engine.set_price_resolution(0.0);
        assert_eq!(engine.price_resolution(), 2.5);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let mut engine = TimeSeriesEngine::with_retention(3);
        for ts in (0..500).step_by(100) {
            engine.add_snapshot(&book(ts, &[(99.0, 1.0)], &[]));
        }
        let starts: Vec<i64> = engine
            .visible_slices(100, 0, 1_000)
            .iter()
            .map(|s| s.start_ms)
            .collect();
        assert_eq!(starts, vec![200, 300, 400]);
    }
}
