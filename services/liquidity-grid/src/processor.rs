//! Grid Aggregation Processor
//!
//! Producer side of the grid:
//! - fixed-cadence sampling with carry-forward across skipped buckets
//! - dense and banded ingestion of live book updates
//! - one-time viewport bootstrap from the first trade or book
//! - incremental visible-cell computation gated on the viewport version
//! - publication through [`SnapshotPublisher`] and change notification
//!
//! Producer state lives behind one mutex, the publish slot behind another,
//! so readers of the published snapshot never wait on aggregation. Every
//! entry point returns early, without error, on missing or invalid state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use types::ids::InstrumentId;
use types::market::{OrderBookSnapshot, Trade};

use crate::band::{select_band, select_sparse_band};
use crate::cell::{BookSide, CellInstance, PublishedSnapshot, SliceRange};
use crate::config::{BandConfig, BandMode, GridConfig, TradeBatchConfig};
use crate::dense_book::{DenseBookView, DenseOrderBook};
use crate::engine::{LevelMetrics, LiquidityEngine, LiquidityTimeSlice};
use crate::publisher::SnapshotPublisher;
use crate::stats::ProcessorStats;
use crate::viewport::{Viewport, ViewportState};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications emitted to consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum GridEvent {
    /// A new snapshot is available from the publisher.
    SnapshotPublished { cells: usize },
    /// The viewport went from invalid to valid.
    ViewportInitialized { version: u64 },
    /// Derived data was discarded.
    DataCleared,
}

/// Outcome of one visible-cell pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub rebuild: bool,
    pub timeframe_ms: i64,
    pub slices: usize,
    pub processed_slices: usize,
    pub appended: usize,
    pub total_cells: usize,
    pub published: bool,
}

/// Last book state, carried forward by the sampler.
#[derive(Debug, Clone)]
enum LatestBook {
    Sparse(OrderBookSnapshot),
    Dense(DenseBookView),
}

struct ProducerState<E> {
    engine: E,
    instrument: Option<InstrumentId>,
    cells: Vec<CellInstance>,
    processed: HashSet<SliceRange>,
    last_viewport_version: Option<u64>,
    force_rebuild: bool,
    timeframe_ms: i64,
    manual_override_at: Option<Instant>,
    latest_book: Option<LatestBook>,
    last_bucket_ms: Option<i64>,
    band: BandConfig,
    use_dense_ingestion: bool,
    trade_batch: TradeBatchConfig,
}

impl<E> ProducerState<E> {
    /// Accept events for the first instrument seen; drop the rest.
    fn accepts(&mut self, instrument: &InstrumentId) -> bool {
        match &self.instrument {
            Some(bound) => bound == instrument,
            None => {
                self.instrument = Some(instrument.clone());
                true
            }
        }
    }

    fn reset_cells(&mut self) {
        self.cells.clear();
        self.processed.clear();
    }
}

pub struct GridProcessor<E: LiquidityEngine> {
    config: GridConfig,
    state: Mutex<ProducerState<E>>,
    publisher: SnapshotPublisher,
    viewport: Arc<ViewportState>,
    shutting_down: AtomicBool,
    events: Mutex<Option<broadcast::Sender<GridEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    stats: ProcessorStats,
}

impl<E: LiquidityEngine> GridProcessor<E> {
    pub fn new(engine: E, viewport: Arc<ViewportState>, config: GridConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let state = ProducerState {
            engine,
            instrument: None,
            cells: Vec::new(),
            processed: HashSet::new(),
            last_viewport_version: None,
            force_rebuild: false,
            timeframe_ms: config.default_timeframe_ms,
            manual_override_at: None,
            latest_book: None,
            last_bucket_ms: None,
            band: config.band.clone(),
            use_dense_ingestion: config.use_dense_ingestion,
            trade_batch: config.trade_batch.clone(),
        };
        Self {
            config,
            state: Mutex::new(state),
            publisher: SnapshotPublisher::new(),
            viewport,
            shutting_down: AtomicBool::new(false),
            events: Mutex::new(Some(events_tx)),
            shutdown_tx,
            stats: ProcessorStats::new(),
        }
    }

    pub fn with_defaults(engine: E) -> Self {
        Self::new(engine, Arc::new(ViewportState::new()), GridConfig::default())
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn viewport(&self) -> &Arc<ViewportState> {
        &self.viewport
    }

    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> Option<MutexGuard<'_, ProducerState<E>>> {
        match self.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                error!("Producer state lock poisoned");
                None
            }
        }
    }

    /// Run `f` against the engine under the producer lock.
    pub fn with_engine<R>(&self, f: impl FnOnce(&E) -> R) -> Option<R> {
        self.lock_state().map(|st| f(&st.engine))
    }

    /// Change notifications; `None` once shut down.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<GridEvent>> {
        self.events.lock().ok()?.as_ref().map(|tx| tx.subscribe())
    }

    /// Flips to `true` exactly once, on shutdown.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn notify(&self, event: GridEvent) {
        if let Ok(events) = self.events.lock() {
            if let Some(tx) = events.as_ref() {
                // no receivers is fine
                let _ = tx.send(event);
            }
        }
    }

    /// Latest published cell list, shared without copying.
    pub fn published_snapshot(&self) -> Option<PublishedSnapshot> {
        self.publisher.read_latest()
    }

    pub fn publish_count(&self) -> u64 {
        self.publisher.publish_count()
    }

    fn bootstrap_viewport(&self, timestamp_ms: i64, reference_price: f64, source: &'static str) {
        if self.viewport.is_valid() || !reference_price.is_finite() {
            return;
        }
        let half = self.config.bootstrap_half_window_ms;
        let margin = self.config.bootstrap_price_margin;
        if self.viewport.initialize(
            timestamp_ms - half,
            timestamp_ms + half,
            reference_price - margin,
            reference_price + margin,
        ) {
            let version = self.viewport.version();
            info!(
                source,
                timestamp_ms,
                price_min = reference_price - margin,
                price_max = reference_price + margin,
                "Viewport initialized"
            );
            self.notify(GridEvent::ViewportInitialized { version });
        }
    }

    /// Record a trade. Only used to bootstrap the viewport.
    pub fn on_trade(&self, trade: &Trade) {
        if self.is_shutting_down() {
            return;
        }
        if !trade.is_well_formed() {
            debug!(instrument = %trade.instrument, "Dropping trade with non-positive size");
            self.stats.record_dropped();
            return;
        }
        {
            let Some(mut st) = self.lock_state() else {
                return;
            };
            if !st.accepts(&trade.instrument) {
                debug!(instrument = %trade.instrument, "Dropping trade for foreign instrument");
                self.stats.record_dropped();
                return;
            }
        }
        self.stats.record_trade();
        self.bootstrap_viewport(trade.timestamp_ms, trade.price.to_f64(), "trade");
    }

    /// Band a sparse book, keep it as the sampler's latest state and
    /// recompute.
    pub fn on_order_book(&self, book: OrderBookSnapshot) {
        if self.is_shutting_down() {
            return;
        }
        if !book.is_two_sided() {
            debug!(instrument = %book.instrument, "Dropping one-sided or empty book");
            self.stats.record_dropped();
            return;
        }
        let timestamp_ms = book.timestamp_ms;
        let mid;
        {
            let Some(mut st) = self.lock_state() else {
                return;
            };
            if !st.accepts(&book.instrument) {
                self.stats.record_dropped();
                return;
            }
            let selection = select_sparse_band(&book, &st.band, st.engine.price_resolution());
            if selection.snapshot.bids.len() < book.bids.len()
                || selection.snapshot.asks.len() < book.asks.len()
            {
                debug!(
                    bids = selection.snapshot.bids.len(),
                    asks = selection.snapshot.asks.len(),
                    half_band = selection.half_band,
                    "Sparse book banded"
                );
            }
            mid = selection.mid_price;
            st.latest_book = Some(LatestBook::Sparse(selection.snapshot));
        }
        self.bootstrap_viewport(timestamp_ms, mid, "order_book");
        self.update_visible_cells();
    }

    /// Ingest the live dense book after `delta_count` deltas were applied.
    ///
    /// With dense ingestion enabled and a non-empty capture, the bounded
    /// dense view goes straight to the engine and banding is skipped.
    /// Otherwise the book is banded and the sparse result is fed.
    pub fn on_dense_book_update(&self, book: &DenseOrderBook, delta_count: usize) {
        if self.is_shutting_down() {
            return;
        }
        let reference_price;
        {
            let Some(mut guard) = self.lock_state() else {
                return;
            };
            let st = &mut *guard;
            if !st.accepts(book.instrument()) {
                self.stats.record_dropped();
                return;
            }

            let mut fed = false;
            if st.use_dense_ingestion {
                let view = book.capture_dense_non_zero(self.config.dense_max_levels_per_side);
                if !view.is_empty() {
                    st.engine.add_dense_snapshot(&view);
                    self.stats.record_snapshot_fed(false);
                    st.latest_book = Some(LatestBook::Dense(view));
                    fed = true;
                }
            }

            if fed {
                reference_price = book.mid_price();
            } else {
                let selection = select_band(book, &st.band, book.center_price());
                if selection.snapshot.is_empty() {
                    debug!(delta_count, "Banded book is empty, nothing to feed");
                    return;
                }
                st.engine.add_snapshot(&selection.snapshot);
                self.stats.record_snapshot_fed(false);
                debug!(
                    bids = selection.snapshot.bids.len(),
                    asks = selection.snapshot.asks.len(),
                    delta_count,
                    "Fed banded snapshot"
                );
                st.latest_book = Some(LatestBook::Sparse(selection.snapshot));
                reference_price = Some(selection.mid_price);
            }
        }
        if let Some(price) = reference_price {
            self.bootstrap_viewport(book.timestamp_ms(), price, "dense_book");
        }
        self.update_visible_cells();
    }

    /// Periodic sampler tick. Feeds the latest book once per elapsed bucket
    /// and returns how many snapshots went to the engine.
    ///
    /// The first sample after start or clear seeds the bucket clock with a
    /// single snapshot. After that, if buckets were skipped, the same book
    /// is fed for each of them, stamped at its bucket boundary.
    pub fn sample_order_book(&self, now_ms: i64) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        let interval = self.config.sample_interval_ms.max(1);
        let bucket = now_ms.div_euclid(interval) * interval;
        let fed = {
            let Some(mut guard) = self.lock_state() else {
                return 0;
            };
            let st = &mut *guard;
            let Some(latest) = st.latest_book.as_ref() else {
                return 0;
            };

            let first = match st.last_bucket_ms {
                None => bucket,
                Some(last) if bucket > last => last + interval,
                Some(_) => return 0,
            };

            let mut fed = 0;
            let mut ts = first;
            while ts <= bucket {
                match latest {
                    LatestBook::Sparse(book) => st.engine.add_snapshot(&book.restamped(ts)),
                    LatestBook::Dense(view) => st.engine.add_dense_snapshot(&DenseBookView {
                        timestamp_ms: ts,
                        ..view.clone()
                    }),
                }
                self.stats.record_snapshot_fed(ts < bucket);
                fed += 1;
                ts += interval;
            }
            if fed > 1 {
                debug!(from = first, to = bucket, buckets = fed, "Carried book forward");
            }
            st.last_bucket_ms = Some(bucket);
            fed
        };
        self.update_visible_cells();
        fed
    }

    /// Derive the new visible cells for the current viewport and publish.
    ///
    /// Returns `None` when the pass was skipped (shutdown, invalid viewport,
    /// poisoned lock).
    pub fn update_visible_cells(&self) -> Option<PassReport> {
        if self.is_shutting_down() {
            return None;
        }
        let mut guard = self.lock_state()?;
        if self.is_shutting_down() {
            return None;
        }
        let st = &mut *guard;

        let (mut viewport, mut version) = self.viewport.snapshot();
        if !viewport.is_valid() {
            return None;
        }

        let mut rebuild = st.force_rebuild || st.last_viewport_version != Some(version);

        let manual_active = st.manual_override_at.map_or(false, |set_at| {
            set_at.elapsed() <= Duration::from_millis(self.config.manual_timeframe_timeout_ms)
        });
        if !manual_active {
            if st.manual_override_at.take().is_some() {
                info!(timeframe_ms = st.timeframe_ms, "Manual timeframe override expired");
            }
            let suggested = st.engine.suggest_timeframe(
                viewport.time_start_ms,
                viewport.time_end_ms,
                self.config.target_cell_budget,
            );
            if suggested > 0 && suggested != st.timeframe_ms {
                info!(from = st.timeframe_ms, to = suggested, "Auto timeframe update");
                st.timeframe_ms = suggested;
                rebuild = true;
            }
        }
        let timeframe = st.timeframe_ms;

        if rebuild {
            st.reset_cells();
            st.force_rebuild = false;
            st.last_viewport_version = Some(version);
        }

        let mut slices =
            st.engine
                .visible_slices(timeframe, viewport.time_start_ms, viewport.time_end_ms);

        if slices.is_empty() && self.viewport.is_auto_scroll_enabled() {
            let newest = st
                .engine
                .visible_slices(timeframe, i64::MIN, i64::MAX)
                .last()
                .map(|s| s.end_ms);
            if let Some(newest) = newest {
                let gap = viewport.time_start_ms - newest;
                if gap > self.config.auto_fit_gap_ms {
                    let half = self.config.bootstrap_half_window_ms;
                    if self.viewport.set_time_window(newest - half, newest + half).is_some() {
                        (viewport, version) = self.viewport.snapshot();
                        info!(
                            gap_ms = gap,
                            time_start_ms = viewport.time_start_ms,
                            time_end_ms = viewport.time_end_ms,
                            "Auto-fit viewport to newest data"
                        );
                        self.stats.record_auto_fit();
                        st.cells.clear();
                        st.processed.clear();
                        st.last_viewport_version = Some(version);
                        rebuild = true;
                        slices = st.engine.visible_slices(
                            timeframe,
                            viewport.time_start_ms,
                            viewport.time_end_ms,
                        );
                    }
                }
            }
        } else if slices.is_empty() {
            debug!("No slices in view, auto-fit skipped while auto-scroll is off");
        }

        let before = st.cells.len();
        let mut processed_slices = 0;
        for slice in &slices {
            let range = SliceRange::new(slice.start_ms, slice.end_ms);
            if rebuild || !st.processed.contains(&range) {
                append_slice_cells(&mut st.cells, slice, &viewport, timeframe);
                st.processed.insert(range);
                processed_slices += 1;
            }
        }
        let slice_count = slices.len();
        drop(slices);

        let total_cells = st.cells.len();
        let appended = total_cells - before;
        self.stats.record_pass(rebuild, appended);

        debug!(
            mode = if rebuild { "rebuild" } else { "append" },
            slices = slice_count,
            processed_slices,
            total_cells,
            timeframe_ms = timeframe,
            manual = manual_active,
            "Visible cell pass"
        );

        let changed = rebuild || appended > 0;
        let published = changed && !self.is_shutting_down();
        if published {
            self.publisher.publish(&st.cells);
            self.notify(GridEvent::SnapshotPublished { cells: total_cells });
        }
        self.stats.record_publish(published);

        Some(PassReport {
            rebuild,
            timeframe_ms: timeframe,
            slices: slice_count,
            processed_slices,
            appended,
            total_cells,
            published,
        })
    }

    /// Explicit timeframe; takes priority over auto-suggestion until the
    /// override times out.
    pub fn set_timeframe(&self, timeframe_ms: i64) {
        if timeframe_ms <= 0 {
            return;
        }
        let Some(mut st) = self.lock_state() else {
            return;
        };
        st.engine.add_timeframe(timeframe_ms);
        if st.timeframe_ms != timeframe_ms {
            st.force_rebuild = true;
        }
        st.timeframe_ms = timeframe_ms;
        st.manual_override_at = Some(Instant::now());
        info!(timeframe_ms, "Manual timeframe set");
    }

    pub fn is_manual_timeframe_override_active(&self) -> bool {
        let timeout = Duration::from_millis(self.config.manual_timeframe_timeout_ms);
        self.lock_state()
            .and_then(|st| st.manual_override_at)
            .map_or(false, |set_at| set_at.elapsed() <= timeout)
    }

    pub fn current_timeframe_ms(&self) -> i64 {
        self.lock_state()
            .map_or(self.config.default_timeframe_ms, |st| st.timeframe_ms)
    }

    pub fn add_timeframe(&self, timeframe_ms: i64) {
        if let Some(mut st) = self.lock_state() {
            st.engine.add_timeframe(timeframe_ms);
        }
    }

    pub fn suggest_timeframe(&self, start_ms: i64, end_ms: i64, target_cells: usize) -> i64 {
        self.lock_state().map_or(self.config.default_timeframe_ms, |st| {
            st.engine.suggest_timeframe(start_ms, end_ms, target_cells)
        })
    }

    pub fn set_price_resolution(&self, resolution: f64) {
        if !(resolution.is_finite() && resolution > 0.0) {
            return;
        }
        let Some(mut st) = self.lock_state() else {
            return;
        };
        if st.engine.price_resolution() != resolution {
            st.engine.set_price_resolution(resolution);
            st.force_rebuild = true;
        }
    }

    pub fn price_resolution(&self) -> f64 {
        self.lock_state()
            .map_or(crate::engine::DEFAULT_PRICE_RESOLUTION, |st| st.engine.price_resolution())
    }

    pub fn set_band_mode(&self, mode: BandMode) {
        if let Some(mut st) = self.lock_state() {
            st.band.mode = mode;
        }
    }

    pub fn set_band_value(&self, value: f64) {
        if let Some(mut st) = self.lock_state() {
            st.band.value = value;
        }
    }

    pub fn band_config(&self) -> BandConfig {
        self.lock_state()
            .map_or_else(|| self.config.band.clone(), |st| st.band.clone())
    }

    pub fn set_dense_ingestion(&self, enabled: bool) {
        if let Some(mut st) = self.lock_state() {
            st.use_dense_ingestion = enabled;
        }
    }

    pub fn is_dense_ingestion_enabled(&self) -> bool {
        self.lock_state()
            .map_or(self.config.use_dense_ingestion, |st| st.use_dense_ingestion)
    }

    pub fn set_trade_batch(&self, batch: TradeBatchConfig) {
        if let Some(mut st) = self.lock_state() {
            st.trade_batch = batch;
        }
    }

    pub fn trade_batch(&self) -> TradeBatchConfig {
        self.lock_state()
            .map_or_else(|| self.config.trade_batch.clone(), |st| st.trade_batch.clone())
    }

    /// Drop derived state: cells, the published snapshot, the latest book
    /// and the sampling clock. The engine keeps its history. The viewport
    /// returns to its initial window.
    pub fn clear_data(&self) {
        {
            let Some(mut st) = self.lock_state() else {
                return;
            };
            st.reset_cells();
            st.latest_book = None;
            st.last_bucket_ms = None;
            st.force_rebuild = true;
        }
        self.publisher.clear();
        self.viewport.reset_zoom();
        info!("Grid data cleared");
        self.notify(GridEvent::DataCleared);
    }

    /// One-way, idempotent. Stops the sampler, severs notifications and
    /// clears working state. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        info!("Grid processor shutting down");
        self.shutdown_tx.send_replace(true);
        match self.events.lock() {
            Ok(mut events) => {
                events.take();
            }
            Err(_) => warn!("Event sender lock poisoned during shutdown"),
        }
        if let Some(mut st) = self.lock_state() {
            st.reset_cells();
            st.latest_book = None;
            st.last_bucket_ms = None;
        }
        self.publisher.clear();
        info!("Grid processor stopped");
    }
}

/// Append one cell per populated level of `slice` inside the viewport.
fn append_slice_cells(
    cells: &mut Vec<CellInstance>,
    slice: &LiquidityTimeSlice,
    viewport: &Viewport,
    timeframe_ms: i64,
) {
    if slice.end_ms < viewport.time_start_ms || slice.start_ms > viewport.time_end_ms {
        return;
    }
    let time_end_ms = if slice.end_ms > slice.start_ms {
        slice.end_ms
    } else {
        slice.start_ms + timeframe_ms.max(1)
    };
    let half_tick = slice.tick_size * 0.5;

    let mut emit = |metrics: &[LevelMetrics], side: BookSide| {
        for (i, m) in metrics.iter().enumerate() {
            if m.snapshot_count == 0 {
                continue;
            }
            let price = slice.price_for_level(i);
            if !viewport.contains_price(price) {
                continue;
            }
            let liquidity = m.display_value();
            if liquidity <= 0.0 {
                continue;
            }
            cells.push(CellInstance {
                time_start_ms: slice.start_ms,
                time_end_ms,
                price_min: price - half_tick,
                price_max: price + half_tick,
                liquidity,
                side,
            });
        }
    };
    emit(&slice.bid_metrics, BookSide::Bid);
    emit(&slice.ask_metrics, BookSide::Ask);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TimeSeriesEngine;
    use types::market::{BookLevel, Side};
    use types::numeric::{Price, Quantity};

    const T0: i64 = 1_700_000_000_000;

    fn make_processor() -> GridProcessor<TimeSeriesEngine> {
        let config = GridConfig {
            band: BandConfig {
                mode: BandMode::FixedDollar,
                value: 5.0,
                ..BandConfig::default()
            },
            ..GridConfig::default()
        };
        GridProcessor::new(TimeSeriesEngine::new(), Arc::new(ViewportState::new()), config)
    }

    fn make_book(ts: i64, bid: f64, ask: f64) -> OrderBookSnapshot {
        OrderBookSnapshot::from_levels(
            InstrumentId::new("X"),
            ts,
            vec![BookLevel::new(bid, 2.0), BookLevel::new(bid - 1.0, 1.0)],
            vec![BookLevel::new(ask, 3.0)],
        )
    }

    fn make_trade(ts: i64, price: u64) -> Trade {
        Trade::new(
            InstrumentId::new("X"),
            Price::from_u64(price),
            Quantity::from_u64(1),
            Side::Buy,
            ts,
        )
    }

    #[test]
    fn test_trade_bootstraps_viewport_once() {
        let p = make_processor();
        let mut events = p.subscribe().unwrap();
        p.on_trade(&make_trade(T0, 100));

        let vp = p.viewport().current();
        assert_eq!(vp.time_start_ms, T0 - 30_000);
        assert_eq!(vp.time_end_ms, T0 + 30_000);
        assert_eq!((vp.price_min, vp.price_max), (0.0, 200.0));
        assert_eq!(events.try_recv().unwrap(), GridEvent::ViewportInitialized { version: 1 });

        p.on_trade(&make_trade(T0 + 5_000, 500));
        assert_eq!(p.viewport().current().price_max, 200.0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_malformed_inputs_dropped() {
        let p = make_processor();
        let zero = Trade {
            size: Quantity::ZERO,
            ..make_trade(T0, 100)
        };
        p.on_trade(&zero);
        assert!(!p.viewport().is_valid());

        let mut one_sided = make_book(T0, 99.0, 101.0);
        one_sided.asks.clear();
        p.on_order_book(one_sided);
        assert!(!p.viewport().is_valid());
        assert_eq!(p.sample_order_book(T0), 0);
        assert_eq!(p.stats().export()["inputs_dropped"], 2);
    }

    #[test]
    fn test_foreign_instrument_dropped() {
        let p = make_processor();
        p.on_trade(&make_trade(T0, 100));
        let other = OrderBookSnapshot {
            instrument: InstrumentId::new("Y"),
            ..make_book(T0, 99.0, 101.0)
        };
        p.on_order_book(other);
        assert_eq!(p.sample_order_book(T0), 0);
    }

    #[test]
    fn test_no_pass_without_viewport() {
        let p = make_processor();
        assert!(p.update_visible_cells().is_none());
        assert!(p.published_snapshot().is_none());
    }

    #[test]
    fn test_first_sample_seeds_clock() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        assert_eq!(p.sample_order_book(T0 + 42), 1);
        // same bucket again: nothing
        assert_eq!(p.sample_order_book(T0 + 99), 0);
        assert_eq!(p.sample_order_book(T0 + 100), 1);
        assert_eq!(p.with_engine(|e| e.snapshots_ingested()), Some(2));
    }

    #[test]
    fn test_gap_filling_feeds_each_bucket() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);
        // two buckets skipped
        assert_eq!(p.sample_order_book(T0 + 300), 3);

        let starts = p
            .with_engine(|e| {
                e.visible_slices(100, T0, T0 + 1_000)
                    .iter()
                    .map(|s| s.start_ms)
                    .collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(starts, vec![T0, T0 + 100, T0 + 200, T0 + 300]);
        assert_eq!(p.stats().export()["carried_forward"], 2);
    }

    #[test]
    fn test_pass_builds_cells_for_both_sides() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);

        let snapshot = p.published_snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().any(|c| c.side == BookSide::Bid));
        assert!(snapshot.iter().any(|c| c.side == BookSide::Ask));
        let ask = snapshot.iter().find(|c| c.side == BookSide::Ask).unwrap();
        assert_eq!((ask.price_min, ask.price_max), (100.5, 101.5));
        assert_eq!((ask.time_start_ms, ask.time_end_ms), (T0, T0 + 100));
        assert_eq!(ask.liquidity, 3.0);
    }

    #[test]
    fn test_second_pass_without_changes_skips_publish() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);
        let published = p.publish_count();
        let cells = p.published_snapshot().unwrap().len();

        let report = p.update_visible_cells().unwrap();
        assert!(!report.rebuild);
        assert!(!report.published);
        assert_eq!(report.total_cells, cells);
        assert_eq!(p.publish_count(), published);
    }

    #[test]
    fn test_refreshed_slice_is_not_reprocessed() {
        use types::market::BookDelta;

        let p = make_processor();
        let mut book = dense_book_with_spread();
        p.on_dense_book_update(&book, 2);
        let before = p.published_snapshot().unwrap().len();
        let published = p.publish_count();

        // same 100ms bucket, new bid size
        book.apply_deltas(
            &[BookDelta::new(Side::Buy, Price::from_u64(99), Quantity::from_u64(8))],
            T0 + 50,
        );
        p.on_dense_book_update(&book, 1);
        assert_eq!(p.with_engine(|e| e.snapshots_ingested()), Some(2));
        let bid_count = p
            .with_engine(|e| {
                let slice = e.visible_slices(100, T0, T0 + 100)[0];
                slice.bid_metrics.iter().map(|m| m.snapshot_count).max()
            })
            .flatten();
        assert_eq!(bid_count, Some(2));

        let report = p.update_visible_cells().unwrap();
        assert!(!report.rebuild);
        assert_eq!(report.appended, 0);
        assert_eq!(p.published_snapshot().unwrap().len(), before);
        assert_eq!(p.publish_count(), published);

        // a new bucket does add cells
        p.sample_order_book(T0 + 100);
        p.sample_order_book(T0 + 200);
        assert!(p.published_snapshot().unwrap().len() > before);
    }

    #[test]
    fn test_sparse_book_is_banded_before_sampling() {
        let p = make_processor();
        p.on_order_book(OrderBookSnapshot::from_levels(
            InstrumentId::new("X"),
            T0,
            vec![
                BookLevel::new(99.0, 2.0),
                BookLevel::new(98.0, 1.0),
                BookLevel::new(1.0, 40.0),
            ],
            vec![BookLevel::new(101.0, 3.0), BookLevel::new(1_000_000.0, 7.0)],
        ));
        p.sample_order_book(T0);

        let (len, min_tick) = p
            .with_engine(|e| {
                let slice = e.visible_slices(100, T0, T0 + 100)[0];
                (slice.bid_metrics.len(), slice.min_tick)
            })
            .unwrap();
        // ticks 98..=101 only
        assert_eq!(len, 4);
        assert_eq!(min_tick, 98);
        assert_eq!(p.published_snapshot().unwrap().len(), 3);
    }

    #[test]
    fn test_viewport_change_triggers_rebuild() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);

        // narrow the price window so the 98 bid falls out
        let vp = p.viewport().current();
        p.viewport()
            .set_viewport(vp.time_start_ms, vp.time_end_ms, 98.5, 150.0);
        let report = p.update_visible_cells().unwrap();
        assert!(report.rebuild);
        assert!(report.published);
        assert_eq!(report.total_cells, 2);
    }

    #[test]
    fn test_auto_fit_snaps_to_newest_data() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);

        // move the window two minutes past the data
        let vp = p.viewport().current();
        p.viewport().set_viewport(
            T0 + 120_000,
            T0 + 180_000,
            vp.price_min,
            vp.price_max,
        );
        let report = p.update_visible_cells().unwrap();
        let vp = p.viewport().current();
        assert_eq!(vp.time_start_ms, T0 + 100 - 30_000);
        assert_eq!(vp.time_end_ms, T0 + 100 + 30_000);
        assert!(report.rebuild);
        assert!(report.total_cells > 0);
        assert_eq!(p.stats().export()["auto_fits"], 1);

        // the adopted version does not trigger another rebuild
        assert!(!p.update_visible_cells().unwrap().rebuild);
    }

    #[test]
    fn test_auto_fit_waits_until_gap_exceeds_threshold() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);
        let vp = p.viewport().current();

        // newest slice ends at T0 + 100; a gap of exactly 60s stays put
        let start = T0 + 100 + 60_000;
        p.viewport()
            .set_viewport(start, start + 60_000, vp.price_min, vp.price_max);
        let report = p.update_visible_cells().unwrap();
        assert_eq!(p.viewport().current().time_start_ms, start);
        assert_eq!(report.total_cells, 0);
        assert_eq!(p.stats().export()["auto_fits"], 0);

        p.viewport()
            .set_viewport(start + 1, start + 60_001, vp.price_min, vp.price_max);
        p.update_visible_cells().unwrap();
        assert_eq!(p.viewport().current().time_start_ms, T0 + 100 - 30_000);
        assert_eq!(p.stats().export()["auto_fits"], 1);
    }

    #[test]
    fn test_auto_fit_respects_disabled_auto_scroll() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);

        let vp = p.viewport().current();
        p.viewport().set_viewport(
            T0 + 120_000,
            T0 + 180_000,
            vp.price_min,
            vp.price_max,
        );
        p.viewport().set_auto_scroll(false);
        let report = p.update_visible_cells().unwrap();
        assert_eq!(p.viewport().current().time_start_ms, T0 + 120_000);
        assert_eq!(report.total_cells, 0);
    }

    #[test]
    fn test_manual_timeframe_override() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);

        p.set_timeframe(250);
        assert!(p.is_manual_timeframe_override_active());
        let report = p.update_visible_cells().unwrap();
        assert_eq!(report.timeframe_ms, 250);
        assert!(report.rebuild);
        assert_eq!(p.current_timeframe_ms(), 250);

        p.set_timeframe(0);
        assert_eq!(p.current_timeframe_ms(), 250);
    }

    #[test]
    fn test_manual_override_expires() {
        let config = GridConfig {
            manual_timeframe_timeout_ms: 0,
            ..GridConfig::default()
        };
        let p = GridProcessor::new(TimeSeriesEngine::new(), Arc::new(ViewportState::new()), config);
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.set_timeframe(250);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!p.is_manual_timeframe_override_active());
        let report = p.update_visible_cells().unwrap();
        // 60s window fits in 600 columns of 100ms
        assert_eq!(report.timeframe_ms, 100);
    }

    #[test]
    fn test_price_resolution_forces_rebuild() {
        let p = make_processor();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);
        p.set_price_resolution(5.0);
        assert_eq!(p.price_resolution(), 5.0);
        let report = p.update_visible_cells().unwrap();
        assert!(report.rebuild);
        // engine buckets were discarded with the old resolution
        assert_eq!(report.total_cells, 0);
    }

    #[test]
    fn test_dense_path_skips_banding() {
        let p = make_processor();
        let book = dense_book_with_spread();
        p.on_dense_book_update(&book, 2);
        assert!(p.viewport().is_valid());
        let snapshot = p.published_snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(p.stats().export()["snapshots_fed"], 1);
    }

    #[test]
    fn test_banded_path_when_dense_disabled() {
        let p = make_processor();
        p.set_dense_ingestion(false);
        p.set_band_mode(BandMode::FixedDollar);
        p.set_band_value(0.5);
        let book = dense_book_with_spread();
        p.on_dense_book_update(&book, 2);
        // band excludes both levels, top-of-book fallback keeps one per side
        let snapshot = p.published_snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(!p.is_dense_ingestion_enabled());
        assert_eq!(p.band_config().mode, BandMode::FixedDollar);
    }

    fn dense_book_with_spread() -> DenseOrderBook {
        use types::market::BookDelta;
        let mut book =
            DenseOrderBook::new(InstrumentId::new("X"), Price::ZERO, Price::from_u64(1), 1000)
                .unwrap();
        book.apply_deltas(
            &[
                BookDelta::new(Side::Buy, Price::from_u64(99), Quantity::from_u64(4)),
                BookDelta::new(Side::Sell, Price::from_u64(101), Quantity::from_u64(6)),
            ],
            T0,
        );
        book
    }

    #[test]
    fn test_clear_data() {
        let p = make_processor();
        let mut events = p.subscribe().unwrap();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);
        p.clear_data();

        assert!(p.published_snapshot().is_none());
        assert_eq!(p.sample_order_book(T0 + 100), 0);
        let mut saw_cleared = false;
        while let Ok(ev) = events.try_recv() {
            saw_cleared |= ev == GridEvent::DataCleared;
        }
        assert!(saw_cleared);

        // engine history survives; the next pass rebuilds from it
        let report = p.update_visible_cells().unwrap();
        assert!(report.rebuild);
        assert!(report.total_cells > 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let p = make_processor();
        let shutdown_rx = p.subscribe_shutdown();
        p.on_order_book(make_book(T0, 99.0, 101.0));
        p.sample_order_book(T0);

        p.shutdown();
        p.shutdown();
        assert!(p.is_shutting_down());
        assert!(*shutdown_rx.borrow());
        assert!(p.subscribe().is_none());
        assert!(p.published_snapshot().is_none());

        p.on_order_book(make_book(T0 + 100, 99.0, 101.0));
        assert_eq!(p.sample_order_book(T0 + 200), 0);
        assert!(p.update_visible_cells().is_none());
    }

    #[test]
    fn test_trade_batch_settings_are_carried() {
        let p = make_processor();
        assert_eq!(p.trade_batch().max_batch_size, 50);
        p.set_trade_batch(TradeBatchConfig {
            interval_ms: 20,
            significance_threshold: 0.01,
            max_batch_size: 10,
        });
        assert_eq!(p.trade_batch().interval_ms, 20);
    }
}
