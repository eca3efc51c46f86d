//! Dirty-Flag Update Scheduler
//!
//! Consumer side of the grid. Interaction and producer notifications raise
//! one of four flags; each refresh cycle takes them in a fixed order:
//!
//! ```text
//! geometry ──► full rebuild from the latest snapshot (consumes append/material)
//! append   ──► refresh content from the latest snapshot
//! material ──► re-derive appearance only
//! transform ─► reposition existing content by the pan offset
//! ```
//!
//! Render strategies sit behind [`RenderTarget`]; the producer sits behind
//! [`SnapshotSource`], so the same scheduler drives an in-process
//! [`GridProcessor`] or a queued [`crate::runtime::GridHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};
use types::market::Trade;

use crate::cell::PublishedSnapshot;
use crate::engine::LiquidityEngine;
use crate::processor::{GridEvent, GridProcessor};
use crate::trades::RecentTrades;
use crate::viewport::{Viewport, ViewportState};

/// What a content update changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentChange {
    Rebuild,
    Append,
    Material,
}

/// Everything a render strategy may read for one content update.
#[derive(Debug, Clone)]
pub struct FrameContext<'a> {
    pub cells: Option<PublishedSnapshot>,
    pub recent_trades: &'a RecentTrades,
    pub viewport: Viewport,
    pub display: &'a DisplayConfig,
}

impl FrameContext<'_> {
    pub fn cell_count(&self) -> usize {
        self.cells.as_ref().map_or(0, |c| c.len())
    }
}

/// Rendering boundary. Implementations own their scene graph.
pub trait RenderTarget {
    fn update_content(&mut self, frame: &FrameContext<'_>, change: ContentChange);

    /// Pure positional offset in pixels; never touches content.
    fn update_transform(&mut self, dx: f64, dy: f64);
}

/// Producer as seen from the consumer.
pub trait SnapshotSource {
    fn latest_snapshot(&self) -> Option<PublishedSnapshot>;
    fn viewport_state(&self) -> Arc<ViewportState>;
    /// Ask the producer for a visible-cell pass. Never blocks.
    fn request_recompute(&self);
    fn forward_trade(&self, trade: &Trade);
    fn set_timeframe(&self, timeframe_ms: i64);
    fn set_price_resolution(&self, resolution: f64);
    fn clear_data(&self);
    fn subscribe(&self) -> Option<broadcast::Receiver<GridEvent>>;
}

impl<E: LiquidityEngine> SnapshotSource for Arc<GridProcessor<E>> {
    fn latest_snapshot(&self) -> Option<PublishedSnapshot> {
        self.published_snapshot()
    }

    fn viewport_state(&self) -> Arc<ViewportState> {
        Arc::clone(self.viewport())
    }

    fn request_recompute(&self) {
        self.update_visible_cells();
    }

    fn forward_trade(&self, trade: &Trade) {
        self.on_trade(trade);
    }

    fn set_timeframe(&self, timeframe_ms: i64) {
        GridProcessor::set_timeframe(self, timeframe_ms);
    }

    fn set_price_resolution(&self, resolution: f64) {
        GridProcessor::set_price_resolution(self, resolution);
    }

    fn clear_data(&self) {
        GridProcessor::clear_data(self);
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<GridEvent>> {
        GridProcessor::subscribe(self)
    }
}

/// The four work classes, shareable with other threads that need to
/// request a repaint.
#[derive(Debug, Default)]
pub struct DirtyFlags {
    geometry: AtomicBool,
    append: AtomicBool,
    material: AtomicBool,
    transform: AtomicBool,
}

impl DirtyFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_geometry(&self) {
        self.geometry.store(true, Ordering::SeqCst);
    }

    pub fn mark_append(&self) {
        self.append.store(true, Ordering::SeqCst);
    }

    pub fn mark_material(&self) {
        self.material.store(true, Ordering::SeqCst);
    }

    pub fn mark_transform(&self) {
        self.transform.store(true, Ordering::SeqCst);
    }

    fn take_geometry(&self) -> bool {
        self.geometry.swap(false, Ordering::SeqCst)
    }

    fn take_append(&self) -> bool {
        self.append.swap(false, Ordering::SeqCst)
    }

    fn take_material(&self) -> bool {
        self.material.swap(false, Ordering::SeqCst)
    }

    fn take_transform(&self) -> bool {
        self.transform.swap(false, Ordering::SeqCst)
    }

    pub fn is_clean(&self) -> bool {
        !(self.geometry.load(Ordering::SeqCst)
            || self.append.load(Ordering::SeqCst)
            || self.material.load(Ordering::SeqCst)
            || self.transform.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    LiquidityHeatmap,
    TradeFlow,
    TradeBubbles,
    VolumeCandles,
    OrderBookDepth,
}

/// Preset pairs of price resolution and timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridMode {
    Fine,
    Standard,
    Coarse,
}

impl GridMode {
    pub fn from_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(GridMode::Fine),
            1 => Some(GridMode::Standard),
            2 => Some(GridMode::Coarse),
            _ => None,
        }
    }

    pub fn price_resolution(&self) -> f64 {
        match self {
            GridMode::Fine => 2.5,
            GridMode::Standard => 5.0,
            GridMode::Coarse => 10.0,
        }
    }

    pub fn timeframe_ms(&self) -> i64 {
        match self {
            GridMode::Fine => 50,
            GridMode::Standard => 100,
            GridMode::Coarse => 250,
        }
    }
}

/// Consumer-side visual parameters handed to render targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub render_mode: RenderMode,
    pub intensity_scale: f64,
    pub min_volume_filter: f64,
    pub max_cells: usize,
    pub min_bubble_radius: f64,
    pub max_bubble_radius: f64,
    pub bubble_opacity: f64,
    pub show_heatmap: bool,
    pub show_trade_bubbles: bool,
    pub show_trade_flow: bool,
    pub show_volume_profile: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            render_mode: RenderMode::LiquidityHeatmap,
            intensity_scale: 1.0,
            min_volume_filter: 0.0,
            max_cells: 100_000,
            min_bubble_radius: 2.0,
            max_bubble_radius: 20.0,
            bubble_opacity: 0.7,
            show_heatmap: true,
            show_trade_bubbles: true,
            show_trade_flow: false,
            show_volume_profile: false,
        }
    }
}

/// What one refresh cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub content: Vec<ContentChange>,
    pub transform: Option<(f64, f64)>,
    pub cell_count: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.content.is_empty() && self.transform.is_none()
    }
}

pub struct UpdateScheduler<S: SnapshotSource> {
    source: S,
    viewport: Arc<ViewportState>,
    flags: Arc<DirtyFlags>,
    display: DisplayConfig,
    recent_trades: RecentTrades,
    events: Option<broadcast::Receiver<GridEvent>>,
    pan_sync_pending: bool,
    first_cycle: bool,
    cycles: u64,
}

impl<S: SnapshotSource> UpdateScheduler<S> {
    pub fn new(source: S, recent_trades: RecentTrades) -> Self {
        let viewport = source.viewport_state();
        let events = source.subscribe();
        Self {
            source,
            viewport,
            flags: Arc::new(DirtyFlags::new()),
            display: DisplayConfig::default(),
            recent_trades,
            events,
            pan_sync_pending: false,
            first_cycle: true,
            cycles: 0,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn flags(&self) -> Arc<DirtyFlags> {
        Arc::clone(&self.flags)
    }

    pub fn display(&self) -> &DisplayConfig {
        &self.display
    }

    pub fn recent_trades(&self) -> &RecentTrades {
        &self.recent_trades
    }

    pub fn is_pan_sync_pending(&self) -> bool {
        self.pan_sync_pending
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    // --- producer notifications ---

    pub fn handle_event(&mut self, event: GridEvent) {
        match event {
            GridEvent::SnapshotPublished { cells } => {
                if self.pan_sync_pending {
                    self.viewport.clear_pan_visual_offset();
                    self.pan_sync_pending = false;
                    self.flags.mark_transform();
                }
                debug!(cells, "Snapshot published");
                self.flags.mark_append();
            }
            GridEvent::ViewportInitialized { version } => {
                debug!(version, "Viewport initialized by producer");
                self.flags.mark_transform();
                self.source.request_recompute();
            }
            GridEvent::DataCleared => self.flags.mark_geometry(),
        }
    }

    /// Drain pending notifications without blocking. Returns how many were
    /// handled.
    pub fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let Some(rx) = self.events.as_mut() else {
                return handled;
            };
            match rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) => return handled,
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Consumer lagged behind producer events, forcing rebuild");
                    self.flags.mark_geometry();
                }
                Err(TryRecvError::Closed) => {
                    info!("Producer event stream closed");
                    self.events = None;
                    return handled;
                }
            }
        }
    }

    /// Take the current receiver, e.g. to await it from an async loop.
    pub fn take_events(&mut self) -> Option<broadcast::Receiver<GridEvent>> {
        self.events.take()
    }

    // --- data ---

    pub fn on_trade(&mut self, trade: Trade) {
        self.source.forward_trade(&trade);
        self.recent_trades.push(trade);
    }

    pub fn set_timeframe(&mut self, timeframe_ms: i64) {
        if timeframe_ms <= 0 {
            return;
        }
        self.source.set_timeframe(timeframe_ms);
        self.source.request_recompute();
        self.flags.mark_geometry();
    }

    pub fn set_price_resolution(&mut self, resolution: f64) {
        if !(resolution.is_finite() && resolution > 0.0) {
            return;
        }
        self.source.set_price_resolution(resolution);
        self.source.request_recompute();
        self.flags.mark_geometry();
    }

    pub fn set_grid_mode(&mut self, mode: GridMode) {
        info!(?mode, "Grid mode preset");
        self.source.set_price_resolution(mode.price_resolution());
        self.source.set_timeframe(mode.timeframe_ms());
        self.source.request_recompute();
        self.flags.mark_geometry();
    }

    pub fn clear_data(&mut self) {
        self.recent_trades.clear();
        self.source.clear_data();
        self.source.request_recompute();
        self.flags.mark_geometry();
    }

    // --- display parameters ---

    pub fn set_render_mode(&mut self, mode: RenderMode) {
        if self.display.render_mode != mode {
            self.display.render_mode = mode;
            self.flags.mark_geometry();
        }
    }

    pub fn set_show_heatmap(&mut self, show: bool) {
        if self.display.show_heatmap != show {
            self.display.show_heatmap = show;
            self.flags.mark_geometry();
        }
    }

    pub fn set_show_trade_bubbles(&mut self, show: bool) {
        if self.display.show_trade_bubbles != show {
            self.display.show_trade_bubbles = show;
            self.flags.mark_geometry();
        }
    }

    pub fn set_show_trade_flow(&mut self, show: bool) {
        if self.display.show_trade_flow != show {
            self.display.show_trade_flow = show;
            self.flags.mark_geometry();
        }
    }

    pub fn set_show_volume_profile(&mut self, show: bool) {
        if self.display.show_volume_profile != show {
            self.display.show_volume_profile = show;
            self.flags.mark_material();
        }
    }

    pub fn set_intensity_scale(&mut self, scale: f64) {
        if scale.is_finite() && scale > 0.0 && self.display.intensity_scale != scale {
            self.display.intensity_scale = scale;
            self.flags.mark_material();
        }
    }

    pub fn set_min_volume_filter(&mut self, min_volume: f64) {
        if min_volume.is_finite() && min_volume >= 0.0 && self.display.min_volume_filter != min_volume {
            self.display.min_volume_filter = min_volume;
            self.flags.mark_material();
        }
    }

    /// Read by render targets on the next content update.
    pub fn set_max_cells(&mut self, max_cells: usize) {
        self.display.max_cells = max_cells;
    }

    pub fn set_bubble_radius(&mut self, min_radius: f64, max_radius: f64) {
        if min_radius > 0.0 && max_radius >= min_radius {
            self.display.min_bubble_radius = min_radius;
            self.display.max_bubble_radius = max_radius;
            self.flags.mark_material();
        }
    }

    pub fn set_bubble_opacity(&mut self, opacity: f64) {
        let opacity = opacity.clamp(0.0, 1.0);
        if self.display.bubble_opacity != opacity {
            self.display.bubble_opacity = opacity;
            self.flags.mark_material();
        }
    }

    // --- viewport interaction ---

    fn viewport_moved(&self) {
        self.flags.mark_transform();
        self.source.request_recompute();
    }

    pub fn set_viewport(&mut self, time_start_ms: i64, time_end_ms: i64, price_min: f64, price_max: f64) {
        if self
            .viewport
            .set_viewport(time_start_ms, time_end_ms, price_min, price_max)
        {
            self.viewport_moved();
        }
    }

    pub fn set_size(&mut self, width_px: f64, height_px: f64) {
        self.viewport.set_size(width_px, height_px);
        self.flags.mark_transform();
    }

    pub fn zoom(&mut self, delta: f64, anchor_x: f64, anchor_y: f64) {
        if self.viewport.zoom(delta, anchor_x, anchor_y) {
            self.flags.mark_append();
            self.viewport_moved();
        }
    }

    pub fn zoom_in(&mut self) {
        let (x, y) = self.viewport_center_px();
        self.zoom(0.1, x, y);
    }

    pub fn zoom_out(&mut self) {
        let (x, y) = self.viewport_center_px();
        self.zoom(-0.1, x, y);
    }

    pub fn wheel_zoom(&mut self, angle_delta: f64, anchor_x: f64, anchor_y: f64) {
        if self.viewport.wheel_zoom(angle_delta, anchor_x, anchor_y) {
            self.flags.mark_append();
            self.viewport_moved();
        }
    }

    fn viewport_center_px(&self) -> (f64, f64) {
        let vp = self.viewport.current();
        (vp.width_px / 2.0, vp.height_px / 2.0)
    }

    pub fn reset_zoom(&mut self) {
        if self.viewport.reset_zoom() {
            self.viewport_moved();
        }
    }

    pub fn pan_left(&mut self) {
        if self.viewport.pan_left() {
            self.viewport_moved();
        }
    }

    pub fn pan_right(&mut self) {
        if self.viewport.pan_right() {
            self.viewport_moved();
        }
    }

    pub fn pan_up(&mut self) {
        if self.viewport.pan_up() {
            self.viewport_moved();
        }
    }

    pub fn pan_down(&mut self) {
        if self.viewport.pan_down() {
            self.viewport_moved();
        }
    }

    pub fn set_auto_scroll(&mut self, enabled: bool) {
        self.viewport.set_auto_scroll(enabled);
        if enabled {
            self.source.request_recompute();
        }
    }

    pub fn begin_pan(&mut self, x: f64, y: f64) {
        self.viewport.begin_pan(x, y);
    }

    pub fn move_pan(&mut self, x: f64, y: f64) {
        self.viewport.move_pan(x, y);
        self.flags.mark_transform();
    }

    /// Commit the drag. The visual offset is held until the producer
    /// publishes cells for the new window.
    pub fn end_pan(&mut self) {
        if self.viewport.end_pan() {
            self.pan_sync_pending = true;
            self.viewport_moved();
        } else {
            self.viewport.clear_pan_visual_offset();
            self.flags.mark_transform();
        }
    }

    // --- refresh cycle ---

    /// Run one consumer cycle against `target`.
    ///
    /// Does nothing until the viewport has a pixel size; flags stay pending.
    pub fn run_cycle<R: RenderTarget>(&mut self, target: &mut R) -> CycleReport {
        let mut report = CycleReport::default();
        let viewport = self.viewport.current();
        if !viewport.has_pixels() {
            return report;
        }
        let first = std::mem::replace(&mut self.first_cycle, false);
        self.cycles += 1;

        let geometry = self.flags.take_geometry() || first;
        let (append, material) = if geometry {
            // a rebuild already reflects both
            self.flags.take_append();
            self.flags.take_material();
            (false, false)
        } else {
            (self.flags.take_append(), self.flags.take_material())
        };

        let mut content = |change: ContentChange, report: &mut CycleReport| {
            let frame = FrameContext {
                cells: self.source.latest_snapshot(),
                recent_trades: &self.recent_trades,
                viewport,
                display: &self.display,
            };
            report.cell_count = frame.cell_count();
            target.update_content(&frame, change);
            report.content.push(change);
        };

        if geometry {
            content(ContentChange::Rebuild, &mut report);
        } else if append {
            content(ContentChange::Append, &mut report);
        }
        if material {
            content(ContentChange::Material, &mut report);
        }

        if self.flags.take_transform() || first {
            let (dx, dy) = self.viewport.pan_visual_offset();
            target.update_transform(dx, dy);
            report.transform = Some((dx, dy));
        }

        if !report.is_idle() {
            debug!(
                cycle = self.cycles,
                content = ?report.content,
                transform = report.transform.is_some(),
                cells = report.cell_count,
                "Refresh cycle"
            );
        }
        report
    }
}
