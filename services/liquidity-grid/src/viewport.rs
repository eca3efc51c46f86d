//! Viewport state shared by the producer and the consumer
//!
//! - `Viewport`: plain value (time window, price window, pixel size)
//! - `ViewportState`: the shared, versioned owner of the current viewport
//! - `GridResolution`: grid-line step selection for a viewport
//!
//! Every mutation of the time or price bounds increments the version counter
//! exactly once, whether it came from user interaction or from auto-fit.
//! The processor compares versions, never bounds, to decide on a rebuild.
//! Pixel size and the pan visual offset are presentation-only and do not
//! touch the version.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Fraction of the visible span moved by a discrete pan step.
pub const PAN_STEP_FRACTION: f64 = 0.1;

/// Zoom delta applied per wheel notch (120 angle units).
pub const WHEEL_ZOOM_STEP: f64 = 0.1;

const WHEEL_NOTCH: f64 = 120.0;
const MIN_TIME_SPAN_MS: i64 = 1;
const MIN_PRICE_SPAN: f64 = 1e-9;

/// Visible time window (ms), price window, and pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub time_start_ms: i64,
    pub time_end_ms: i64,
    pub price_min: f64,
    pub price_max: f64,
    pub width_px: f64,
    pub height_px: f64,
}

impl Viewport {
    pub fn new(time_start_ms: i64, time_end_ms: i64, price_min: f64, price_max: f64) -> Self {
        Self {
            time_start_ms,
            time_end_ms,
            price_min,
            price_max,
            width_px: 0.0,
            height_px: 0.0,
        }
    }

    /// A viewport suppresses all aggregation until this holds.
    pub fn is_valid(&self) -> bool {
        self.time_end_ms > self.time_start_ms
            && self.price_min.is_finite()
            && self.price_max.is_finite()
            && self.price_max > self.price_min
    }

    pub fn time_span_ms(&self) -> i64 {
        self.time_end_ms - self.time_start_ms
    }

    pub fn price_span(&self) -> f64 {
        self.price_max - self.price_min
    }

    pub fn contains_price(&self, price: f64) -> bool {
        price >= self.price_min && price <= self.price_max
    }

    pub fn has_pixels(&self) -> bool {
        self.width_px > 0.0 && self.height_px > 0.0
    }

    /// Map a world point to pixels. Price grows upwards.
    pub fn world_to_screen(&self, timestamp_ms: i64, price: f64) -> (f64, f64) {
        if !self.is_valid() || !self.has_pixels() {
            return (0.0, 0.0);
        }
        let x = (timestamp_ms - self.time_start_ms) as f64 / self.time_span_ms() as f64
            * self.width_px;
        let y = self.height_px - (price - self.price_min) / self.price_span() * self.height_px;
        (x, y)
    }

    /// Inverse of [`Viewport::world_to_screen`].
    pub fn screen_to_world(&self, x: f64, y: f64) -> (i64, f64) {
        if !self.is_valid() || !self.has_pixels() {
            return (self.time_start_ms, self.price_min);
        }
        let t = self.time_start_ms as f64 + x / self.width_px * self.time_span_ms() as f64;
        let p = self.price_min + (self.height_px - y) / self.height_px * self.price_span();
        (t.round() as i64, p)
    }
}

#[derive(Debug, Default)]
struct Inner {
    viewport: Viewport,
    /// Bounds restored by `reset_zoom`; set on first initialization.
    home: Option<Viewport>,
    pan_anchor: Option<(f64, f64)>,
    pan_offset: (f64, f64),
}

/// Shared, versioned viewport.
#[derive(Debug)]
pub struct ViewportState {
    inner: Mutex<Inner>,
    version: AtomicU64,
    auto_scroll: AtomicBool,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewportState {
    /// Uninitialized (invalid) viewport with auto-scroll enabled.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            version: AtomicU64::new(0),
            auto_scroll: AtomicBool::new(true),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, Inner>> {
        match self.inner.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                error!("Viewport lock poisoned");
                None
            }
        }
    }

    /// Must be called with the inner lock held so version and bounds agree.
    fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> Viewport {
        self.lock().map(|g| g.viewport).unwrap_or_default()
    }

    /// Viewport together with the version it was read at.
    pub fn snapshot(&self) -> (Viewport, u64) {
        match self.lock() {
            Some(g) => (g.viewport, self.version.load(Ordering::SeqCst)),
            None => (Viewport::default(), self.version.load(Ordering::SeqCst)),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_valid(&self) -> bool {
        self.current().is_valid()
    }

    /// Replace the bounds. Invalid bounds are ignored.
    pub fn set_viewport(
        &self,
        time_start_ms: i64,
        time_end_ms: i64,
        price_min: f64,
        price_max: f64,
    ) -> bool {
        let Some(mut g) = self.lock() else {
            return false;
        };
        let next = Viewport {
            time_start_ms,
            time_end_ms,
            price_min,
            price_max,
            ..g.viewport
        };
        if !next.is_valid() {
            debug!(time_start_ms, time_end_ms, price_min, price_max, "Ignoring invalid viewport");
            return false;
        }
        g.viewport = next;
        if g.home.is_none() {
            g.home = Some(next);
        }
        self.bump();
        true
    }

    /// One-time transition from invalid to valid. Returns false if the
    /// viewport was already valid or the bounds are invalid.
    pub fn initialize(
        &self,
        time_start_ms: i64,
        time_end_ms: i64,
        price_min: f64,
        price_max: f64,
    ) -> bool {
        let Some(mut g) = self.lock() else {
            return false;
        };
        if g.viewport.is_valid() {
            return false;
        }
        let next = Viewport {
            time_start_ms,
            time_end_ms,
            price_min,
            price_max,
            ..g.viewport
        };
        if !next.is_valid() {
            return false;
        }
        g.viewport = next;
        g.home = Some(next);
        self.bump();
        true
    }

    /// Move the time window, keeping the price window. Returns the new version.
    pub fn set_time_window(&self, time_start_ms: i64, time_end_ms: i64) -> Option<u64> {
        let mut g = self.lock()?;
        if time_end_ms <= time_start_ms || !g.viewport.is_valid() {
            return None;
        }
        g.viewport.time_start_ms = time_start_ms;
        g.viewport.time_end_ms = time_end_ms;
        Some(self.bump())
    }

    /// Pixel size only; does not change the version.
    pub fn set_size(&self, width_px: f64, height_px: f64) {
        if let Some(mut g) = self.lock() {
            g.viewport.width_px = width_px.max(0.0);
            g.viewport.height_px = height_px.max(0.0);
        }
    }

    /// Zoom around a pixel anchor. Positive `delta` zooms in (0.1 = 10%).
    pub fn zoom(&self, delta: f64, anchor_x: f64, anchor_y: f64) -> bool {
        let Some(mut g) = self.lock() else {
            return false;
        };
        let vp = g.viewport;
        if !vp.is_valid() || !delta.is_finite() {
            return false;
        }
        let factor = (1.0 - delta).clamp(0.1, 10.0);
        let (anchor_t, anchor_p) = if vp.has_pixels() {
            vp.screen_to_world(anchor_x, anchor_y)
        } else {
            (
                vp.time_start_ms + vp.time_span_ms() / 2,
                (vp.price_min + vp.price_max) / 2.0,
            )
        };

        let left = (anchor_t - vp.time_start_ms) as f64 * factor;
        let right = (vp.time_end_ms - anchor_t) as f64 * factor;
        let mut start = anchor_t - left.round() as i64;
        let mut end = anchor_t + right.round() as i64;
        if end - start < MIN_TIME_SPAN_MS {
            start = anchor_t;
            end = anchor_t + MIN_TIME_SPAN_MS;
        }

        let below = (anchor_p - vp.price_min) * factor;
        let above = (vp.price_max - anchor_p) * factor;
        let (mut pmin, mut pmax) = (anchor_p - below, anchor_p + above);
        if pmax - pmin < MIN_PRICE_SPAN {
            pmin = anchor_p - MIN_PRICE_SPAN;
            pmax = anchor_p + MIN_PRICE_SPAN;
        }

        g.viewport.time_start_ms = start;
        g.viewport.time_end_ms = end;
        g.viewport.price_min = pmin;
        g.viewport.price_max = pmax;
        self.bump();
        true
    }

    /// Wheel zoom: `angle_delta` in wheel units (120 per notch).
    pub fn wheel_zoom(&self, angle_delta: f64, anchor_x: f64, anchor_y: f64) -> bool {
        let delta = (angle_delta / WHEEL_NOTCH * WHEEL_ZOOM_STEP).clamp(-0.5, 0.5);
        if delta == 0.0 {
            return false;
        }
        self.zoom(delta, anchor_x, anchor_y)
    }

    fn shift(&self, time_fraction: f64, price_fraction: f64) -> bool {
        let Some(mut g) = self.lock() else {
            return false;
        };
        if !g.viewport.is_valid() {
            return false;
        }
        let dt = (g.viewport.time_span_ms() as f64 * time_fraction).round() as i64;
        let dp = g.viewport.price_span() * price_fraction;
        g.viewport.time_start_ms += dt;
        g.viewport.time_end_ms += dt;
        g.viewport.price_min += dp;
        g.viewport.price_max += dp;
        self.auto_scroll.store(false, Ordering::SeqCst);
        self.bump();
        true
    }

    pub fn pan_left(&self) -> bool {
        self.shift(-PAN_STEP_FRACTION, 0.0)
    }

    pub fn pan_right(&self) -> bool {
        self.shift(PAN_STEP_FRACTION, 0.0)
    }

    pub fn pan_up(&self) -> bool {
        self.shift(0.0, PAN_STEP_FRACTION)
    }

    pub fn pan_down(&self) -> bool {
        self.shift(0.0, -PAN_STEP_FRACTION)
    }

    /// Start an interactive drag at pixel `(x, y)`.
    pub fn begin_pan(&self, x: f64, y: f64) {
        if let Some(mut g) = self.lock() {
            g.pan_anchor = Some((x, y));
            g.pan_offset = (0.0, 0.0);
        }
    }

    /// Update the visual offset of a drag. Bounds are untouched until `end_pan`.
    pub fn move_pan(&self, x: f64, y: f64) {
        if let Some(mut g) = self.lock() {
            if let Some((ax, ay)) = g.pan_anchor {
                g.pan_offset = (x - ax, y - ay);
            }
        }
    }

    /// Commit a drag: translate the bounds by the dragged distance and bump
    /// the version. The visual offset stays until the next data refresh
    /// clears it, so content does not snap back while cells are recomputed.
    pub fn end_pan(&self) -> bool {
        let Some(mut g) = self.lock() else {
            return false;
        };
        if g.pan_anchor.take().is_none() {
            return false;
        }
        let vp = g.viewport;
        let (dx, dy) = g.pan_offset;
        if !vp.is_valid() || !vp.has_pixels() || (dx == 0.0 && dy == 0.0) {
            return false;
        }
        let dt = (-dx / vp.width_px * vp.time_span_ms() as f64).round() as i64;
        let dp = dy / vp.height_px * vp.price_span();
        g.viewport.time_start_ms += dt;
        g.viewport.time_end_ms += dt;
        g.viewport.price_min += dp;
        g.viewport.price_max += dp;
        self.auto_scroll.store(false, Ordering::SeqCst);
        let version = self.bump();
        debug!(dt_ms = dt, dp, version, "Pan committed");
        true
    }

    pub fn pan_visual_offset(&self) -> (f64, f64) {
        self.lock().map(|g| g.pan_offset).unwrap_or((0.0, 0.0))
    }

    pub fn clear_pan_visual_offset(&self) {
        if let Some(mut g) = self.lock() {
            g.pan_offset = (0.0, 0.0);
        }
    }

    /// Restore the bounds captured at initialization and resume auto-scroll.
    pub fn reset_zoom(&self) -> bool {
        let Some(mut g) = self.lock() else {
            return false;
        };
        let Some(home) = g.home else {
            return false;
        };
        g.viewport = Viewport {
            width_px: g.viewport.width_px,
            height_px: g.viewport.height_px,
            ..home
        };
        g.pan_offset = (0.0, 0.0);
        self.auto_scroll.store(true, Ordering::SeqCst);
        self.bump();
        true
    }

    pub fn set_auto_scroll(&self, enabled: bool) {
        self.auto_scroll.store(enabled, Ordering::SeqCst);
    }

    pub fn is_auto_scroll_enabled(&self) -> bool {
        self.auto_scroll.load(Ordering::SeqCst)
    }
}

/// Grid-line spacing for a viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridResolution {
    pub time_step_ms: i64,
    pub price_step: f64,
}

impl GridResolution {
    /// Pick 1/2/5×10ⁿ steps giving roughly the requested number of lines.
    pub fn optimal(viewport: &Viewport, vertical_lines: u32, horizontal_lines: u32) -> Option<Self> {
        if !viewport.is_valid() || vertical_lines == 0 || horizontal_lines == 0 {
            return None;
        }
        let time_step = nice_step(viewport.time_span_ms() as f64 / vertical_lines as f64);
        let price_step = nice_step(viewport.price_span() / horizontal_lines as f64);
        Some(Self {
            time_step_ms: (time_step.round() as i64).max(1),
            price_step,
        })
    }
}

fn nice_step(raw: f64) -> f64 {
    if !(raw.is_finite() && raw > 0.0) {
        return 1.0;
    }
    let magnitude = 10f64.powf(raw.log10().floor());
    let residual = raw / magnitude;
    let nice = if residual <= 1.0 {
        1.0
    } else if residual <= 2.0 {
        2.0
    } else if residual <= 5.0 {
        5.0
    } else {
        10.0
    };
    nice * magnitude
}
