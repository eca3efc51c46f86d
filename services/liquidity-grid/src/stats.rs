//! Processor counters
//!
//! Plain relaxed atomics, readable from any thread without touching the
//! producer lock. Exported as a name → value map for log lines and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ProcessorStats {
    pub snapshots_fed: AtomicU64,
    pub carried_forward: AtomicU64,
    pub passes: AtomicU64,
    pub rebuilds: AtomicU64,
    pub cells_appended: AtomicU64,
    pub publishes: AtomicU64,
    pub publishes_skipped: AtomicU64,
    pub auto_fits: AtomicU64,
    pub inputs_dropped: AtomicU64,
    pub trades_received: AtomicU64,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn inc(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// A snapshot reached the engine; `carried` marks a gap fill.
    pub fn record_snapshot_fed(&self, carried: bool) {
        Self::inc(&self.snapshots_fed, 1);
        if carried {
            Self::inc(&self.carried_forward, 1);
        }
    }

    pub fn record_pass(&self, rebuild: bool, appended: usize) {
        Self::inc(&self.passes, 1);
        if rebuild {
            Self::inc(&self.rebuilds, 1);
        }
        Self::inc(&self.cells_appended, appended as u64);
    }

    pub fn record_publish(&self, published: bool) {
        if published {
            Self::inc(&self.publishes, 1);
        } else {
            Self::inc(&self.publishes_skipped, 1);
        }
    }

    pub fn record_auto_fit(&self) {
        Self::inc(&self.auto_fits, 1);
    }

    pub fn record_dropped(&self) {
        Self::inc(&self.inputs_dropped, 1);
    }

    pub fn record_trade(&self) {
        Self::inc(&self.trades_received, 1);
    }

    pub fn export(&self) -> BTreeMap<&'static str, u64> {
        let mut m = BTreeMap::new();
        m.insert("snapshots_fed", self.snapshots_fed.load(Ordering::Relaxed));
        m.insert("carried_forward", self.carried_forward.load(Ordering::Relaxed));
        m.insert("passes", self.passes.load(Ordering::Relaxed));
        m.insert("rebuilds", self.rebuilds.load(Ordering::Relaxed));
        m.insert("cells_appended", self.cells_appended.load(Ordering::Relaxed));
        m.insert("publishes", self.publishes.load(Ordering::Relaxed));
        m.insert("publishes_skipped", self.publishes_skipped.load(Ordering::Relaxed));
        m.insert("auto_fits", self.auto_fits.load(Ordering::Relaxed));
        m.insert("inputs_dropped", self.inputs_dropped.load(Ordering::Relaxed));
        m.insert("trades_received", self.trades_received.load(Ordering::Relaxed));
        m
    }
}
