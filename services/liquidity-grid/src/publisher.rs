//! Snapshot Publisher
//!
//! Single exchange point between the producer and readers. `publish`
//! allocates the new immutable snapshot before taking the slot lock, so the
//! lock only ever guards a pointer swap. Readers get a ref-counted handle
//! and never copy cells; superseded snapshots stay valid for as long as
//! anyone holds them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::cell::{CellInstance, PublishedSnapshot};

#[derive(Debug, Default)]
pub struct SnapshotPublisher {
    slot: Mutex<Option<PublishedSnapshot>>,
    publish_count: AtomicU64,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the published snapshot with a copy of `cells`.
    pub fn publish(&self, cells: &[CellInstance]) -> PublishedSnapshot {
        let snapshot: PublishedSnapshot = Arc::from(cells);
        match self.slot.lock() {
            Ok(mut slot) => {
                *slot = Some(Arc::clone(&snapshot));
                self.publish_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => error!("Publish slot lock poisoned, snapshot dropped"),
        }
        snapshot
    }

    /// Current snapshot, or `None` if nothing was published since the last clear.
    pub fn read_latest(&self) -> Option<PublishedSnapshot> {
        match self.slot.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => {
                error!("Publish slot lock poisoned");
                None
            }
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }
}
