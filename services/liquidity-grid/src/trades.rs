//! Recent trade history handed to render targets
//!
//! Bounded ring of the most recent trades. When a push takes the buffer
//! past capacity, the oldest `evict_chunk` trades are dropped at once
//! instead of one per push.

use std::collections::VecDeque;

use types::market::Trade;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_EVICT_CHUNK: usize = 100;

#[derive(Debug, Clone)]
pub struct RecentTrades {
    history: VecDeque<Trade>,
    capacity: usize,
    evict_chunk: usize,
}

impl Default for RecentTrades {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_EVICT_CHUNK)
    }
}

impl RecentTrades {
    pub fn new(capacity: usize, evict_chunk: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity + 1),
            capacity,
            evict_chunk: evict_chunk.clamp(1, capacity),
        }
    }

    pub fn push(&mut self, trade: Trade) {
        self.history.push_back(trade);
        if self.history.len() > self.capacity {
            self.history.drain(..self.evict_chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn latest(&self) -> Option<&Trade> {
        self.history.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trade> {
        self.history.iter()
    }

    /// Oldest-first copy for a render frame.
    pub fn to_vec(&self) -> Vec<Trade> {
        self.history.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}
