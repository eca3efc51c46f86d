//! Producer task and its handle
//!
//! [`spawn_grid`] moves a [`GridProcessor`] onto a tokio task that owns the
//! live dense book and drives three inputs:
//! - the shutdown watch (checked first)
//! - queued feed events and control commands from any [`GridHandle`]
//! - the fixed-cadence sampler tick
//!
//! Submitting never blocks: a full queue is reported as
//! [`FeedError::QueueFull`] and the caller decides whether to drop.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use types::ids::InstrumentId;
use types::market::{BookDelta, OrderBookSnapshot, Trade};

use crate::cell::PublishedSnapshot;
use crate::dense_book::DenseOrderBook;
use crate::engine::LiquidityEngine;
use crate::processor::{GridEvent, GridProcessor};
use crate::scheduler::SnapshotSource;
use crate::viewport::ViewportState;

/// Raw market input.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Trade(Trade),
    OrderBook(OrderBookSnapshot),
    /// Absolute level updates for the live dense book.
    BookDeltas {
        instrument: InstrumentId,
        timestamp_ms: i64,
        deltas: Vec<BookDelta>,
    },
}

#[derive(Debug, Clone)]
pub enum GridCommand {
    Feed(FeedEvent),
    Recompute,
    SetTimeframe(i64),
    SetPriceResolution(f64),
    ClearData,
    Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("Producer queue is full")]
    QueueFull,

    #[error("Producer has stopped")]
    Closed,
}

impl<T> From<TrySendError<T>> for FeedError {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => FeedError::QueueFull,
            TrySendError::Closed(_) => FeedError::Closed,
        }
    }
}

/// Cloneable submission side of a running producer.
pub struct GridHandle<E: LiquidityEngine> {
    tx: mpsc::Sender<GridCommand>,
    processor: Arc<GridProcessor<E>>,
}

impl<E: LiquidityEngine> Clone for GridHandle<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            processor: Arc::clone(&self.processor),
        }
    }
}

impl<E: LiquidityEngine> GridHandle<E> {
    pub fn processor(&self) -> &Arc<GridProcessor<E>> {
        &self.processor
    }

    pub fn submit(&self, command: GridCommand) -> Result<(), FeedError> {
        if self.processor.is_shutting_down() {
            return Err(FeedError::Closed);
        }
        self.tx.try_send(command).map_err(FeedError::from)
    }

    pub fn send_trade(&self, trade: Trade) -> Result<(), FeedError> {
        self.submit(GridCommand::Feed(FeedEvent::Trade(trade)))
    }

    pub fn send_order_book(&self, book: OrderBookSnapshot) -> Result<(), FeedError> {
        self.submit(GridCommand::Feed(FeedEvent::OrderBook(book)))
    }

    pub fn send_deltas(
        &self,
        instrument: InstrumentId,
        timestamp_ms: i64,
        deltas: Vec<BookDelta>,
    ) -> Result<(), FeedError> {
        self.submit(GridCommand::Feed(FeedEvent::BookDeltas {
            instrument,
            timestamp_ms,
            deltas,
        }))
    }

    /// Stop the producer. Takes effect immediately; queued commands are
    /// discarded.
    pub fn shutdown(&self) {
        self.processor.shutdown();
    }

    fn submit_or_log(&self, command: GridCommand) {
        if let Err(e) = self.submit(command) {
            debug!(error = %e, "Command not queued");
        }
    }
}

impl<E: LiquidityEngine> SnapshotSource for GridHandle<E> {
    fn latest_snapshot(&self) -> Option<PublishedSnapshot> {
        self.processor.published_snapshot()
    }

    fn viewport_state(&self) -> Arc<ViewportState> {
        Arc::clone(self.processor.viewport())
    }

    fn request_recompute(&self) {
        self.submit_or_log(GridCommand::Recompute);
    }

    fn forward_trade(&self, trade: &Trade) {
        self.submit_or_log(GridCommand::Feed(FeedEvent::Trade(trade.clone())));
    }

    fn set_timeframe(&self, timeframe_ms: i64) {
        self.submit_or_log(GridCommand::SetTimeframe(timeframe_ms));
    }

    fn set_price_resolution(&self, resolution: f64) {
        self.submit_or_log(GridCommand::SetPriceResolution(resolution));
    }

    fn clear_data(&self) {
        self.submit_or_log(GridCommand::ClearData);
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<GridEvent>> {
        self.processor.subscribe()
    }
}

/// Start the producer task. `dense_book` is the live book that
/// [`FeedEvent::BookDeltas`] are applied to; without one, deltas are dropped.
pub fn spawn_grid<E>(
    processor: Arc<GridProcessor<E>>,
    dense_book: Option<DenseOrderBook>,
) -> (GridHandle<E>, JoinHandle<()>)
where
    E: LiquidityEngine + 'static,
{
    let capacity = processor.config().command_queue_capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let handle = GridHandle {
        tx,
        processor: Arc::clone(&processor),
    };
    let task = tokio::spawn(run_producer(processor, rx, dense_book));
    (handle, task)
}

async fn run_producer<E: LiquidityEngine>(
    processor: Arc<GridProcessor<E>>,
    mut rx: mpsc::Receiver<GridCommand>,
    mut dense_book: Option<DenseOrderBook>,
) {
    let mut shutdown_rx = processor.subscribe_shutdown();
    let interval_ms = processor.config().sample_interval_ms.max(1) as u64;
    let mut sampler = interval(Duration::from_millis(interval_ms));
    sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_ms, queue_capacity = processor.config().command_queue_capacity, "Grid producer started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            command = rx.recv() => match command {
                Some(command) => {
                    if !handle_command(&processor, dense_book.as_mut(), command) {
                        break;
                    }
                }
                None => {
                    info!("All grid handles dropped");
                    processor.shutdown();
                    break;
                }
            },
            _ = sampler.tick() => {
                processor.sample_order_book(chrono::Utc::now().timestamp_millis());
            }
        }
    }

    info!(stats = ?processor.stats().export(), "Grid producer stopped");
}

/// Returns false once the producer should stop.
fn handle_command<E: LiquidityEngine>(
    processor: &GridProcessor<E>,
    dense_book: Option<&mut DenseOrderBook>,
    command: GridCommand,
) -> bool {
    match command {
        GridCommand::Feed(FeedEvent::Trade(trade)) => processor.on_trade(&trade),
        GridCommand::Feed(FeedEvent::OrderBook(book)) => processor.on_order_book(book),
        GridCommand::Feed(FeedEvent::BookDeltas {
            instrument,
            timestamp_ms,
            deltas,
        }) => match dense_book {
            Some(book) if *book.instrument() == instrument => {
                let applied = book.apply_deltas(&deltas, timestamp_ms);
                if applied < deltas.len() {
                    debug!(
                        applied,
                        dropped = deltas.len() - applied,
                        "Deltas outside the dense book range"
                    );
                }
                processor.on_dense_book_update(book, applied);
            }
            Some(book) => {
                warn!(
                    expected = %book.instrument(),
                    got = %instrument,
                    "Dropping deltas for foreign instrument"
                );
                processor.stats().record_dropped();
            }
            None => {
                debug!(%instrument, "No dense book, dropping deltas");
                processor.stats().record_dropped();
            }
        },
        GridCommand::Recompute => {
            processor.update_visible_cells();
        }
        GridCommand::SetTimeframe(timeframe_ms) => processor.set_timeframe(timeframe_ms),
        GridCommand::SetPriceResolution(resolution) => processor.set_price_resolution(resolution),
        GridCommand::ClearData => processor.clear_data(),
        GridCommand::Shutdown => {
            processor.shutdown();
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TimeSeriesEngine;
    use types::numeric::Price;

    #[test]
    fn test_feed_error_from_try_send() {
        let full: TrySendError<GridCommand> = TrySendError::Full(GridCommand::Recompute);
        let closed: TrySendError<GridCommand> = TrySendError::Closed(GridCommand::Recompute);
        assert_eq!(FeedError::from(full), FeedError::QueueFull);
        assert_eq!(FeedError::from(closed), FeedError::Closed);
    }

    #[test]
    fn test_handle_command_without_dense_book() {
        let processor = GridProcessor::with_defaults(TimeSeriesEngine::new());
        let keep_running = handle_command(
            &processor,
            None,
            GridCommand::Feed(FeedEvent::BookDeltas {
                instrument: InstrumentId::new("X"),
                timestamp_ms: 0,
                deltas: Vec::new(),
            }),
        );
        assert!(keep_running);
        assert_eq!(processor.stats().export()["inputs_dropped"], 1);
    }

    #[test]
    fn test_handle_command_foreign_deltas() {
        let processor = GridProcessor::with_defaults(TimeSeriesEngine::new());
        let mut book =
            DenseOrderBook::new(InstrumentId::new("X"), Price::ZERO, Price::from_u64(1), 10)
                .unwrap();
        handle_command(
            &processor,
            Some(&mut book),
            GridCommand::Feed(FeedEvent::BookDeltas {
                instrument: InstrumentId::new("Y"),
                timestamp_ms: 0,
                deltas: Vec::new(),
            }),
        );
        assert_eq!(processor.stats().export()["inputs_dropped"], 1);
    }

    #[test]
    fn test_shutdown_command_stops() {
        let processor = GridProcessor::with_defaults(TimeSeriesEngine::new());
        assert!(!handle_command(&processor, None, GridCommand::Shutdown));
        assert!(processor.is_shutting_down());
    }
}
