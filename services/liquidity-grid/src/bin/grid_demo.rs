//! Synthetic feed driving the grid end to end.
//!
//! Usage: `grid-demo [config.json] [seconds]`
//!
//! A random-walk book is streamed as deltas into the producer task while a
//! ~60 Hz consumer loop runs the scheduler against a logging render target.

use std::sync::Arc;

use anyhow::{Context, Result};
use liquidity_grid::config::GridConfig;
use liquidity_grid::dense_book::DenseOrderBook;
use liquidity_grid::runtime::{spawn_grid, GridHandle};
use liquidity_grid::scheduler::{ContentChange, FrameContext, RenderTarget, UpdateScheduler};
use liquidity_grid::trades::RecentTrades;
use liquidity_grid::{GridProcessor, TimeSeriesEngine, ViewportState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration};
use tracing::{info, warn};
use types::ids::InstrumentId;
use types::market::{BookDelta, Side, Trade};
use types::numeric::{Price, Quantity};

const CENTER_TICKS: i64 = 100_000;
const TICK: &str = "0.5";
const BOOK_LEVELS: usize = 8000;
const QUOTED_LEVELS: i64 = 25;

#[derive(Default)]
struct LogTarget {
    rebuilds: u64,
    appends: u64,
    materials: u64,
    transforms: u64,
    last_cells: usize,
}

impl RenderTarget for LogTarget {
    fn update_content(&mut self, frame: &FrameContext<'_>, change: ContentChange) {
        match change {
            ContentChange::Rebuild => self.rebuilds += 1,
            ContentChange::Append => self.appends += 1,
            ContentChange::Material => self.materials += 1,
        }
        let cells = frame.cell_count();
        if cells != self.last_cells {
            info!(
                ?change,
                cells,
                trades = frame.recent_trades.len(),
                time_start_ms = frame.viewport.time_start_ms,
                time_end_ms = frame.viewport.time_end_ms,
                "Frame content"
            );
            self.last_cells = cells;
        }
    }

    fn update_transform(&mut self, _dx: f64, _dy: f64) {
        self.transforms += 1;
    }
}

fn tick_price(ticks: i64) -> Result<Price> {
    Ok(Price::try_new(Decimal::new(ticks * 5, 1))?)
}

fn quantity(rng: &mut StdRng) -> Result<Quantity> {
    Ok(Quantity::try_new(Decimal::new(rng.gen_range(1..500), 2))?)
}

/// Random-walk quotes around a drifting mid. Prints go to `trades_tx` so
/// the consumer records them before forwarding.
async fn run_feed(
    handle: GridHandle<TimeSeriesEngine>,
    instrument: InstrumentId,
    trades_tx: mpsc::Sender<Trade>,
) -> Result<()> {
    let mut rng = StdRng::from_entropy();
    let mut mid = CENTER_TICKS;
    let mut ticker = interval(Duration::from_millis(20));

    loop {
        ticker.tick().await;
        let prev_mid = mid;
        mid += rng.gen_range(-2..=2);
        let now = chrono::Utc::now().timestamp_millis();

        let mut deltas = Vec::with_capacity(QUOTED_LEVELS as usize * 4);
        // withdraw the previous quotes, then post the new ones
        for k in 1..=QUOTED_LEVELS {
            deltas.push(BookDelta::new(Side::Buy, tick_price(prev_mid - k)?, Quantity::ZERO));
            deltas.push(BookDelta::new(Side::Sell, tick_price(prev_mid + k)?, Quantity::ZERO));
        }
        for k in 1..=QUOTED_LEVELS {
            deltas.push(BookDelta::new(Side::Buy, tick_price(mid - k)?, quantity(&mut rng)?));
            deltas.push(BookDelta::new(Side::Sell, tick_price(mid + k)?, quantity(&mut rng)?));
        }

        if let Err(e) = handle.send_deltas(instrument.clone(), now, deltas) {
            warn!(error = %e, "Feed stopped");
            return Ok(());
        }

        if rng.gen_bool(0.2) {
            let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
            let px = match side {
                Side::Buy => mid + 1,
                Side::Sell => mid - 1,
            };
            let trade = Trade::new(instrument.clone(), tick_price(px)?, quantity(&mut rng)?, side, now);
            if trades_tx.send(trade).await.is_err() {
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path))?;
            GridConfig::from_json(&text)?
        }
        None => GridConfig::default(),
    };
    let seconds: u64 = match args.next() {
        Some(s) => s.parse().context("seconds must be an integer")?,
        None => 10,
    };

    let instrument = InstrumentId::new("BTC-USD");
    let tick: Price = TICK.parse()?;
    let book = DenseOrderBook::centered(instrument.clone(), tick_price(CENTER_TICKS)?, tick, BOOK_LEVELS)?;

    let processor = Arc::new(GridProcessor::new(
        TimeSeriesEngine::new(),
        Arc::new(ViewportState::new()),
        config.clone(),
    ));
    let (handle, producer) = spawn_grid(Arc::clone(&processor), Some(book));
    let (trades_tx, mut trades_rx) = mpsc::channel(1024);
    let feed = tokio::spawn(run_feed(handle.clone(), instrument, trades_tx));

    let mut scheduler = UpdateScheduler::new(
        handle.clone(),
        RecentTrades::new(config.recent_trades_capacity, config.recent_trades_evict_chunk),
    );
    scheduler.set_size(1280.0, 720.0);
    let mut target = LogTarget::default();
    let mut frame = interval(Duration::from_millis(16));
    let deadline = sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    info!(seconds, "Running grid demo");
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(trade) = trades_rx.recv() => scheduler.on_trade(trade),
            _ = frame.tick() => {
                scheduler.poll_events();
                scheduler.run_cycle(&mut target);
            }
        }
    }

    handle.shutdown();
    feed.abort();
    producer.await.context("Producer task panicked")?;

    info!(
        cycles = scheduler.cycles(),
        rebuilds = target.rebuilds,
        appends = target.appends,
        materials = target.materials,
        transforms = target.transforms,
        stats = ?processor.stats().export(),
        "Grid demo finished"
    );
    Ok(())
}
