//! End-to-end behavior of the synchronous pipeline.

use std::sync::Arc;

use liquidity_grid::band::select_band;
use liquidity_grid::config::{BandMode, GridConfig};
use liquidity_grid::dense_book::DenseOrderBook;
use liquidity_grid::engine::LiquidityEngine;
use liquidity_grid::{BookSide, GridProcessor, TimeSeriesEngine, ViewportState};
use types::ids::InstrumentId;
use types::market::{BookDelta, Side, Trade};
use types::numeric::{Price, Quantity};

const T0: i64 = 1_700_000_000_000;

fn make_book(ts: i64) -> DenseOrderBook {
    let mut book = DenseOrderBook::new(
        InstrumentId::new("X"),
        Price::ZERO,
        "0.5".parse().unwrap(),
        1000,
    )
    .unwrap();
    let qty = |q: u64| Quantity::from_u64(q);
    book.apply_deltas(
        &[
            BookDelta::new(Side::Buy, Price::from_u64(99), qty(5)),
            BookDelta::new(Side::Buy, Price::from_u64(98), qty(3)),
            BookDelta::new(Side::Sell, Price::from_u64(101), qty(4)),
            BookDelta::new(Side::Sell, Price::from_u64(103), qty(2)),
        ],
        ts,
    );
    book
}

fn make_processor(use_dense: bool) -> GridProcessor<TimeSeriesEngine> {
    let config = GridConfig {
        use_dense_ingestion: use_dense,
        ..GridConfig::default()
    };
    GridProcessor::new(TimeSeriesEngine::new(), Arc::new(ViewportState::new()), config)
}

#[test]
fn test_trade_then_book_scenario() {
    let processor = make_processor(false);
    let trade = Trade::new(
        InstrumentId::new("X"),
        Price::from_u64(100),
        Quantity::from_u64(1),
        Side::Buy,
        T0,
    );
    processor.on_trade(&trade);

    let vp = processor.viewport().current();
    assert_eq!(vp.time_start_ms, T0 - 30_000);
    assert_eq!(vp.time_end_ms, T0 + 30_000);
    assert_eq!(vp.price_min, 0.0);
    assert_eq!(vp.price_max, 200.0);

    let book = make_book(T0 + 10);
    let selection = select_band(&book, &processor.band_config(), book.center_price());
    assert_eq!(selection.mid_price, 100.0);

    processor.on_dense_book_update(&book, 4);
    processor.set_timeframe(100);
    processor.update_visible_cells().unwrap();

    let cells = processor.published_snapshot().unwrap();
    assert!(cells.iter().any(|c| c.side == BookSide::Bid));
    assert!(cells.iter().any(|c| c.side == BookSide::Ask));
    for cell in cells.iter() {
        assert!(cell.price_min >= 0.0 && cell.price_max <= 200.0);
        assert!(cell.liquidity > 0.0);
        assert_eq!(cell.time_end_ms - cell.time_start_ms, 100);
    }
}

#[test]
fn test_dense_and_banded_paths_agree_on_narrow_book() {
    let dense = make_processor(true);
    let banded = make_processor(false);
    banded.set_band_mode(BandMode::FixedDollar);
    banded.set_band_value(5.0);
    let book = make_book(T0);
    dense.on_dense_book_update(&book, 4);
    banded.on_dense_book_update(&book, 4);

    let mut a: Vec<f64> = dense
        .published_snapshot()
        .unwrap()
        .iter()
        .map(|c| c.price_center())
        .collect();
    let mut b: Vec<f64> = banded
        .published_snapshot()
        .unwrap()
        .iter()
        .map(|c| c.price_center())
        .collect();
    a.sort_by(|x, y| x.total_cmp(y));
    b.sort_by(|x, y| x.total_cmp(y));
    // a $5 band covers every level of this book
    assert_eq!(a, b);
    assert_eq!(a, vec![98.0, 99.0, 101.0, 103.0]);
}

#[test]
fn test_sampling_grows_grid_over_time() {
    let processor = make_processor(true);
    let book = make_book(T0);
    processor.on_dense_book_update(&book, 4);
    let first = processor.published_snapshot().unwrap().len();

    for k in 1..=10 {
        processor.sample_order_book(T0 + k * 100);
    }
    let cells = processor.published_snapshot().unwrap();
    // one column per 100ms bucket, four levels each
    assert_eq!(first, 4);
    assert_eq!(cells.len(), 4 * 11);
    let columns: std::collections::BTreeSet<i64> = cells.iter().map(|c| c.time_start_ms).collect();
    assert_eq!(columns.len(), 11);
}

#[test]
fn test_engine_timeframes_extend_on_manual_request() {
    let processor = make_processor(true);
    processor.set_timeframe(750);
    let timeframes = processor
        .with_engine(|e| e.timeframes().to_vec())
        .unwrap();
    assert!(timeframes.contains(&750));
    assert!(timeframes.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(
        processor.with_engine(|e| e.suggest_timeframe(0, 60_000, 100)).unwrap(),
        750
    );
}
