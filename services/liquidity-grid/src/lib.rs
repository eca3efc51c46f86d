//! Liquidity Grid Service
//!
//! Turns a live order-book feed into a time × price grid of resting
//! liquidity and hands it to a display loop:
//! - Band selection of a dense book around mid
//! - Fixed-cadence sampling with carry-forward across gaps
//! - Multi-timeframe aggregation behind a pluggable engine
//! - Incremental visible-cell derivation, gated on a viewport version
//! - Immutable snapshot publication for lock-light readers
//! - Dirty-flag scheduling of rebuild / append / material / transform work
//!
//! # Architecture
//!
//! ```text
//!  Trades   Book deltas / snapshots
//!     │            │
//!     │      ┌─────▼─────┐
//!     │      │Dense book │──► Band Selector
//!     │      └─────┬─────┘         │
//!  ┌──▼────────────▼───────────────▼──┐
//!  │        Grid Processor            │ ◄── sampler tick
//!  │  (bootstrap, sample, update)     │
//!  └───┬──────────────────────┬───────┘
//!      │                      │
//!  ┌───▼────────┐      ┌──────▼──────┐
//!  │  Engine    │      │  Publisher  │
//!  │ (slices)   │      │ Arc<[Cell]> │
//!  └────────────┘      └──────┬──────┘
//!                             │ GridEvent
//!                      ┌──────▼──────┐
//!                      │  Scheduler  │──► RenderTarget
//!                      │ dirty flags │
//!                      └─────────────┘
//! ```

pub mod band;
pub mod cell;
pub mod config;
pub mod dense_book;
pub mod engine;
pub mod processor;
pub mod publisher;
pub mod runtime;
pub mod scheduler;
pub mod stats;
pub mod trades;
pub mod viewport;

pub use cell::{BookSide, CellInstance, PublishedSnapshot};
pub use config::GridConfig;
pub use engine::{LiquidityEngine, TimeSeriesEngine};
pub use processor::{GridEvent, GridProcessor};
pub use runtime::{spawn_grid, GridHandle};
pub use scheduler::{RenderTarget, UpdateScheduler};
pub use viewport::ViewportState;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
