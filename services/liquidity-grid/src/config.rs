//! Configuration for the liquidity grid pipeline
//!
//! All structs deserialize from JSON with `#[serde(default)]`, so a partial
//! document only overrides the fields it names.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How the half-width of the price band around mid is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandMode {
    /// Half-band is `value` in quote currency.
    FixedDollar,
    /// Half-band is `value` × |mid|.
    PercentMid,
    /// Half-band is `value` ticks.
    Ticks,
}

/// Band Selector parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandConfig {
    pub mode: BandMode,
    /// Interpretation depends on `mode`.
    pub value: f64,
    /// Fixed-dollar fallback when the mode yields zero or is unset.
    pub default_half_band: f64,
    /// Upper bound on emitted levels per side.
    pub max_levels_per_side: usize,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            mode: BandMode::PercentMid,
            value: 0.01,
            default_half_band: 100.0,
            max_levels_per_side: 4000,
        }
    }
}

/// Trade batching parameters.
///
/// Carried and settable, but no code path flushes a batch from them yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeBatchConfig {
    pub interval_ms: u64,
    pub significance_threshold: f64,
    pub max_batch_size: usize,
}

impl Default for TradeBatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 75,
            significance_threshold: 0.001,
            max_batch_size: 50,
        }
    }
}

/// Top-level grid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Sampling cadence, also the carry-forward bucket width.
    pub sample_interval_ms: i64,
    /// Target cell count handed to timeframe suggestion.
    pub target_cell_budget: usize,
    /// Lifetime of a manual timeframe override.
    pub manual_timeframe_timeout_ms: u64,
    /// Distance between viewport and newest data that triggers auto-fit.
    pub auto_fit_gap_ms: i64,
    /// Half-width of the time window at bootstrap and auto-fit.
    pub bootstrap_half_window_ms: i64,
    /// Half-height of the price window at bootstrap.
    pub bootstrap_price_margin: f64,
    pub default_timeframe_ms: i64,
    pub use_dense_ingestion: bool,
    pub dense_max_levels_per_side: usize,
    pub band: BandConfig,
    pub recent_trades_capacity: usize,
    pub recent_trades_evict_chunk: usize,
    pub command_queue_capacity: usize,
    pub trade_batch: TradeBatchConfig,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            target_cell_budget: 2000,
            manual_timeframe_timeout_ms: 10_000,
            auto_fit_gap_ms: 60_000,
            bootstrap_half_window_ms: 30_000,
            bootstrap_price_margin: 100.0,
            default_timeframe_ms: 100,
            use_dense_ingestion: true,
            dense_max_levels_per_side: 4000,
            band: BandConfig::default(),
            recent_trades_capacity: 1000,
            recent_trades_evict_chunk: 100,
            command_queue_capacity: 65_536,
            trade_batch: TradeBatchConfig::default(),
        }
    }
}

impl GridConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: GridConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_ms <= 0 {
            return Err(invalid("sample_interval_ms", "must be positive"));
        }
        if self.default_timeframe_ms <= 0 {
            return Err(invalid("default_timeframe_ms", "must be positive"));
        }
        if self.target_cell_budget == 0 {
            return Err(invalid("target_cell_budget", "must be non-zero"));
        }
        if self.auto_fit_gap_ms < 0 || self.bootstrap_half_window_ms <= 0 {
            return Err(invalid(
                "bootstrap_half_window_ms",
                "window must be positive and gap non-negative",
            ));
        }
        if !(self.bootstrap_price_margin.is_finite() && self.bootstrap_price_margin > 0.0) {
            return Err(invalid("bootstrap_price_margin", "must be finite and positive"));
        }
        if self.dense_max_levels_per_side == 0 || self.band.max_levels_per_side == 0 {
            return Err(invalid("max_levels_per_side", "must be non-zero"));
        }
        if !self.band.value.is_finite() || self.band.value < 0.0 {
            return Err(invalid("band.value", "must be finite and non-negative"));
        }
        if !(self.band.default_half_band.is_finite() && self.band.default_half_band > 0.0) {
            return Err(invalid("band.default_half_band", "must be finite and positive"));
        }
        if self.recent_trades_capacity == 0
            || self.recent_trades_evict_chunk == 0
            || self.recent_trades_evict_chunk > self.recent_trades_capacity
        {
            return Err(invalid(
                "recent_trades_evict_chunk",
                "capacity and chunk must be non-zero, chunk <= capacity",
            ));
        }
        if self.command_queue_capacity == 0 {
            return Err(invalid("command_queue_capacity", "must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
