//! Types library for the liquidity grid
//!
//! Market event definitions shared by the feed adapters and the grid
//! aggregation service.
//!
//! # Modules
//! - `ids`: Instrument identifiers
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `market`: Trades, sparse book snapshots, book deltas
//! - `errors`: Error taxonomy

pub mod errors;
pub mod ids;
pub mod market;
pub mod numeric;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::market::*;
    pub use crate::numeric::*;
}
