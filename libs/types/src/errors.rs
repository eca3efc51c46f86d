//! Error types for market data values
//!
//! Raised only when constructing values from untrusted input (feed payloads,
//! configuration). Pipeline code drops malformed events instead of
//! propagating these.

use thiserror::Error;

/// Errors produced while building market data values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypeError {
    #[error("instrument id must not be empty")]
    EmptyInstrumentId,

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("Non-finite value: {0}")]
    NonFinite(f64),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_price_display() {
        let err = TypeError::InvalidPrice("negative".to_string());
        assert_eq!(err.to_string(), "Invalid price: negative");
    }

    #[test]
    fn test_empty_instrument_display() {
        assert_eq!(
            TypeError::EmptyInstrumentId.to_string(),
            "instrument id must not be empty"
        );
    }
}
