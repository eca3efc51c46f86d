//! Fixed-point decimal types for prices and quantities
//!
//! Feed payloads carry prices and sizes as decimal strings. They are kept
//! exact at the boundary (so tick indexing does not drift) and converted to
//! `f64` once they enter the aggregation pipeline.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::TypeError;

/// Non-negative price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    pub const ZERO: Price = Price(Decimal::ZERO);

    /// Create a price, rejecting negative values
    pub fn try_new(value: Decimal) -> Result<Self, TypeError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(TypeError::InvalidPrice(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Whole-unit price (tests and synthetic feeds)
    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    /// Convert from a float, rejecting NaN/inf and negative values
    pub fn from_f64(value: f64) -> Result<Self, TypeError> {
        if !value.is_finite() {
            return Err(TypeError::NonFinite(value));
        }
        let dec = Decimal::from_f64(value).ok_or(TypeError::NonFinite(value))?;
        Self::try_new(dec)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Lossy conversion used by the float aggregation pipeline
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl FromStr for Price {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dec = Decimal::from_str(s).map_err(|_| TypeError::InvalidPrice(s.to_string()))?;
        Self::try_new(dec)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-negative quantity (size)
///
/// Zero is a valid quantity: book deltas use it to remove a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(Decimal);

impl Quantity {
    pub const ZERO: Quantity = Quantity(Decimal::ZERO);

    pub fn try_new(value: Decimal) -> Result<Self, TypeError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(TypeError::InvalidQuantity(value.to_string()));
        }
        Ok(Self(value))
    }

    pub fn from_u64(value: u64) -> Self {
        Self(Decimal::from(value))
    }

    pub fn from_f64(value: f64) -> Result<Self, TypeError> {
        if !value.is_finite() {
            return Err(TypeError::NonFinite(value));
        }
        let dec = Decimal::from_f64(value).ok_or(TypeError::NonFinite(value))?;
        Self::try_new(dec)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }
}

impl FromStr for Quantity {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dec =
            Decimal::from_str(s).map_err(|_| TypeError::InvalidQuantity(s.to_string()))?;
        Self::try_new(dec)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
