//! Identifier types for market data entities
//!
//! A feed delivers events for a single instrument at a time; every event is
//! tagged with the instrument it belongs to so that stray events from another
//! subscription can be recognised and dropped.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::TypeError;

/// Instrument identifier (product id as published by the venue)
///
/// Examples: "BTC-USD", "ETH-PERP". Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstrumentId(String);

impl InstrumentId {
    /// Create a new InstrumentId
    ///
    /// # Panics
    /// Panics if the id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> Self {
        match Self::try_new(id) {
            Ok(id) => id,
            Err(err) => panic!("{}", err),
        }
    }

    /// Try to create an InstrumentId, rejecting empty ids
    pub fn try_new(id: impl Into<String>) -> Result<Self, TypeError> {
        let s = id.into();
        if s.trim().is_empty() {
            Err(TypeError::EmptyInstrumentId)
        } else {
            Ok(Self(s))
        }
    }

    /// Get the id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for InstrumentId {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_new(s)
    }
}

impl From<InstrumentId> for String {
    fn from(id: InstrumentId) -> Self {
        id.0
    }
}

impl From<&str> for InstrumentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
