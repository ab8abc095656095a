//! Echelon index: one of a fixed number of time-phase slots.
//!
//! Every unit and drawing belongs to exactly one echelon of one room.
//! The index is validated on construction and on deserialization, so a
//! value of this type is always in range.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SyncError;

/// Number of echelons per room.
pub const ECHELON_COUNT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct EchelonIndex(u8);

impl EchelonIndex {
    pub const FIRST: EchelonIndex = EchelonIndex(0);

    /// Build an index, rejecting values outside `0..ECHELON_COUNT`.
    pub fn new(index: u8) -> Result<Self, SyncError> {
        if index < ECHELON_COUNT {
            Ok(Self(index))
        } else {
            Err(SyncError::Validation(format!(
                "echelon index {index} out of range 0..{ECHELON_COUNT}"
            )))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// All valid echelons in ascending order.
    pub fn all() -> impl Iterator<Item = EchelonIndex> {
        (0..ECHELON_COUNT).map(EchelonIndex)
    }
}

impl TryFrom<u8> for EchelonIndex {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EchelonIndex> for u8 {
    fn from(index: EchelonIndex) -> Self {
        index.0
    }
}

impl fmt::Display for EchelonIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
