use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of sequential approval levels a request has to clear.
pub const LEVEL_COUNT: u8 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u8")]
pub struct ApprovalLevel(u8);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("approval level {value} is outside the supported range 0..={max}")]
pub struct LevelOutOfRange {
    pub value: i64,
    pub max: u8,
}

impl ApprovalLevel {
    pub const FIRST: Self = Self(0);
    pub const FINAL: Self = Self(LEVEL_COUNT - 1);

    pub fn new(value: u8) -> Result<Self, LevelOutOfRange> {
        Self::try_from(i64::from(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_final(self) -> bool {
        self == Self::FINAL
    }

    pub fn next(self) -> Option<Self> {
        (!self.is_final()).then(|| Self(self.0 + 1))
    }

    /// All levels in escalation order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..LEVEL_COUNT).map(Self)
    }
}

impl TryFrom<i64> for ApprovalLevel {
    type Error = LevelOutOfRange;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match u8::try_from(value) {
            Ok(level) if level < LEVEL_COUNT => Ok(Self(level)),
            _ => Err(LevelOutOfRange { value, max: LEVEL_COUNT - 1 }),
        }
    }
}

impl From<ApprovalLevel> for u8 {
    fn from(level: ApprovalLevel) -> Self {
        level.0
    }
}

impl From<ApprovalLevel> for i64 {
    fn from(level: ApprovalLevel) -> Self {
        i64::from(level.0)
    }
}

impl fmt::Display for ApprovalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
