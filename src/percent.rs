//! Fixed-point percentages
//!
//! All capacity arithmetic is done in integer basis points (1% = 100 bp) so
//! that summing many fractional commitments never drifts. Values are
//! serialized as plain JSON numbers in percent units (`12.5`, not `1250`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;

use crate::error::{CapacityError, Result};

/// Basis points per percent
pub const BASIS_POINTS_PER_PERCENT: u32 = 100;

/// A percentage held as basis points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Percent(u32);

impl Percent {
    pub const ZERO: Percent = Percent(0);

    /// 100%: the upper bound of any single commitment
    pub const FULL: Percent = Percent(100 * BASIS_POINTS_PER_PERCENT);

    pub const fn from_basis_points(bp: u32) -> Self {
        Self(bp)
    }

    /// Whole percent, e.g. `Percent::whole(60)` is 60%.
    pub const fn whole(percent: u32) -> Self {
        Self(percent * BASIS_POINTS_PER_PERCENT)
    }

    /// Convert a floating percentage, rounding to the nearest basis point.
    ///
    /// Rejects NaN, infinities and negative values. No upper bound is applied
    /// here; ceilings and totals may exceed 100%.
    pub fn from_f64(value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(CapacityError::InvalidArgument(format!(
                "percentage must be a non-negative number, got {}",
                value
            )));
        }

        let bp = (value * BASIS_POINTS_PER_PERCENT as f64).round();
        if bp > u32::MAX as f64 {
            return Err(CapacityError::InvalidArgument(format!(
                "percentage out of range: {}",
                value
            )));
        }

        Ok(Self(bp as u32))
    }

    /// Convert a commitment percentage, which must lie in [0, 100].
    pub fn commitment(value: f64) -> Result<Self> {
        let percent = Self::from_f64(value)?;
        percent.ensure_commitment()?;
        Ok(percent)
    }

    /// Fail with `InvalidArgument` unless this value lies in [0, 100].
    pub fn ensure_commitment(self) -> Result<()> {
        if self > Self::FULL {
            return Err(CapacityError::InvalidArgument(format!(
                "commitment percentage must be within [0, 100], got {}",
                self
            )));
        }
        Ok(())
    }

    pub const fn basis_points(self) -> u32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / BASIS_POINTS_PER_PERCENT as f64
    }

    pub const fn saturating_sub(self, other: Percent) -> Percent {
        Percent(self.0.saturating_sub(other.0))
    }
}

impl Add for Percent {
    type Output = Percent;

    fn add(self, rhs: Percent) -> Percent {
        Percent(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Percent {
    fn sum<I: Iterator<Item = Percent>>(iter: I) -> Percent {
        iter.fold(Percent::ZERO, Add::add)
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.as_f64())
    }
}

impl Serialize for Percent {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Percent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Percent::from_f64(value).map_err(serde::de::Error::custom)
    }
}
