//! Logical time.
//!
//! The clock ticks once per committed task transition, never per reboot. It is
//! the only ordering signal consumers use to pick the freshest of several
//! producer fields, so it is stored next to every value written to a channel.

use core::fmt;

use crate::NonVolatile;

/// A point on the logical clock.
///
/// `LogicalTime::ZERO` is reserved: it is the time of the bootstrap context
/// record and the timestamp of a field nobody has written yet. The first real
/// task activation runs at time 1.
#[derive(NonVolatile, Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// The bootstrap / never-written time.
    pub const ZERO: Self = Self(0);

    /// Creates a logical time from a raw tick count.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying tick count.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` for the reserved zero time.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The time of the activation that follows this one.
    ///
    /// The clock is 64 bits wide so it cannot wrap back to the reserved zero
    /// within a device's life: at one transition per nanosecond it lasts
    /// for more than 500 years.
    #[inline]
    #[must_use]
    pub const fn tick(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<LogicalTime> for u64 {
    fn from(time: LogicalTime) -> Self {
        time.0
    }
}
