//! Engine Time
//!
//! Engine time is measured in microseconds from the UNIX epoch. Two sentinel
//! values bracket every legal time:
//!
//! - [`MIN_DT`]: "never" / "unset". An output whose last modified time is
//!   `MIN_DT` has never ticked and is therefore invalid.
//! - [`MAX_DT`]: "never scheduled". A clock whose next scheduled time is
//!   `MAX_DT` has nothing left to do.
//!
//! Graphs may only be started at or after [`MIN_ST`], one tick past `MIN_DT`,
//! so that a value produced in the very first cycle is distinguishable from
//! "never modified".

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A point in engine time, in microseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineTime(i64);

/// A signed span of engine time, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineTimeDelta(i64);

/// The "never" sentinel.
pub const MIN_DT: EngineTime = EngineTime(0);

/// The "never scheduled" sentinel (2300-01-01T00:00:00Z).
pub const MAX_DT: EngineTime = EngineTime(10_413_792_000_000_000);

/// The smallest representable step of engine time.
pub const MIN_TD: EngineTimeDelta = EngineTimeDelta(1);

/// The earliest time a graph can be started at.
pub const MIN_ST: EngineTime = EngineTime(MIN_DT.0 + MIN_TD.0);

/// The latest time a graph can be asked to run until.
pub const MAX_ET: EngineTime = EngineTime(MAX_DT.0 - MIN_TD.0);

impl EngineTime {
    /// Create a time from microseconds since the epoch.
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Create a time from whole seconds since the epoch.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }

    /// Microseconds since the epoch.
    pub const fn micros(self) -> i64 {
        self.0
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Convert a system time, clamping into `[MIN_DT, MAX_DT]`.
    pub fn from_system_time(time: SystemTime) -> Self {
        let micros = match time.duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_micros()).unwrap_or(MAX_DT.0),
            Err(_) => MIN_DT.0,
        };
        Self(micros.clamp(MIN_DT.0, MAX_DT.0))
    }

    /// Convert back into a system time.
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::from_micros(self.0.max(0) as u64)
    }

    /// True unless this is the `MIN_DT` sentinel.
    pub fn is_set(self) -> bool {
        self != MIN_DT
    }
}

impl EngineTimeDelta {
    pub const ZERO: Self = Self(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000_000))
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    /// The span as a `Duration`, or zero if negative.
    pub fn to_duration(self) -> Duration {
        Duration::from_micros(self.0.max(0) as u64)
    }
}

impl From<Duration> for EngineTimeDelta {
    fn from(d: Duration) -> Self {
        Self(i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
    }
}

impl Add<EngineTimeDelta> for EngineTime {
    type Output = EngineTime;

    /// Saturates at the sentinels so that `MAX_DT + n` stays "never".
    fn add(self, rhs: EngineTimeDelta) -> EngineTime {
        EngineTime(self.0.saturating_add(rhs.0).clamp(MIN_DT.0, MAX_DT.0))
    }
}

impl AddAssign<EngineTimeDelta> for EngineTime {
    fn add_assign(&mut self, rhs: EngineTimeDelta) {
        *self = *self + rhs;
    }
}

impl Sub<EngineTimeDelta> for EngineTime {
    type Output = EngineTime;

    fn sub(self, rhs: EngineTimeDelta) -> EngineTime {
        EngineTime(self.0.saturating_sub(rhs.0).clamp(MIN_DT.0, MAX_DT.0))
    }
}

impl Sub<EngineTime> for EngineTime {
    type Output = EngineTimeDelta;

    fn sub(self, rhs: EngineTime) -> EngineTimeDelta {
        EngineTimeDelta(self.0 - rhs.0)
    }
}

impl Add for EngineTimeDelta {
    type Output = EngineTimeDelta;

    fn add(self, rhs: EngineTimeDelta) -> EngineTimeDelta {
        EngineTimeDelta(self.0 + rhs.0)
    }
}

impl fmt::Display for EngineTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MIN_DT => write!(f, "MIN_DT"),
            MAX_DT => write!(f, "MAX_DT"),
            EngineTime(us) => write!(f, "{}.{:06}", us / 1_000_000, us % 1_000_000),
        }
    }
}

impl fmt::Display for EngineTimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_ordered() {
        assert!(MIN_DT < MIN_ST);
        assert!(MIN_ST < MAX_ET);
        assert!(MAX_ET < MAX_DT);
        assert!(!MIN_DT.is_set());
        assert!(MIN_ST.is_set());
    }

    #[test]
    fn addition_saturates_at_max() {
        assert_eq!(MAX_DT + MIN_TD, MAX_DT);
        assert_eq!(MIN_DT - MIN_TD, MIN_DT);
        assert_eq!(MIN_DT + MIN_TD, MIN_ST);
    }

    #[test]
    fn unit_constructors_saturate() {
        assert_eq!(EngineTimeDelta::from_secs(i64::MAX).micros(), i64::MAX);
        assert_eq!(EngineTimeDelta::from_millis(i64::MIN).micros(), i64::MIN);
        assert_eq!(EngineTime::from_secs(i64::MAX).micros(), i64::MAX);
    }

    #[test]
    fn difference_is_a_delta() {
        let a = EngineTime::from_secs(10);
        let b = EngineTime::from_secs(4);
        assert_eq!(a - b, EngineTimeDelta::from_secs(6));
        assert_eq!(b + EngineTimeDelta::from_secs(6), a);
    }

    #[test]
    fn display_formats_seconds() {
        assert_eq!(EngineTime::from_micros(1_500_000).to_string(), "1.500000");
        assert_eq!(MAX_DT.to_string(), "MAX_DT");
    }
}
