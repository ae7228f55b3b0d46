//! Virtual-time types.
//!
//! All timestamps on the wire are signed 64-bit nanoseconds. [`SimTime`] is a
//! point on the virtual clock; [`SimStep`] is a duration between points.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

/// A point on the virtual simulation clock, in nanoseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SimTime(pub i64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);

    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }
}

impl Add<SimStep> for SimTime {
    type Output = SimTime;

    fn add(self, step: SimStep) -> SimTime {
        SimTime(self.0 + step.0)
    }
}

impl AddAssign<SimStep> for SimTime {
    fn add_assign(&mut self, step: SimStep) {
        self.0 += step.0;
    }
}

impl Sub<SimTime> for SimTime {
    type Output = SimStep;

    fn sub(self, other: SimTime) -> SimStep {
        SimStep(self.0 - other.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0 as f64 / 1e9)
    }
}

/// A virtual-time duration, in nanoseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SimStep(pub i64);

impl SimStep {
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }
}

impl From<Duration> for SimStep {
    fn from(d: Duration) -> Self {
        Self(d.as_nanos() as i64)
    }
}

impl fmt::Display for SimStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0 as f64 / 1e9)
    }
}
