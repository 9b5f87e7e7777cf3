//! Integer simulation time used for all scheduling arithmetic.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Signed nanosecond count of virtual simulation time.
///
/// Arithmetic is exact integer arithmetic, so repeated stepping never
/// accumulates floating point drift. Operators saturate at the `i64`
/// bounds. The value is signed because run-length computations in the
/// scheduler may produce negative intermediate results.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SimulationTime(i64);

impl SimulationTime {
    /// The "no time elapsed" sentinel.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Creates a time from a raw nanosecond count.
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Creates a time from microseconds.
    pub const fn from_micros(micros: i64) -> Self {
        Self(micros.saturating_mul(NANOS_PER_MICRO))
    }

    /// Creates a time from milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis.saturating_mul(NANOS_PER_MILLI))
    }

    /// Creates a time from whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(NANOS_PER_SEC))
    }

    /// Raw nanosecond count.
    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Whole milliseconds, truncated toward zero.
    pub const fn as_millis(self) -> i64 {
        self.0 / NANOS_PER_MILLI
    }

    /// Seconds as a float, for display and for engines that speak floats.
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC as f64
    }

    /// Returns true when the value is below zero.
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Returns true for the zero sentinel.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Converts to a wall-clock duration. Negative times have none.
    pub fn to_duration(self) -> Option<Duration> {
        u64::try_from(self.0).ok().map(Duration::from_nanos)
    }

    /// Absolute distance between two times.
    pub fn abs_diff(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0).saturating_abs())
    }
}

impl From<Duration> for SimulationTime {
    fn from(duration: Duration) -> Self {
        Self(i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX))
    }
}

impl Add for SimulationTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for SimulationTime {
    fn add_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for SimulationTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for SimulationTime {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Neg for SimulationTime {
    type Output = Self;

    fn neg(self) -> Self {
        Self(self.0.saturating_neg())
    }
}

impl fmt::Display for SimulationTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % NANOS_PER_MILLI == 0 {
            write!(f, "{}ms", self.0 / NANOS_PER_MILLI)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_constructors_agree() {
        assert_eq!(SimulationTime::from_secs(1), SimulationTime::from_millis(1000));
        assert_eq!(SimulationTime::from_millis(1), SimulationTime::from_micros(1000));
        assert_eq!(SimulationTime::from_micros(1).as_nanos(), 1000);
    }

    #[test]
    fn test_arithmetic_is_exact() {
        let step = SimulationTime::from_nanos(333_333);
        let mut t = SimulationTime::zero();
        for _ in 0..3_000 {
            t += step;
        }
        assert_eq!(t.as_nanos(), 999_999_000);
    }

    #[test]
    fn test_negative_run_length() {
        let sim_time = SimulationTime::from_millis(20);
        let reported = SimulationTime::from_millis(45);
        let step = SimulationTime::from_millis(10);

        let run = sim_time - reported + step;
        assert!(run.is_negative());
        assert_eq!(run.to_duration(), None);
        assert_eq!((-run).as_millis(), 15);
    }

    #[test]
    fn test_arithmetic_saturates_at_bounds() {
        let max = SimulationTime::from_nanos(i64::MAX);
        let min = SimulationTime::from_nanos(i64::MIN);
        let step = SimulationTime::from_millis(10);

        assert_eq!(max + step, max);
        assert_eq!(min - step, min);
        assert_eq!(-min, max);
        assert_eq!(SimulationTime::zero() - max - step, min);
        assert_eq!(min.abs_diff(max), max);
        assert_eq!(SimulationTime::from_secs(i64::MAX), max);

        let mut t = max - step;
        t += step;
        t += step;
        assert_eq!(t, max);
    }

    #[test]
    fn test_duration_conversion() {
        let t = SimulationTime::from(Duration::from_millis(25));
        assert_eq!(t, SimulationTime::from_millis(25));
        assert_eq!(t.to_duration(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_display() {
        assert_eq!(SimulationTime::from_millis(50).to_string(), "50ms");
        assert_eq!(SimulationTime::from_nanos(1_500).to_string(), "1500ns");
    }

    #[test]
    fn test_serializes_as_plain_integer() {
        let json = serde_json::to_string(&SimulationTime::from_millis(2)).unwrap();
        assert_eq!(json, "2000000");
    }
}
