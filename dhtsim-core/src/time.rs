//! Virtual time for the discrete-event scheduler.
//!
//! All delays in the simulation are continuous exponential variates, so the
//! clock is a totally ordered wrapper over `f64` rather than an integer tick
//! count. Time is only ever advanced by the scheduler.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

/// A point in simulated time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimTime(f64);

impl SimTime {
    /// Start of the simulation.
    pub const ZERO: SimTime = SimTime(0.0);

    /// Create a timestamp from a raw time value.
    #[inline]
    pub const fn new(t: f64) -> Self {
        SimTime(t)
    }

    /// The raw time value.
    #[inline]
    pub const fn as_f64(self) -> f64 {
        self.0
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Add<f64> for SimTime {
    type Output = SimTime;

    #[inline]
    fn add(self, delay: f64) -> SimTime {
        SimTime(self.0 + delay)
    }
}

impl Sub for SimTime {
    type Output = f64;

    #[inline]
    fn sub(self, earlier: SimTime) -> f64 {
        self.0 - earlier.0
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:8.3}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let t1 = SimTime::new(1.5);
        let t2 = SimTime::new(2.0);
        assert!(t1 < t2);
        assert_eq!(t1, SimTime::new(1.5));
    }

    #[test]
    fn test_arithmetic() {
        let t = SimTime::new(10.0) + 2.5;
        assert_eq!(t, SimTime::new(12.5));
        assert!((t - SimTime::new(10.0) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_is_smallest_run_time() {
        assert!(SimTime::ZERO < SimTime::new(f64::MIN_POSITIVE));
    }
}
