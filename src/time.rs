//! Monotonic timestamps.

use std::fmt;

/// Timestamp in nanoseconds. Totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(pub u64);

impl Time {
    pub fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1e9).round().max(0.0) as u64)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Seconds elapsed from `earlier` to `self` (negative if `earlier` is later).
    pub fn seconds_since(&self, earlier: Time) -> f64 {
        (self.0 as i128 - earlier.0 as i128) as f64 / 1e9
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_and_conversion() {
        let a = Time::from_secs_f64(1.5);
        let b = Time::from_nanos(2_000_000_000);

        assert!(a < b);
        assert_eq!(a.as_nanos(), 1_500_000_000);
        assert!((b.seconds_since(a) - 0.5).abs() < 1e-12);
        assert!((a.seconds_since(b) + 0.5).abs() < 1e-12);
    }
}
