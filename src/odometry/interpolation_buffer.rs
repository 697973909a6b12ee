//! Time-indexed pose buffer with interpolation.
//!
//! Stores (time, pose) samples in strictly non-decreasing time order and
//! answers "where was the sensor at time t" by interpolating between the two
//! samples that bracket t. Queries outside the stored range fail; the buffer
//! never extrapolates and never falls back to identity.

use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::error::{MappingError, Result};
use crate::geometry::SE3;
use crate::time::Time;

/// Default number of samples kept before the oldest is evicted.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Bounded pose history, single writer / many readers.
pub struct TransformInterpolationBuffer {
    samples: RwLock<VecDeque<(Time, SE3)>>,
    capacity: usize,
}

impl TransformInterpolationBuffer {
    /// Create a buffer holding at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY))),
            capacity,
        }
    }

    /// Append a sample.
    ///
    /// A timestamp older than the newest sample is rejected without touching
    /// the buffer. An equal timestamp replaces the newest sample.
    pub fn push(&self, time: Time, pose: SE3) -> Result<()> {
        let mut samples = self.samples.write();

        if let Some(&(last, _)) = samples.back() {
            if time < last {
                return Err(MappingError::OutOfOrderInput { time, last });
            }
            if time == last {
                samples.pop_back();
            }
        }

        samples.push_back((time, pose));
        while samples.len() > self.capacity {
            samples.pop_front();
        }
        Ok(())
    }

    /// Pose at `time`.
    ///
    /// Exact hits return the stored sample. Anything else needs two samples
    /// bracketing `time`.
    pub fn get(&self, time: Time) -> Result<SE3> {
        let samples = self.samples.read();

        let out_of_range = || MappingError::BufferQueryOutOfRange {
            time,
            earliest: samples.front().map(|s| s.0),
            latest: samples.back().map(|s| s.0),
        };

        let (Some(&(first_time, _)), Some(&(last_time, _))) = (samples.front(), samples.back()) else {
            return Err(out_of_range());
        };
        if time < first_time || time > last_time {
            return Err(out_of_range());
        }

        // First sample with timestamp >= time.
        let idx = samples.partition_point(|(t, _)| *t < time);
        let (t1, pose1) = samples[idx];
        if t1 == time {
            return Ok(pose1);
        }
        if idx == 0 {
            return Err(out_of_range());
        }

        let (t0, pose0) = samples[idx - 1];
        let alpha = (time.as_nanos() - t0.as_nanos()) as f64 / (t1.as_nanos() - t0.as_nanos()) as f64;
        Ok(pose0.interpolate(&pose1, alpha))
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn earliest_time(&self) -> Option<Time> {
        self.samples.read().front().map(|s| s.0)
    }

    pub fn latest_time(&self) -> Option<Time> {
        self.samples.read().back().map(|s| s.0)
    }

    /// Newest sample.
    pub fn latest(&self) -> Option<(Time, SE3)> {
        self.samples.read().back().copied()
    }

    pub fn clear(&self) {
        self.samples.write().clear();
    }
}

impl Default for TransformInterpolationBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
