//! Callbacks for outer layers (transport adapters, recorders, tests).

use crate::geometry::SE3;
use crate::mapping::{OptimizedSubmapPose, SubmapId};
use crate::optimizer::SolveSummary;
use crate::time::Time;

/// Receives mapping events. All methods default to no-ops.
///
/// `on_odometry` and `on_submap_finished` run on the ingestion thread; the
/// others run on worker threads. Implementations should return quickly.
pub trait MappingObserver: Send + Sync {
    fn on_odometry(&self, _time: Time, _odom_to_range_sensor: &SE3) {}

    fn on_submap_finished(&self, _submap_id: SubmapId) {}

    fn on_loop_closures(&self, _attempted: usize, _accepted: usize) {}

    fn on_optimization(&self, _summary: &SolveSummary, _poses: &[OptimizedSubmapPose]) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl MappingObserver for NoopObserver {}
