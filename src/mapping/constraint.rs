//! Relative-pose constraints between submaps.

use crate::geometry::SE3;

use super::types::SubmapId;

/// Origin of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// Consecutive submaps, from chained odometry.
    Odometry,
    /// Non-consecutive submaps found to overlap by registration.
    LoopClosure,
}

/// Edge of the pose graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub source_submap_id: SubmapId,
    pub target_submap_id: SubmapId,
    /// Pose of the target submap expressed in the source submap's frame.
    pub relative_pose: SE3,
    pub information_weight: f64,
    pub kind: ConstraintKind,
}

impl Constraint {
    /// Odometry edge between two submaps given their map poses.
    pub fn odometry(
        source_submap_id: SubmapId,
        map_to_source: &SE3,
        target_submap_id: SubmapId,
        map_to_target: &SE3,
        information_weight: f64,
    ) -> Self {
        Self {
            source_submap_id,
            target_submap_id,
            relative_pose: map_to_source.between(map_to_target),
            information_weight,
            kind: ConstraintKind::Odometry,
        }
    }

    pub fn loop_closure(
        source_submap_id: SubmapId,
        target_submap_id: SubmapId,
        relative_pose: SE3,
        information_weight: f64,
    ) -> Self {
        Self {
            source_submap_id,
            target_submap_id,
            relative_pose,
            information_weight,
            kind: ConstraintKind::LoopClosure,
        }
    }

    pub fn is_loop_closure(&self) -> bool {
        self.kind == ConstraintKind::LoopClosure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_odometry_relative_pose() {
        let a = SE3::from_rpy(0.0, 0.0, std::f64::consts::FRAC_PI_2, Vector3::new(1.0, 0.0, 0.0));
        let b = SE3::from_translation(Vector3::new(1.0, 2.0, 0.0));
        let c = Constraint::odometry(SubmapId(0), &a, SubmapId(1), &b, 1.0);

        // b sits 2m along a's local +x axis.
        assert_relative_eq!(c.relative_pose.translation, Vector3::new(2.0, 0.0, 0.0), epsilon = 1e-12);
        assert_eq!(c.kind, ConstraintKind::Odometry);
        assert!(!c.is_loop_closure());
    }
}
