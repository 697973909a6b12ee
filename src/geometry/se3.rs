//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Poses follow the `T_target_source` convention: `map_to_submap` maps points
//! expressed in the submap frame into the map frame.

use std::fmt;

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};

/// Rigid body transformation. Transforms points as: p' = R * p + t
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Construct from roll, pitch, yaw (radians) and a translation.
    pub fn from_rpy(roll: f64, pitch: f64, yaw: f64, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_euler_angles(roll, pitch, yaw),
            translation,
        }
    }

    /// Construct from homogeneous 4x4 matrix [R | t; 0 | 1].
    pub fn from_matrix(mat: &Matrix4<f64>) -> Self {
        let r: Matrix3<f64> = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let rot3 = Rotation3::from_matrix(&r);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation: Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]),
        }
    }

    /// Convert to homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        mat.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        mat
    }

    /// Inverse transformation.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Composition: `self * other`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Pose of `other` expressed in the frame of `self`: `self^{-1} * other`.
    pub fn between(&self, other: &SE3) -> Self {
        self.inverse().compose(other)
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    pub fn rotate_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    /// Interpolate towards `other` with `alpha` in [0, 1].
    ///
    /// Linear on translation, spherical on rotation.
    pub fn interpolate(&self, other: &SE3, alpha: f64) -> Self {
        Self {
            rotation: self.rotation.slerp(&other.rotation, alpha),
            translation: self.translation.lerp(&other.translation, alpha),
        }
    }

    /// Minimal 6-vector `[tx, ty, tz, rx, ry, rz]` with the rotation as a
    /// scaled axis.
    pub fn to_vector6(&self) -> Vector6<f64> {
        let axis = self.rotation.scaled_axis();
        Vector6::new(
            self.translation.x,
            self.translation.y,
            self.translation.z,
            axis.x,
            axis.y,
            axis.z,
        )
    }

    /// Inverse of [`SE3::to_vector6`].
    pub fn from_vector6(v: &Vector6<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(v[3], v[4], v[5])),
            translation: Vector3::new(v[0], v[1], v[2]),
        }
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Display for SE3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.rotation.euler_angles();
        write!(
            f,
            "t: [{:.4}, {:.4}, {:.4}] rpy (deg): [{:.3}, {:.3}, {:.3}]",
            self.translation.x,
            self.translation.y,
            self.translation.z,
            roll.to_degrees(),
            pitch.to_degrees(),
            yaw.to_degrees()
        )
    }
}
