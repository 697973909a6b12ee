//! Point cloud container and preprocessing primitives.
//!
//! - [`PointCloud`] - points with optional per-point normals
//! - [`cropping`] - crop volumes applied in the sensor frame
//! - [`voxel`] - voxel-grid downsampling, random downsampling, neighbour queries
//! - [`normals`] - normal estimation from k nearest neighbours

pub mod cropping;
pub mod normals;
pub mod voxel;

use nalgebra::Vector3;

use crate::geometry::SE3;

pub use cropping::{CroppingVolume, cropping_volume_factory};
pub use normals::{estimate_normals, normal_search_radius};
pub use voxel::{VoxelHash, random_down_sample, voxelize};

/// 3D point cloud. `normals` is either empty or the same length as `points`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    pub points: Vec<Vector3<f64>>,
    pub normals: Vec<Vector3<f64>>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(points: Vec<Vector3<f64>>) -> Self {
        Self {
            points,
            normals: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn has_normals(&self) -> bool {
        !self.points.is_empty() && self.normals.len() == self.points.len()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.normals.clear();
    }

    /// Apply `pose` to every point (and rotate normals) in place.
    pub fn transform(&mut self, pose: &SE3) {
        for p in &mut self.points {
            *p = pose.transform_point(p);
        }
        for n in &mut self.normals {
            *n = pose.rotate_vector(n);
        }
    }

    pub fn transformed(&self, pose: &SE3) -> PointCloud {
        let mut out = self.clone();
        out.transform(pose);
        out
    }

    /// Append `other`. Normals are kept only if both clouds carry them.
    pub fn extend_from(&mut self, other: &PointCloud) {
        let keep_normals = (self.is_empty() || self.has_normals()) && other.has_normals();
        self.points.extend_from_slice(&other.points);
        if keep_normals {
            self.normals.extend_from_slice(&other.normals);
        } else {
            self.normals.clear();
        }
    }

    pub fn centroid(&self) -> Option<Vector3<f64>> {
        if self.points.is_empty() {
            return None;
        }
        let sum: Vector3<f64> = self.points.iter().sum();
        Some(sum / self.points.len() as f64)
    }

    pub fn normalize_normals(&mut self) {
        for n in &mut self.normals {
            let norm = n.norm();
            if norm > 1e-12 {
                *n /= norm;
            }
        }
    }

    /// Keep only points whose index satisfies `keep`.
    pub fn select<F: Fn(usize, &Vector3<f64>) -> bool>(&self, keep: F) -> PointCloud {
        let has_normals = self.has_normals();
        let mut out = PointCloud::new();
        for (i, p) in self.points.iter().enumerate() {
            if keep(i, p) {
                out.points.push(*p);
                if has_normals {
                    out.normals.push(self.normals[i]);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transform_rotates_normals() {
        let mut cloud = PointCloud {
            points: vec![Vector3::new(1.0, 0.0, 0.0)],
            normals: vec![Vector3::new(1.0, 0.0, 0.0)],
        };
        let pose = SE3::from_rpy(0.0, 0.0, std::f64::consts::FRAC_PI_2, Vector3::new(0.0, 0.0, 1.0));
        cloud.transform(&pose);

        assert_relative_eq!(cloud.points[0], Vector3::new(0.0, 1.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(cloud.normals[0], Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_extend_drops_normals_when_mismatched() {
        let mut a = PointCloud {
            points: vec![Vector3::zeros()],
            normals: vec![Vector3::z()],
        };
        let b = PointCloud::from_points(vec![Vector3::x()]);
        a.extend_from(&b);

        assert_eq!(a.len(), 2);
        assert!(!a.has_normals());
    }

    #[test]
    fn test_centroid() {
        let cloud = PointCloud::from_points(vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(2.0, 4.0, 6.0)]);
        assert_relative_eq!(cloud.centroid().unwrap(), Vector3::new(1.0, 2.0, 3.0));
        assert!(PointCloud::new().centroid().is_none());
    }
}
