//! Cropping volumes applied to scans in the sensor frame.

use nalgebra::Vector3;

use crate::config::{CropperKind, CroppingParameters};

use super::PointCloud;

/// A region of space; points outside are discarded by [`CroppingVolume::crop`].
pub trait CroppingVolume: Send + Sync {
    fn is_within(&self, p: &Vector3<f64>) -> bool;

    fn crop(&self, cloud: &PointCloud) -> PointCloud {
        cloud.select(|_, p| self.is_within(p))
    }
}

/// Axis-aligned box.
pub struct BoundingBoxCroppingVolume {
    low: Vector3<f64>,
    high: Vector3<f64>,
}

impl BoundingBoxCroppingVolume {
    pub fn new(low: Vector3<f64>, high: Vector3<f64>) -> Self {
        Self { low, high }
    }
}

impl CroppingVolume for BoundingBoxCroppingVolume {
    fn is_within(&self, p: &Vector3<f64>) -> bool {
        (0..3).all(|i| p[i] >= self.low[i] && p[i] <= self.high[i])
    }
}

/// Sphere around the sensor.
pub struct MaxRadiusCroppingVolume {
    radius: f64,
}

impl MaxRadiusCroppingVolume {
    pub fn new(radius: f64) -> Self {
        Self { radius }
    }
}

impl CroppingVolume for MaxRadiusCroppingVolume {
    fn is_within(&self, p: &Vector3<f64>) -> bool {
        p.norm_squared() <= self.radius * self.radius
    }
}

/// Spherical shell; drops returns from the vehicle body and far clutter.
pub struct MinMaxRadiusCroppingVolume {
    min_radius: f64,
    max_radius: f64,
}

impl MinMaxRadiusCroppingVolume {
    pub fn new(min_radius: f64, max_radius: f64) -> Self {
        Self {
            min_radius,
            max_radius,
        }
    }
}

impl CroppingVolume for MinMaxRadiusCroppingVolume {
    fn is_within(&self, p: &Vector3<f64>) -> bool {
        let d2 = p.norm_squared();
        d2 >= self.min_radius * self.min_radius && d2 <= self.max_radius * self.max_radius
    }
}

/// Vertical cylinder centred on the sensor.
pub struct CylinderCroppingVolume {
    radius: f64,
    min_z: f64,
    max_z: f64,
}

impl CylinderCroppingVolume {
    pub fn new(radius: f64, min_z: f64, max_z: f64) -> Self {
        Self {
            radius,
            min_z,
            max_z,
        }
    }
}

impl CroppingVolume for CylinderCroppingVolume {
    fn is_within(&self, p: &Vector3<f64>) -> bool {
        p.x * p.x + p.y * p.y <= self.radius * self.radius && p.z >= self.min_z && p.z <= self.max_z
    }
}

/// Build the cropping volume described by `params`.
pub fn cropping_volume_factory(params: &CroppingParameters) -> Box<dyn CroppingVolume> {
    match params.kind {
        CropperKind::BoundingBox => Box::new(BoundingBoxCroppingVolume::new(
            Vector3::from(params.low_bound),
            Vector3::from(params.high_bound),
        )),
        CropperKind::MaxRadius => Box::new(MaxRadiusCroppingVolume::new(params.cropping_radius_max)),
        CropperKind::MinMaxRadius => Box::new(MinMaxRadiusCroppingVolume::new(
            params.cropping_radius_min,
            params.cropping_radius_max,
        )),
        CropperKind::Cylinder => Box::new(CylinderCroppingVolume::new(
            params.cropping_radius_max,
            params.min_z,
            params.max_z,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud() -> PointCloud {
        PointCloud::from_points(vec![
            Vector3::new(0.5, 0.0, 0.0),
            Vector3::new(5.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 10.0),
        ])
    }

    #[test]
    fn test_bounding_box() {
        let params = CroppingParameters {
            low_bound: [-1.0, -1.0, -1.0],
            high_bound: [1.0, 1.0, 1.0],
            ..CroppingParameters::default()
        };
        let cropped = cropping_volume_factory(&params).crop(&cloud());
        assert_eq!(cropped.len(), 1);
    }

    #[test]
    fn test_min_max_radius() {
        let params = CroppingParameters {
            kind: CropperKind::MinMaxRadius,
            cropping_radius_min: 1.0,
            cropping_radius_max: 6.0,
            ..CroppingParameters::default()
        };
        let cropped = cropping_volume_factory(&params).crop(&cloud());
        assert_eq!(cropped.points, vec![Vector3::new(5.0, 0.0, 0.0)]);
    }

    #[test]
    fn test_cylinder_limits_height() {
        let params = CroppingParameters {
            kind: CropperKind::Cylinder,
            cropping_radius_max: 6.0,
            min_z: -2.0,
            max_z: 2.0,
            ..CroppingParameters::default()
        };
        let cropped = cropping_volume_factory(&params).crop(&cloud());
        assert_eq!(cropped.len(), 2);
    }
}
