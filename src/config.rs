//! Parameters for odometry, mapping and pose-graph optimization.
//!
//! All parameter structs deserialize from YAML with per-struct defaults, so a
//! configuration file only needs to list the values it overrides.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MappingError, Result};

/// Registration objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IcpObjective {
    #[default]
    PointToPoint,
    PointToPlane,
}

/// Shape of the volume used to crop incoming scans (sensor frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CropperKind {
    #[default]
    BoundingBox,
    MaxRadius,
    MinMaxRadius,
    Cylinder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CroppingParameters {
    pub kind: CropperKind,
    pub low_bound: [f64; 3],
    pub high_bound: [f64; 3],
    pub cropping_radius_min: f64,
    pub cropping_radius_max: f64,
    pub min_z: f64,
    pub max_z: f64,
}

impl Default for CroppingParameters {
    fn default() -> Self {
        Self {
            kind: CropperKind::BoundingBox,
            low_bound: [-30.0, -30.0, -1e3],
            high_bound: [30.0, 30.0, 1e3],
            cropping_radius_min: 0.0,
            cropping_radius_max: 30.0,
            min_z: -1e3,
            max_z: 1e3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanProcessingParameters {
    pub voxel_size: f64,
    /// Fraction of points kept after voxelization, in (0, 1].
    pub down_sampling_ratio: f64,
    pub cropper: CroppingParameters,
}

impl Default for ScanProcessingParameters {
    fn default() -> Self {
        Self {
            voxel_size: 0.1,
            down_sampling_ratio: 1.0,
            cropper: CroppingParameters::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanMatcherParameters {
    pub knn_normal_estimation: usize,
    pub max_num_iter: usize,
    pub max_correspondence_distance: f64,
    pub icp_objective: IcpObjective,
}

impl Default for ScanMatcherParameters {
    fn default() -> Self {
        Self {
            knn_normal_estimation: 5,
            max_num_iter: 50,
            max_correspondence_distance: 0.2,
            icp_objective: IcpObjective::PointToPoint,
        }
    }
}

/// Overrides used while the odometry runs in map-initialization mode.
///
/// Only voxel size, downsampling ratio and max correspondence distance are
/// read; every other field follows the main parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapInitializingParameters {
    pub scan_processing: ScanProcessingParameters,
    pub scan_matcher: ScanMatcherParameters,
}

impl Default for MapInitializingParameters {
    fn default() -> Self {
        Self {
            scan_processing: ScanProcessingParameters {
                voxel_size: 0.05,
                ..ScanProcessingParameters::default()
            },
            scan_matcher: ScanMatcherParameters {
                max_correspondence_distance: 0.5,
                ..ScanMatcherParameters::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryParameters {
    pub scan_processing: ScanProcessingParameters,
    pub scan_matcher: ScanMatcherParameters,
    /// Registrations with fitness at or below this value are rejected.
    pub min_acceptable_fitness: f64,
    pub map_initializing: MapInitializingParameters,
}

impl Default for OdometryParameters {
    fn default() -> Self {
        Self {
            scan_processing: ScanProcessingParameters::default(),
            scan_matcher: ScanMatcherParameters::default(),
            min_acceptable_fitness: 0.7,
            map_initializing: MapInitializingParameters::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmapParameters {
    /// Distance from the submap origin that triggers a switch (meters).
    pub submap_size: f64,
    /// Scans required in the active submap before a distance switch.
    pub min_num_range_data: usize,
    /// Scans after which a switch is forced regardless of distance (0 = off).
    pub max_num_range_data: usize,
    /// Origin distance under which two finished submaps count as adjacent.
    pub adjacency_distance: f64,
    pub map_voxel_size: f64,
    pub feature_voxel_size: f64,
    pub knn_normal_estimation: usize,
    pub build_dense_map: bool,
    pub dense_voxel_size: f64,
}

impl Default for SubmapParameters {
    fn default() -> Self {
        Self {
            submap_size: 20.0,
            min_num_range_data: 5,
            max_num_range_data: 0,
            adjacency_distance: 15.0,
            map_voxel_size: 0.1,
            feature_voxel_size: 0.3,
            knn_normal_estimation: 10,
            build_dense_map: false,
            dense_voxel_size: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopClosureParameters {
    pub max_correspondence_distance: f64,
    pub min_loop_closure_fitness: f64,
    pub max_num_iter: usize,
    pub icp_objective: IcpObjective,
    pub information_weight: f64,
}

impl Default for LoopClosureParameters {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 0.5,
            min_loop_closure_fitness: 0.35,
            max_num_iter: 50,
            icp_objective: IcpObjective::PointToPlane,
            information_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperParameters {
    pub submaps: SubmapParameters,
    pub loop_closure: LoopClosureParameters,
    pub odometry_information_weight: f64,
}

impl Default for MapperParameters {
    fn default() -> Self {
        Self {
            submaps: SubmapParameters::default(),
            loop_closure: LoopClosureParameters::default(),
            odometry_information_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseGraphParameters {
    pub max_iterations: usize,
    pub param_tolerance: f64,
    pub gradient_tolerance: f64,
    /// Huber threshold applied to loop-closure residuals.
    pub huber_scale: f64,
    /// Loop closures with a final residual norm above this are pruned.
    pub edge_prune_threshold: f64,
    /// Multiplier on loop-closure information weights.
    pub loop_closure_preference: f64,
}

impl Default for PoseGraphParameters {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            huber_scale: 0.1,
            edge_prune_threshold: 0.25,
            loop_closure_preference: 1.0,
        }
    }
}

/// Complete parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamParameters {
    pub odometry: OdometryParameters,
    pub mapper: MapperParameters,
    pub pose_graph: PoseGraphParameters,
    /// Number of odometry poses kept for interpolation.
    pub buffer_capacity: usize,
}

impl Default for SlamParameters {
    fn default() -> Self {
        Self {
            odometry: OdometryParameters::default(),
            mapper: MapperParameters::default(),
            pose_graph: PoseGraphParameters::default(),
            buffer_capacity: 1000,
        }
    }
}

impl SlamParameters {
    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<()> {
        self.odometry.validate()?;
        self.mapper.validate()?;
        self.pose_graph.validate()?;
        if self.buffer_capacity < 2 {
            return Err(invalid("buffer_capacity must be at least 2"));
        }
        Ok(())
    }
}

impl OdometryParameters {
    pub fn validate(&self) -> Result<()> {
        for processing in [&self.scan_processing, &self.map_initializing.scan_processing] {
            if !(processing.down_sampling_ratio > 0.0 && processing.down_sampling_ratio <= 1.0) {
                return Err(invalid("down_sampling_ratio must be in (0, 1]"));
            }
            if processing.voxel_size < 0.0 {
                return Err(invalid("voxel_size must be non-negative"));
            }
        }
        for matcher in [&self.scan_matcher, &self.map_initializing.scan_matcher] {
            if matcher.max_correspondence_distance <= 0.0 {
                return Err(invalid("max_correspondence_distance must be positive"));
            }
            if matcher.max_num_iter == 0 {
                return Err(invalid("max_num_iter must be positive"));
            }
        }
        if !(0.0..=1.0).contains(&self.min_acceptable_fitness) {
            return Err(invalid("min_acceptable_fitness must be in [0, 1]"));
        }
        Ok(())
    }
}

impl MapperParameters {
    pub fn validate(&self) -> Result<()> {
        let s = &self.submaps;
        if s.submap_size <= 0.0 {
            return Err(invalid("submap_size must be positive"));
        }
        if s.max_num_range_data != 0 && s.max_num_range_data < s.min_num_range_data {
            return Err(invalid("max_num_range_data must be 0 or >= min_num_range_data"));
        }
        if s.adjacency_distance < 0.0 {
            return Err(invalid("adjacency_distance must be non-negative"));
        }
        let lc = &self.loop_closure;
        if lc.max_correspondence_distance <= 0.0 {
            return Err(invalid("loop closure max_correspondence_distance must be positive"));
        }
        if !(0.0..=1.0).contains(&lc.min_loop_closure_fitness) {
            return Err(invalid("min_loop_closure_fitness must be in [0, 1]"));
        }
        if lc.information_weight <= 0.0 || self.odometry_information_weight <= 0.0 {
            return Err(invalid("information weights must be positive"));
        }
        Ok(())
    }
}

impl PoseGraphParameters {
    pub fn validate(&self) -> Result<()> {
        if self.huber_scale <= 0.0 {
            return Err(invalid("huber_scale must be positive"));
        }
        if self.loop_closure_preference <= 0.0 {
            return Err(invalid("loop_closure_preference must be positive"));
        }
        if self.edge_prune_threshold <= 0.0 {
            return Err(invalid("edge_prune_threshold must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> MappingError {
    MappingError::InvalidConfiguration(msg.to_string())
}

/// Load and validate parameters from a YAML file.
pub fn load_parameters<P: AsRef<Path>>(path: P) -> Result<SlamParameters> {
    let file = File::open(path.as_ref())?;
    let params: SlamParameters = serde_yaml::from_reader(file)?;
    params.validate()?;
    Ok(params)
}

/// Parse and validate parameters from a YAML string.
pub fn parse_parameters(yaml: &str) -> Result<SlamParameters> {
    let params: SlamParameters = serde_yaml::from_str(yaml)?;
    params.validate()?;
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SlamParameters::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
odometry:
  scan_matcher:
    icp_objective: PointToPlane
    max_num_iter: 20
mapper:
  submaps:
    submap_size: 12.5
"#;
        let params = parse_parameters(yaml).unwrap();

        assert_eq!(params.odometry.scan_matcher.icp_objective, IcpObjective::PointToPlane);
        assert_eq!(params.odometry.scan_matcher.max_num_iter, 20);
        assert_eq!(params.odometry.scan_matcher.knn_normal_estimation, 5);
        assert_eq!(params.mapper.submaps.submap_size, 12.5);
        assert_eq!(params.buffer_capacity, 1000);
    }

    #[test]
    fn test_invalid_ratio_is_rejected() {
        let yaml = r#"
odometry:
  scan_processing:
    down_sampling_ratio: 1.5
"#;
        let err = parse_parameters(yaml).unwrap_err();
        assert!(matches!(err, MappingError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.yaml");
        std::fs::write(&path, "buffer_capacity: 50\n").unwrap();

        let params = load_parameters(&path).unwrap();
        assert_eq!(params.buffer_capacity, 50);
    }
}
