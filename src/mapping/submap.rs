//! A bounded local map accumulating consecutive scans under one pose.

use nalgebra::Vector3;

use crate::cloud::{PointCloud, estimate_normals, normal_search_radius, voxelize};
use crate::config::SubmapParameters;
use crate::geometry::SE3;

use super::types::SubmapId;

/// Registration-ready summary of a submap, in the submap frame.
#[derive(Debug, Clone)]
pub struct SubmapFeatures {
    /// Voxelized map cloud with normals.
    pub cloud: PointCloud,
    pub centroid: Vector3<f64>,
}

impl SubmapFeatures {
    /// Voxelize `map_cloud` and estimate normals. `None` for an empty cloud.
    pub fn from_cloud(map_cloud: &PointCloud, params: &SubmapParameters) -> Option<Self> {
        let centroid = map_cloud.centroid()?;
        let mut cloud = voxelize(map_cloud, params.feature_voxel_size);
        estimate_normals(
            &mut cloud,
            params.knn_normal_estimation,
            normal_search_radius(params.feature_voxel_size),
        );
        Some(Self { cloud, centroid })
    }
}

/// Local map.
///
/// Points are stored in the submap frame, so moving the submap only changes
/// `map_to_submap`.
#[derive(Debug, Clone)]
pub struct Submap {
    id: SubmapId,
    map_to_submap: SE3,
    map_cloud: PointCloud,
    dense_cloud: PointCloud,
    features: Option<SubmapFeatures>,
    is_finished: bool,
    num_scans: usize,
}

impl Submap {
    pub fn new(id: SubmapId, map_to_submap: SE3) -> Self {
        Self {
            id,
            map_to_submap,
            map_cloud: PointCloud::new(),
            dense_cloud: PointCloud::new(),
            features: None,
            is_finished: false,
            num_scans: 0,
        }
    }

    /// Add a scan given in the range-sensor frame.
    pub fn insert(&mut self, cloud: &PointCloud, map_to_range_sensor: &SE3, map_voxel_size: f64) {
        let submap_to_range_sensor = self.map_to_submap.between(map_to_range_sensor);
        self.map_cloud.extend_from(&cloud.transformed(&submap_to_range_sensor));
        self.map_cloud = voxelize(&self.map_cloud, map_voxel_size);
        self.num_scans += 1;
    }

    /// Add a raw scan to the dense cloud.
    pub fn insert_dense(&mut self, cloud: &PointCloud, map_to_range_sensor: &SE3, dense_voxel_size: f64) {
        let submap_to_range_sensor = self.map_to_submap.between(map_to_range_sensor);
        self.dense_cloud.extend_from(&cloud.transformed(&submap_to_range_sensor));
        self.dense_cloud = voxelize(&self.dense_cloud, dense_voxel_size);
    }

    /// Once a finished submap has features they are never recomputed.
    pub fn needs_features(&self) -> bool {
        !(self.is_finished && self.features.is_some())
    }

    pub fn set_features(&mut self, features: SubmapFeatures) {
        self.features = Some(features);
    }

    /// One-way transition. Returns true only on the call that finished it.
    pub fn mark_finished(&mut self) -> bool {
        let changed = !self.is_finished;
        self.is_finished = true;
        changed
    }

    pub fn id(&self) -> SubmapId {
        self.id
    }

    pub fn map_to_submap(&self) -> SE3 {
        self.map_to_submap
    }

    pub fn set_map_to_submap(&mut self, pose: SE3) {
        self.map_to_submap = pose;
    }

    /// Submap origin in the map frame.
    pub fn origin(&self) -> Vector3<f64> {
        self.map_to_submap.translation
    }

    pub fn map_cloud(&self) -> &PointCloud {
        &self.map_cloud
    }

    pub fn dense_cloud(&self) -> &PointCloud {
        &self.dense_cloud
    }

    /// Map cloud expressed in the map frame.
    pub fn map_cloud_in_map_frame(&self) -> PointCloud {
        self.map_cloud.transformed(&self.map_to_submap)
    }

    pub fn features(&self) -> Option<&SubmapFeatures> {
        self.features.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished
    }

    pub fn num_scans(&self) -> usize {
        self.num_scans
    }
}
