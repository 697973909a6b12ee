//! Scan-to-scan odometry.
//!
//! Each scan is cropped, downsampled and registered against the previous
//! processed scan. Accepted increments are chained into the cumulative
//! odom->range_sensor pose and pushed into the interpolation buffer.

use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, warn};

use crate::cloud::{
    CroppingVolume, PointCloud, cropping_volume_factory, estimate_normals, normal_search_radius,
    random_down_sample, voxelize,
};
use crate::config::{IcpObjective, OdometryParameters, ScanMatcherParameters, ScanProcessingParameters};
use crate::error::{MappingError, Result};
use crate::geometry::SE3;
use crate::registration::{ConvergenceCriteria, Registration, RegistrationRequest};
use crate::time::Time;

use super::interpolation_buffer::TransformInterpolationBuffer;

/// Seed for the downsampling RNG, so replays are reproducible.
const DOWNSAMPLE_SEED: u64 = 0x5eed;

/// Odometry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdometryState {
    /// No scan received yet.
    Uninitialized,
    /// A reference scan exists and poses are being produced.
    Tracking,
}

/// Outcome of [`LidarOdometry::add_range_scan`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OdometryStatus {
    /// First scan stored as reference, identity pushed.
    Initialized,
    /// Registration accepted and pose advanced.
    Tracked,
    /// Timestamp older than the last accepted scan. Nothing changed.
    RejectedOutOfOrder,
    /// Fitness at or below the threshold. Reference replaced, pose unchanged.
    RegistrationFailed { fitness: f64 },
}

impl OdometryStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OdometryStatus::Initialized | OdometryStatus::Tracked)
    }
}

/// LIDAR odometry from consecutive scans.
pub struct LidarOdometry {
    params: OdometryParameters,
    registration: Box<dyn Registration>,
    cropper: Box<dyn CroppingVolume>,
    rng: StdRng,

    state: OdometryState,
    /// Reference for the next registration, in the previous sensor frame.
    cloud_prev: PointCloud,
    odom_to_range_sensor: SE3,
    /// Shared with pose readers on other threads.
    buffer: Arc<TransformInterpolationBuffer>,
    last_measurement_time: Option<Time>,

    is_init_map: bool,
    map_init_transform: SE3,
}

impl LidarOdometry {
    pub fn new(params: OdometryParameters, buffer_capacity: usize, registration: Box<dyn Registration>) -> Self {
        let cropper = cropping_volume_factory(&params.scan_processing.cropper);
        Self {
            params,
            registration,
            cropper,
            rng: StdRng::seed_from_u64(DOWNSAMPLE_SEED),
            state: OdometryState::Uninitialized,
            cloud_prev: PointCloud::new(),
            odom_to_range_sensor: SE3::identity(),
            buffer: Arc::new(TransformInterpolationBuffer::new(buffer_capacity)),
            last_measurement_time: None,
            is_init_map: false,
            map_init_transform: SE3::identity(),
        }
    }

    /// Process one scan (sensor frame).
    pub fn add_range_scan(&mut self, cloud: &PointCloud, time: Time) -> OdometryStatus {
        let Some(last_time) = self.last_measurement_time else {
            return self.initialize(cloud, time);
        };

        if time < last_time {
            warn!("Odometry: scan at {} arrived after {}, rejecting", time, last_time);
            return OdometryStatus::RejectedOutOfOrder;
        }

        let start = Instant::now();
        let (processing, matcher) = self.active_parameters();
        let initial_guess = if self.is_init_map {
            self.map_init_transform
        } else {
            SE3::identity()
        };

        let processed = self.preprocess(cloud, &processing, &matcher);

        let request = RegistrationRequest {
            max_correspondence_distance: matcher.max_correspondence_distance,
            initial_guess,
            objective: matcher.icp_objective,
            criteria: ConvergenceCriteria::with_max_iteration(matcher.max_num_iter),
        };
        let result = self.registration.register(&self.cloud_prev, &processed, &request);

        if result.fitness <= self.params.min_acceptable_fitness {
            warn!(
                "Odometry failed: fitness {:.3} (min {:.3}), rmse {:.4}, target {} pts, reference {} pts, \
                 buffer {} samples, {:.1} ms",
                result.fitness,
                self.params.min_acceptable_fitness,
                result.inlier_rmse,
                cloud.len(),
                self.cloud_prev.len(),
                self.buffer.len(),
                start.elapsed().as_secs_f64() * 1000.0
            );
            if !processed.is_empty() {
                self.cloud_prev = processed;
            }
            return OdometryStatus::RegistrationFailed {
                fitness: result.fitness,
            };
        }

        let candidate = self.odom_to_range_sensor.compose(&result.transformation.inverse());
        // The buffer's last sample time equals last_time, so this cannot fail.
        if let Err(e) = self.buffer.push(time, candidate) {
            warn!("Odometry: {}", e);
            return OdometryStatus::RejectedOutOfOrder;
        }

        self.is_init_map = false;
        self.odom_to_range_sensor = candidate;
        self.cloud_prev = processed;
        self.last_measurement_time = Some(time);

        debug!(
            "Odometry: fitness {:.3}, rmse {:.4}, {:.1} ms",
            result.fitness,
            result.inlier_rmse,
            start.elapsed().as_secs_f64() * 1000.0
        );
        OdometryStatus::Tracked
    }

    /// Like [`LidarOdometry::add_range_scan`], with rejections as errors.
    pub fn try_add_range_scan(&mut self, cloud: &PointCloud, time: Time) -> Result<OdometryStatus> {
        let last = self.last_measurement_time;
        match self.add_range_scan(cloud, time) {
            OdometryStatus::RejectedOutOfOrder => Err(MappingError::OutOfOrderInput {
                time,
                last: last.unwrap_or(time),
            }),
            OdometryStatus::RegistrationFailed { fitness } => Err(MappingError::RegistrationFailure {
                fitness,
                threshold: self.params.min_acceptable_fitness,
            }),
            status => Ok(status),
        }
    }

    fn initialize(&mut self, cloud: &PointCloud, time: Time) -> OdometryStatus {
        if let Err(e) = self.buffer.push(time, self.odom_to_range_sensor) {
            warn!("Odometry: {}", e);
            return OdometryStatus::RejectedOutOfOrder;
        }
        self.cloud_prev = cloud.clone();
        self.last_measurement_time = Some(time);
        self.state = OdometryState::Tracking;
        debug!("Odometry initialized at {} with {} points", time, cloud.len());
        OdometryStatus::Initialized
    }

    /// Parameters for the next registration.
    ///
    /// Map initialization overrides only voxel size, downsampling ratio and
    /// correspondence distance. Objective, kNN and iteration budget stay.
    fn active_parameters(&self) -> (ScanProcessingParameters, ScanMatcherParameters) {
        let mut processing = self.params.scan_processing.clone();
        let mut matcher = self.params.scan_matcher.clone();
        if self.is_init_map {
            let init = &self.params.map_initializing;
            processing.voxel_size = init.scan_processing.voxel_size;
            processing.down_sampling_ratio = init.scan_processing.down_sampling_ratio;
            matcher.max_correspondence_distance = init.scan_matcher.max_correspondence_distance;
        }
        (processing, matcher)
    }

    fn preprocess(
        &mut self,
        cloud: &PointCloud,
        processing: &ScanProcessingParameters,
        matcher: &ScanMatcherParameters,
    ) -> PointCloud {
        let cropped = self.cropper.crop(cloud);
        let voxelized = voxelize(&cropped, processing.voxel_size);
        let mut processed = random_down_sample(&voxelized, processing.down_sampling_ratio, &mut self.rng);

        if matcher.icp_objective == IcpObjective::PointToPlane {
            estimate_normals(
                &mut processed,
                matcher.knn_normal_estimation,
                normal_search_radius(processing.voxel_size),
            );
            processed.normalize_normals();
        }
        processed
    }

    /// Interpolated odom->range_sensor pose at `time`.
    pub fn get_odom_to_range_sensor(&self, time: Time) -> Result<SE3> {
        self.buffer.get(time)
    }

    /// Replace parameters. Takes effect from the next scan.
    pub fn set_parameters(&mut self, params: OdometryParameters) {
        self.cropper = cropping_volume_factory(&params.scan_processing.cropper);
        self.params = params;
    }

    /// Use `transform` as the initial guess until the next accepted scan,
    /// with the map-initialization overrides.
    pub fn set_initial_transform(&mut self, transform: SE3) {
        self.map_init_transform = transform;
        self.is_init_map = true;
    }

    pub fn parameters(&self) -> &OdometryParameters {
        &self.params
    }

    /// Current registration reference.
    pub fn preprocessed_cloud(&self) -> &PointCloud {
        &self.cloud_prev
    }

    pub fn buffer(&self) -> &TransformInterpolationBuffer {
        &self.buffer
    }

    /// Handle for querying poses from other threads while scans are added.
    pub fn buffer_handle(&self) -> Arc<TransformInterpolationBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn has_processed_measurements(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn state(&self) -> OdometryState {
        self.state
    }

    pub fn cumulative_pose(&self) -> SE3 {
        self.odom_to_range_sensor
    }

    pub fn is_map_initializing(&self) -> bool {
        self.is_init_map
    }
}
