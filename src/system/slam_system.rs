//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with.
//! Odometry and submap insertion run on the caller's thread. Feature
//! computation, loop closure and optimization run on two background
//! threads and never block ingestion.

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{info, warn};

use crate::cloud::PointCloud;
use crate::config::SlamParameters;
use crate::error::Result;
use crate::geometry::SE3;
use crate::mapping::{InsertOutcome, OptimizedSubmapPose, SubmapCollection};
use crate::odometry::{LidarOdometry, OdometryStatus, TransformInterpolationBuffer};
use crate::optimizer::{OptimizationProblem, SolveOutcome};
use crate::registration::{IcpRegistration, Registration};
use crate::time::Time;

use super::mapping_worker::MappingWorker;
use super::messages::{MappingJob, OptimizationRequest};
use super::observer::{MappingObserver, NoopObserver};
use super::optimization_worker::OptimizationWorker;
use super::shared_state::SharedState;

/// Capacity of the job channel between ingestion and the mapping worker.
/// When full, new jobs are dropped rather than blocking ingestion.
const MAPPING_CHANNEL_CAPACITY: usize = 8;

/// Pending optimization requests. One is enough since every solve uses the
/// latest built problem.
const OPTIMIZATION_CHANNEL_CAPACITY: usize = 1;

/// Result of feeding one scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanOutcome {
    pub odometry: OdometryStatus,
    /// `None` when odometry did not accept the scan.
    pub insert: Option<InsertOutcome>,
}

impl ScanOutcome {
    pub fn is_success(&self) -> bool {
        self.odometry.is_success() && self.insert.is_some_and(|i| i.is_inserted())
    }
}

/// Main SLAM system orchestrating odometry, mapping and optimization.
pub struct SlamSystem {
    params: SlamParameters,

    /// Shared state (submaps, optimization problem, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// Odometry runs in the calling thread.
    odometry: LidarOdometry,

    /// Channel sender for finished submaps (ingestion -> mapping worker).
    job_sender: Option<Sender<MappingJob>>,

    mapping_handle: Option<JoinHandle<()>>,
    optimization_handle: Option<JoinHandle<()>>,
}

impl SlamSystem {
    /// Create a system using ICP for both odometry and loop closure.
    pub fn new(params: SlamParameters) -> Result<Self> {
        Self::with_components(
            params,
            Box::new(IcpRegistration::new()),
            Arc::new(IcpRegistration::new()),
            Arc::new(NoopObserver),
        )
    }

    /// Create a system with custom registration engines and observer.
    ///
    /// Validates `params` and spawns the mapping and optimization threads.
    pub fn with_components(
        params: SlamParameters,
        odometry_registration: Box<dyn Registration>,
        mapping_registration: Arc<dyn Registration>,
        observer: Arc<dyn MappingObserver>,
    ) -> Result<Self> {
        params.validate()?;

        let odometry = LidarOdometry::new(params.odometry.clone(), params.buffer_capacity, odometry_registration);
        let shared = SharedState::new(
            SubmapCollection::new(params.mapper.clone(), mapping_registration),
            OptimizationProblem::new(params.pose_graph.clone()),
            observer,
        );

        let (job_sender, job_receiver) = bounded::<MappingJob>(MAPPING_CHANNEL_CAPACITY);
        let (opt_sender, opt_receiver) = bounded::<OptimizationRequest>(OPTIMIZATION_CHANNEL_CAPACITY);

        let optimization_handle = Self::spawn_optimization(shared.clone(), opt_receiver)?;
        let mapping_handle = Self::spawn_mapping(shared.clone(), job_receiver, opt_sender)?;

        Ok(Self {
            params,
            shared,
            odometry,
            job_sender: Some(job_sender),
            mapping_handle: Some(mapping_handle),
            optimization_handle: Some(optimization_handle),
        })
    }

    /// Spawn the mapping thread.
    fn spawn_mapping(
        shared: Arc<SharedState>,
        jobs: Receiver<MappingJob>,
        optimization_sender: Sender<OptimizationRequest>,
    ) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new().name("mapping".into()).spawn(move || {
            let mut worker = MappingWorker::new(shared, optimization_sender);
            worker.run(jobs);
        })?;
        Ok(handle)
    }

    /// Spawn the optimization thread.
    fn spawn_optimization(shared: Arc<SharedState>, requests: Receiver<OptimizationRequest>) -> Result<JoinHandle<()>> {
        let handle = thread::Builder::new().name("optimization".into()).spawn(move || {
            let mut worker = OptimizationWorker::new(shared);
            worker.run(requests);
        })?;
        Ok(handle)
    }

    /// Process one scan (range-sensor frame).
    ///
    /// This runs in the calling thread. Scans must arrive in time order;
    /// older scans are rejected.
    pub fn add_range_scan(&mut self, cloud: &PointCloud, time: Time) -> ScanOutcome {
        let odometry = self.odometry.add_range_scan(cloud, time);
        if !odometry.is_success() {
            return ScanOutcome { odometry, insert: None };
        }

        let odom_to_range_sensor = self.odometry.cumulative_pose();
        self.shared.observer().on_odometry(time, &odom_to_range_sensor);

        let map_to_range_sensor = self.shared.map_to_odom().compose(&odom_to_range_sensor);
        let insert = self.shared.submaps.insert_scan(
            cloud,
            self.odometry.preprocessed_cloud(),
            &map_to_range_sensor,
            time,
        );

        if let Some(finished) = insert.finished_submap() {
            self.shared.observer().on_submap_finished(finished);
            self.notify_mapping(MappingJob::SubmapFinished(finished));
        }

        ScanOutcome {
            odometry,
            insert: Some(insert),
        }
    }

    fn notify_mapping(&self, job: MappingJob) {
        let Some(sender) = &self.job_sender else {
            return;
        };
        match sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => warn!("Mapping queue full, dropping {:?}", job),
            Err(TrySendError::Disconnected(job)) => warn!("Mapping worker is gone, dropping {:?}", job),
        }
    }

    /// Interpolated odom->range_sensor pose.
    pub fn get_odom_to_range_sensor(&self, time: Time) -> Result<SE3> {
        self.odometry.get_odom_to_range_sensor(time)
    }

    /// Interpolated map->range_sensor pose, including the current drift
    /// correction.
    pub fn get_map_to_range_sensor(&self, time: Time) -> Result<SE3> {
        Ok(self.shared.map_to_odom().compose(&self.get_odom_to_range_sensor(time)?))
    }

    pub fn map_to_odom(&self) -> SE3 {
        self.shared.map_to_odom()
    }

    /// Optimized submap poses from the last completed solve.
    pub fn get_node_values(&self) -> Vec<OptimizedSubmapPose> {
        self.shared.optimization.get_node_values()
    }

    /// Write the pose graph as CSV.
    pub fn dump_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.shared.optimization.dump_to_file(path)
    }

    /// Write every submap (map frame) to `dir`.
    pub fn save_submaps<P: AsRef<Path>>(&self, dir: P) -> anyhow::Result<usize> {
        crate::io::save_submaps(dir, &self.shared.submaps)
    }

    /// Write the merged map, voxelized at the map voxel size.
    pub fn save_map<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<usize> {
        crate::io::save_map(path, &self.shared.submaps, self.params.mapper.submaps.map_voxel_size)
    }

    pub fn submaps(&self) -> &SubmapCollection {
        &self.shared.submaps
    }

    pub fn optimization(&self) -> &OptimizationProblem {
        &self.shared.optimization
    }

    pub fn odometry(&self) -> &LidarOdometry {
        &self.odometry
    }

    /// Odometry pose history, readable from any thread while scans are added.
    pub fn odometry_buffer(&self) -> Arc<TransformInterpolationBuffer> {
        self.odometry.buffer_handle()
    }

    pub fn parameters(&self) -> &SlamParameters {
        &self.params
    }

    /// Stop the workers, then run one last mapping pass and solve on the
    /// calling thread so no finished submap is left unprocessed.
    pub fn finish(&mut self) -> Result<SolveOutcome> {
        self.shutdown();
        self.shared.process_finished_submap()?;
        Ok(self.shared.optimize())
    }

    /// Shutdown the system gracefully.
    ///
    /// Signals both workers, closes the job channel and waits for them. An
    /// in-flight solve runs to completion first.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        self.job_sender = None;

        if let Some(handle) = self.mapping_handle.take() {
            if handle.join().is_err() {
                warn!("Mapping worker panicked");
            }
        }
        if let Some(handle) = self.optimization_handle.take() {
            if handle.join().is_err() {
                warn!("Optimization worker panicked");
            }
        }
        info!("SLAM system shut down");
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        if self.mapping_handle.is_some() || self.optimization_handle.is_some() {
            self.shutdown();
        }
    }
}
