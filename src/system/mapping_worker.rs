//! Mapping worker - background post-processing of finished submaps.
//!
//! For every finished submap:
//! 1. Computes submap features
//! 2. Searches for loop closures
//! 3. Drains new constraints into the optimization problem and rebuilds it
//! 4. Asks the optimization worker to solve

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::messages::{MappingJob, OptimizationRequest};
use super::shared_state::SharedState;

/// Timeout for receiving jobs. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct MappingWorkerStats {
    jobs_processed: usize,
    problems_built: usize,
    optimizations_requested: usize,
    optimizations_dropped: usize,
}

/// Mapping thread state.
pub struct MappingWorker {
    shared: Arc<SharedState>,
    optimization_sender: Sender<OptimizationRequest>,
    stats: MappingWorkerStats,
}

impl MappingWorker {
    pub fn new(shared: Arc<SharedState>, optimization_sender: Sender<OptimizationRequest>) -> Self {
        Self {
            shared,
            optimization_sender,
            stats: MappingWorkerStats::default(),
        }
    }

    /// Main thread loop. Runs until shutdown is requested or the channel is
    /// closed.
    pub fn run(&mut self, jobs: Receiver<MappingJob>) {
        info!("Mapping worker started");

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            match jobs.recv_timeout(RECV_TIMEOUT) {
                Ok(job) => self.process_job(job),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Mapping job channel disconnected");
                    break;
                }
            }
        }

        info!(
            "Mapping worker exiting. Stats: jobs={}, problems_built={}, optimizations requested={}, dropped={}",
            self.stats.jobs_processed,
            self.stats.problems_built,
            self.stats.optimizations_requested,
            self.stats.optimizations_dropped
        );
    }

    fn process_job(&mut self, job: MappingJob) {
        self.stats.jobs_processed += 1;
        let MappingJob::SubmapFinished(submap_id) = job;
        debug!("Mapping worker: processing finished submap {}", submap_id);

        match self.shared.process_finished_submap() {
            Ok(true) => {
                self.stats.problems_built += 1;
                self.request_optimization();
            }
            Ok(false) => {}
            Err(e) => warn!("Mapping worker: failed to build optimization problem: {}", e),
        }
    }

    fn request_optimization(&mut self) {
        match self.optimization_sender.try_send(OptimizationRequest) {
            Ok(()) => self.stats.optimizations_requested += 1,
            Err(TrySendError::Full(_)) => {
                // A pending request will pick up the rebuilt problem.
                self.stats.optimizations_dropped += 1;
                debug!("Optimization request dropped, one is already queued");
            }
            Err(TrySendError::Disconnected(_)) => warn!("Optimization worker is gone"),
        }
    }
}
