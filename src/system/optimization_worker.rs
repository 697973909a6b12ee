//! Optimization worker - runs pose-graph solves on request.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::optimizer::SolveOutcome;

use super::messages::OptimizationRequest;
use super::shared_state::SharedState;

/// Timeout for receiving requests. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Optimization thread state.
pub struct OptimizationWorker {
    shared: Arc<SharedState>,
    solved: usize,
    skipped: usize,
}

impl OptimizationWorker {
    pub fn new(shared: Arc<SharedState>) -> Self {
        Self {
            shared,
            solved: 0,
            skipped: 0,
        }
    }

    /// Main thread loop. Runs until shutdown is requested or every sender is
    /// dropped.
    pub fn run(&mut self, requests: Receiver<OptimizationRequest>) {
        info!("Optimization worker started");

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            match requests.recv_timeout(RECV_TIMEOUT) {
                Ok(OptimizationRequest) => match self.shared.optimize() {
                    SolveOutcome::Solved(_) => self.solved += 1,
                    SolveOutcome::Skipped => {
                        self.skipped += 1;
                        debug!("Optimization skipped, nothing ready");
                    }
                },
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Optimization request channel disconnected");
                    break;
                }
            }
        }

        info!(
            "Optimization worker exiting. Stats: solved={}, skipped={}",
            self.solved, self.skipped
        );
    }
}
