//! State shared between ingestion and the background workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::geometry::SE3;
use crate::mapping::{LoopClosureBuild, SubmapCollection};
use crate::optimizer::{OptimizationProblem, SolveOutcome};

use super::observer::MappingObserver;

/// Shared state accessible by the ingestion thread and both workers.
pub struct SharedState {
    /// Written by ingestion, read and post-processed by the mapping worker.
    pub submaps: SubmapCollection,

    /// Fed by the mapping worker, solved by the optimization worker.
    pub optimization: OptimizationProblem,

    /// Drift correction applied on top of odometry.
    map_to_odom: RwLock<SE3>,

    observer: Arc<dyn MappingObserver>,

    /// Request both workers to exit.
    shutdown_requested: AtomicBool,
}

impl SharedState {
    pub fn new(
        submaps: SubmapCollection,
        optimization: OptimizationProblem,
        observer: Arc<dyn MappingObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            submaps,
            optimization,
            map_to_odom: RwLock::new(SE3::identity()),
            observer,
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn map_to_odom(&self) -> SE3 {
        *self.map_to_odom.read()
    }

    pub fn observer(&self) -> &dyn MappingObserver {
        self.observer.as_ref()
    }

    /// Feature computation, loop-closure search and problem rebuild for the
    /// most recently finished submap.
    ///
    /// Returns true if a new optimization problem was built.
    pub fn process_finished_submap(&self) -> Result<bool> {
        self.submaps.compute_features_in_last_finished_submap();

        if let LoopClosureBuild::Built { attempted, accepted } = self.submaps.build_loop_closure_constraints() {
            self.observer.on_loop_closures(attempted, accepted);
        }

        let constraints = self.submaps.get_and_clear_constraints();
        if constraints.is_empty() {
            return Ok(false);
        }
        debug!("Adding {} constraints to the optimization problem", constraints.len());
        self.optimization.add_constraints(constraints);
        self.optimization.build_optimization_problem(&self.submaps)?;
        Ok(true)
    }

    /// Solve and, on success, move the submaps and the map->odom correction.
    pub fn optimize(&self) -> SolveOutcome {
        let outcome = self.optimization.solve();
        if let SolveOutcome::Solved(summary) = &outcome {
            let poses = self.optimization.get_node_values();
            if let Some(correction) = self.submaps.apply_optimized_poses(&poses) {
                let mut map_to_odom = self.map_to_odom.write();
                *map_to_odom = correction.compose(&map_to_odom);
            }
            self.observer.on_optimization(summary, &poses);
        }
        outcome
    }

    /// Request shutdown of the worker threads.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }
}
