//! Pose-graph problem over submaps with single-flight solving.
//!
//! Constraints accumulate until `build_optimization_problem` turns them
//! into a graph and marks the problem ready. `solve` then runs at most once
//! per build and never concurrently with itself: overlapping requests are
//! dropped, not queued.

use std::path::Path;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::PoseGraphParameters;
use crate::error::{MappingError, Result};
use crate::mapping::{Constraint, ConstraintKind, OptimizedSubmapPose, SubmapCollection};

use super::pose_graph::{PoseGraph, PoseGraphEdge, PoseGraphNode, solve_pose_graph};

/// Externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationState {
    Idle,
    /// Built and waiting for `solve`.
    Ready,
    /// A solve is in flight.
    Running,
}

/// Summary of a completed solve.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveSummary {
    pub num_nodes: usize,
    pub num_edges: usize,
    pub num_loop_closures: usize,
    pub num_pruned: usize,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub elapsed_ms: f64,
}

/// Result of [`OptimizationProblem::solve`].
#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    /// Not ready, or another solve is in flight. Try again later.
    Skipped,
    Solved(SolveSummary),
}

#[derive(Debug, Default)]
struct ConstraintSet {
    odometry: Vec<Constraint>,
    loop_closures: Vec<Constraint>,
}

#[derive(Debug, Default)]
struct SolveFlags {
    ready: bool,
    running: bool,
}

/// Clears the running flag on drop.
struct RunningGuard<'a>(&'a Mutex<SolveFlags>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().running = false;
    }
}

/// Pose-graph optimization problem.
pub struct OptimizationProblem {
    params: RwLock<PoseGraphParameters>,
    constraints: Mutex<ConstraintSet>,
    flags: Mutex<SolveFlags>,
    graph: Mutex<PoseGraph>,
    node_values: RwLock<Vec<OptimizedSubmapPose>>,
}

impl OptimizationProblem {
    pub fn new(params: PoseGraphParameters) -> Self {
        Self {
            params: RwLock::new(params),
            constraints: Mutex::new(ConstraintSet::default()),
            flags: Mutex::new(SolveFlags::default()),
            graph: Mutex::new(PoseGraph::default()),
            node_values: RwLock::new(Vec::new()),
        }
    }

    pub fn set_parameters(&self, params: PoseGraphParameters) {
        *self.params.write() = params;
    }

    pub fn add_odometry_constraint(&self, constraint: Constraint) {
        self.constraints.lock().odometry.push(constraint);
    }

    pub fn add_loop_closure_constraint(&self, constraint: Constraint) {
        self.constraints.lock().loop_closures.push(constraint);
    }

    /// Append constraints, routed by kind.
    pub fn add_constraints(&self, constraints: Vec<Constraint>) {
        let mut set = self.constraints.lock();
        for c in constraints {
            match c.kind {
                ConstraintKind::Odometry => set.odometry.push(c),
                ConstraintKind::LoopClosure => set.loop_closures.push(c),
            }
        }
    }

    pub fn clear_odometry_constraints(&self) {
        self.constraints.lock().odometry.clear();
    }

    pub fn clear_loop_closure_constraints(&self) {
        self.constraints.lock().loop_closures.clear();
    }

    pub fn num_odometry_constraints(&self) -> usize {
        self.constraints.lock().odometry.len()
    }

    pub fn num_loop_closure_constraints(&self) -> usize {
        self.constraints.lock().loop_closures.len()
    }

    /// Rebuild the graph from the current submap poses and stored
    /// constraints, then mark the problem ready.
    ///
    /// Fails without touching the graph if a constraint references a submap
    /// that does not exist.
    pub fn build_optimization_problem(&self, submaps: &SubmapCollection) -> Result<()> {
        let nodes: Vec<PoseGraphNode> = submaps
            .submap_poses()
            .into_iter()
            .map(|(submap_id, map_to_submap)| PoseGraphNode {
                submap_id,
                map_to_submap,
            })
            .collect();

        let loop_closure_preference = self.params.read().loop_closure_preference;
        let edges = {
            let set = self.constraints.lock();
            let mut edges = Vec::with_capacity(set.odometry.len() + set.loop_closures.len());
            for c in set.odometry.iter().chain(set.loop_closures.iter()) {
                for id in [c.source_submap_id, c.target_submap_id] {
                    if !nodes.iter().any(|n| n.submap_id == id) {
                        return Err(MappingError::UnknownSubmap(id));
                    }
                }
                let is_loop = c.kind == ConstraintKind::LoopClosure;
                edges.push(PoseGraphEdge {
                    source: c.source_submap_id,
                    target: c.target_submap_id,
                    measurement: c.relative_pose,
                    information: if is_loop {
                        c.information_weight * loop_closure_preference
                    } else {
                        c.information_weight
                    },
                    robust: is_loop,
                    kind: c.kind,
                });
            }
            edges
        };

        debug!("Pose graph built: {} nodes, {} edges", nodes.len(), edges.len());
        *self.graph.lock() = PoseGraph { nodes, edges };
        self.flags.lock().ready = true;
        Ok(())
    }

    /// Optimize the last built graph if ready and not already running.
    pub fn solve(&self) -> SolveOutcome {
        {
            let mut flags = self.flags.lock();
            if !flags.ready || flags.running {
                return SolveOutcome::Skipped;
            }
            flags.running = true;
            flags.ready = false;
        }
        let _running = RunningGuard(&self.flags);

        let start = Instant::now();
        let graph = self.graph.lock().clone();
        let params = self.params.read().clone();

        let result = solve_pose_graph(&graph, &params);
        *self.node_values.write() = result.poses;

        let summary = SolveSummary {
            num_nodes: graph.nodes.len(),
            num_edges: graph.edges.len(),
            num_loop_closures: graph.num_loop_closures(),
            num_pruned: result.pruned_edges.len(),
            iterations: result.iterations,
            initial_error: result.initial_error,
            final_error: result.final_error,
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        info!(
            "Pose graph solved: {} nodes, {} edges ({} loop closures, {} pruned), error {:.6} -> {:.6}, \
             {} iterations, {:.1} ms",
            summary.num_nodes,
            summary.num_edges,
            summary.num_loop_closures,
            summary.num_pruned,
            summary.initial_error,
            summary.final_error,
            summary.iterations,
            summary.elapsed_ms
        );
        SolveOutcome::Solved(summary)
    }

    /// Poses from the last completed solve.
    pub fn get_node_values(&self) -> Vec<OptimizedSubmapPose> {
        self.node_values.read().clone()
    }

    pub fn state(&self) -> OptimizationState {
        let flags = self.flags.lock();
        if flags.running {
            OptimizationState::Running
        } else if flags.ready {
            OptimizationState::Ready
        } else {
            OptimizationState::Idle
        }
    }

    pub fn is_ready_to_optimize(&self) -> bool {
        self.flags.lock().ready
    }

    pub fn is_running_optimization(&self) -> bool {
        self.flags.lock().running
    }

    /// Write the current graph and node values as CSV.
    ///
    /// Columns: `record,id,target_id,tx,ty,tz,qx,qy,qz,qw,information`.
    /// `record` is `node` for optimized poses (initial poses if nothing has
    /// been solved yet) or the edge kind.
    pub fn dump_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let graph = self.graph.lock().clone();
        let mut nodes = self.get_node_values();
        if nodes.is_empty() {
            nodes = graph
                .nodes
                .iter()
                .map(|n| OptimizedSubmapPose {
                    submap_id: n.submap_id,
                    map_to_submap: n.map_to_submap,
                })
                .collect();
        }

        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "record",
            "id",
            "target_id",
            "tx",
            "ty",
            "tz",
            "qx",
            "qy",
            "qz",
            "qw",
            "information",
        ])?;

        for node in &nodes {
            let t = node.map_to_submap.translation;
            let q = node.map_to_submap.rotation;
            writer.write_record([
                "node".to_string(),
                node.submap_id.0.to_string(),
                String::new(),
                t.x.to_string(),
                t.y.to_string(),
                t.z.to_string(),
                q.i.to_string(),
                q.j.to_string(),
                q.k.to_string(),
                q.w.to_string(),
                String::new(),
            ])?;
        }

        for edge in &graph.edges {
            let t = edge.measurement.translation;
            let q = edge.measurement.rotation;
            let record = match edge.kind {
                ConstraintKind::Odometry => "odometry",
                ConstraintKind::LoopClosure => "loop_closure",
            };
            writer.write_record([
                record.to_string(),
                edge.source.0.to_string(),
                edge.target.0.to_string(),
                t.x.to_string(),
                t.y.to_string(),
                t.z.to_string(),
                q.i.to_string(),
                q.j.to_string(),
                q.k.to_string(),
                q.w.to_string(),
                edge.information.to_string(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }
}

impl Default for OptimizationProblem {
    fn default() -> Self {
        Self::new(PoseGraphParameters::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::PointCloud;
    use crate::config::MapperParameters;
    use crate::geometry::SE3;
    use crate::mapping::SubmapId;
    use crate::registration::Registration;
    use crate::registration::scripted::ScriptedRegistration;
    use crate::time::Time;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn at(x: f64) -> SE3 {
        SE3::from_translation(Vector3::new(x, 0.0, 0.0))
    }

    /// Three submaps along x, with their two odometry constraints pending.
    fn submaps() -> SubmapCollection {
        let mut params = MapperParameters::default();
        params.submaps.submap_size = 1.0;
        params.submaps.min_num_range_data = 1;
        let registration: Arc<dyn Registration> = Arc::new(ScriptedRegistration::new(0.0));
        let collection = SubmapCollection::new(params, registration);
        let cloud = PointCloud::from_points(vec![Vector3::new(1.0, 0.0, 0.0)]);
        for (i, x) in [0.0, 1.5, 3.0].into_iter().enumerate() {
            collection.insert_scan(&cloud, &cloud, &at(x), Time(i as u64));
        }
        collection
    }

    fn built_problem() -> (OptimizationProblem, SubmapCollection) {
        let collection = submaps();
        let problem = OptimizationProblem::default();
        problem.add_constraints(collection.get_and_clear_constraints());
        problem.build_optimization_problem(&collection).unwrap();
        (problem, collection)
    }

    #[test]
    fn test_adding_constraints_does_not_mark_ready() {
        let problem = OptimizationProblem::default();
        problem.add_odometry_constraint(Constraint::odometry(SubmapId(0), &at(0.0), SubmapId(1), &at(1.0), 1.0));

        assert_eq!(problem.state(), OptimizationState::Idle);
        assert_eq!(problem.solve(), SolveOutcome::Skipped);
    }

    #[test]
    fn test_build_then_solve() {
        let (problem, _collection) = built_problem();
        assert_eq!(problem.num_odometry_constraints(), 2);
        assert_eq!(problem.state(), OptimizationState::Ready);

        let SolveOutcome::Solved(summary) = problem.solve() else {
            panic!("expected a solve");
        };

        assert_eq!(summary.num_nodes, 3);
        assert_eq!(summary.num_edges, 2);
        assert_eq!(problem.state(), OptimizationState::Idle);
        let values = problem.get_node_values();
        assert_eq!(values.len(), 3);
        assert_relative_eq!(values[2].map_to_submap.translation.x, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_second_solve_without_build_is_skipped() {
        let (problem, _collection) = built_problem();
        assert!(matches!(problem.solve(), SolveOutcome::Solved(_)));
        assert_eq!(problem.solve(), SolveOutcome::Skipped);
    }

    #[test]
    fn test_solve_while_running_is_skipped() {
        let (problem, _collection) = built_problem();
        problem.flags.lock().running = true;

        assert_eq!(problem.state(), OptimizationState::Running);
        assert_eq!(problem.solve(), SolveOutcome::Skipped);
        assert!(problem.get_node_values().is_empty());
        assert!(problem.is_ready_to_optimize());

        problem.flags.lock().running = false;
        assert!(matches!(problem.solve(), SolveOutcome::Solved(_)));
    }

    #[test]
    fn test_concurrent_solves_run_once() {
        let (problem, _collection) = built_problem();
        let problem = Arc::new(problem);
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let problem = Arc::clone(&problem);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    problem.solve()
                })
            })
            .collect();

        let solved = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| matches!(o, SolveOutcome::Solved(_)))
            .count();

        assert_eq!(solved, 1);
        assert!(!problem.is_running_optimization());
    }

    #[test]
    fn test_unknown_submap_fails_build() {
        let collection = submaps();
        let problem = OptimizationProblem::default();
        problem.add_loop_closure_constraint(Constraint::loop_closure(SubmapId(0), SubmapId(9), SE3::identity(), 1.0));

        let err = problem.build_optimization_problem(&collection).unwrap_err();

        assert!(matches!(err, MappingError::UnknownSubmap(SubmapId(9))));
        assert_eq!(problem.state(), OptimizationState::Idle);
    }

    #[test]
    fn test_node_values_are_idempotent() {
        let (problem, _collection) = built_problem();
        problem.solve();
        assert_eq!(problem.get_node_values(), problem.get_node_values());
    }

    #[test]
    fn test_clear_constraints_by_kind() {
        let problem = OptimizationProblem::default();
        problem.add_constraints(vec![
            Constraint::odometry(SubmapId(0), &at(0.0), SubmapId(1), &at(1.0), 1.0),
            Constraint::loop_closure(SubmapId(0), SubmapId(2), SE3::identity(), 1.0),
        ]);
        assert_eq!(problem.num_loop_closure_constraints(), 1);

        problem.clear_odometry_constraints();
        assert_eq!(problem.num_odometry_constraints(), 0);
        assert_eq!(problem.num_loop_closure_constraints(), 1);

        problem.clear_loop_closure_constraints();
        assert_eq!(problem.num_loop_closure_constraints(), 0);
    }

    #[test]
    fn test_dump_to_file() {
        let (problem, _collection) = built_problem();
        problem.solve();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.csv");

        problem.dump_to_file(&path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.iter().filter(|r| &r[0] == "node").count(), 3);
        assert_eq!(records.iter().filter(|r| &r[0] == "odometry").count(), 2);
    }
}
