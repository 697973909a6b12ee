//! Pose graph optimization over submap poses.
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: Nodes and edges are snapshotted into a [`PoseGraph`]
//! 2. SOLVE: Levenberg-Marquardt over all non-anchor poses, without locks
//! 3. APPLY: The caller writes back [`PoseGraphResult::poses`]
//!
//! Loop-closure edges are robust: they are Huber-weighted during the solve,
//! and edges still disagreeing with the solution afterwards are pruned before
//! a single re-solve.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix6, Vector6};
use tracing::{debug, warn};

use crate::config::PoseGraphParameters;
use crate::geometry::SE3;
use crate::mapping::{ConstraintKind, OptimizedSubmapPose, SubmapId};

/// Parameters per pose: translation + scaled-axis rotation.
const POSE_DOF: usize = 6;

/// Step for the numerical Jacobian.
const JACOBIAN_EPS: f64 = 1e-6;

/// A graph node (one submap).
#[derive(Debug, Clone, PartialEq)]
pub struct PoseGraphNode {
    pub submap_id: SubmapId,
    pub map_to_submap: SE3,
}

/// A relative-pose edge between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseGraphEdge {
    pub source: SubmapId,
    pub target: SubmapId,

    /// Pose of `target` in the frame of `source`.
    pub measurement: SE3,

    /// Information weight (inverse covariance scale).
    pub information: f64,

    /// Huber-weighted and prunable.
    pub robust: bool,

    pub kind: ConstraintKind,
}

/// Snapshot of the optimization problem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoseGraph {
    pub nodes: Vec<PoseGraphNode>,
    pub edges: Vec<PoseGraphEdge>,
}

impl PoseGraph {
    pub fn num_loop_closures(&self) -> usize {
        self.edges.iter().filter(|e| e.kind == ConstraintKind::LoopClosure).count()
    }
}

/// Result of pose graph optimization.
#[derive(Debug, Clone)]
pub struct PoseGraphResult {
    /// Optimized pose of every node, ordered by id.
    pub poses: Vec<OptimizedSubmapPose>,

    /// Number of LM iterations across both passes.
    pub iterations: usize,

    /// Robust cost before optimization.
    pub initial_error: f64,

    /// Robust cost after optimization.
    pub final_error: f64,

    /// Robust edges removed after the first pass.
    pub pruned_edges: Vec<(SubmapId, SubmapId)>,
}

/// PHASE 2: Solve the pose graph.
///
/// The node with the lowest id is held fixed. Edges referencing nodes that
/// are not in the graph are ignored.
pub fn solve_pose_graph(graph: &PoseGraph, params: &PoseGraphParameters) -> PoseGraphResult {
    let mut nodes = graph.nodes.clone();
    nodes.sort_by_key(|n| n.submap_id);

    let id_to_idx: HashMap<SubmapId, usize> = nodes.iter().enumerate().map(|(i, n)| (n.submap_id, i)).collect();
    let edges: Vec<IndexedEdge> = graph
        .edges
        .iter()
        .filter_map(|e| {
            let i = *id_to_idx.get(&e.source)?;
            let j = *id_to_idx.get(&e.target)?;
            Some(IndexedEdge { i, j, edge: e.clone() })
        })
        .collect();

    if edges.len() < graph.edges.len() {
        warn!(
            "Pose graph: ignoring {} edges with unknown nodes",
            graph.edges.len() - edges.len()
        );
    }

    let initial: Vec<SE3> = nodes.iter().map(|n| n.map_to_submap).collect();
    let first = run_lm(&initial, &edges, params);

    // Prune robust edges that still disagree, then re-solve once from scratch.
    let (kept, pruned): (Vec<IndexedEdge>, Vec<IndexedEdge>) = edges.into_iter().partition(|e| {
        !e.edge.robust || edge_error(&first.poses, e).norm() <= params.edge_prune_threshold
    });

    let (solution, iterations, final_error) = if pruned.is_empty() {
        (first.poses, first.iterations, first.final_error)
    } else {
        debug!("Pose graph: pruned {} loop closures, re-solving", pruned.len());
        let second = run_lm(&initial, &kept, params);
        (second.poses, first.iterations + second.iterations, second.final_error)
    };

    PoseGraphResult {
        poses: nodes
            .iter()
            .zip(solution)
            .map(|(n, pose)| OptimizedSubmapPose {
                submap_id: n.submap_id,
                map_to_submap: pose,
            })
            .collect(),
        iterations,
        initial_error: first.initial_error,
        final_error,
        pruned_edges: pruned.iter().map(|e| (e.edge.source, e.edge.target)).collect(),
    }
}

#[derive(Clone)]
struct IndexedEdge {
    i: usize,
    j: usize,
    edge: PoseGraphEdge,
}

struct LmOutput {
    poses: Vec<SE3>,
    iterations: usize,
    initial_error: f64,
    final_error: f64,
}

/// Relative pose error `log(measurement⁻¹ * pose_i⁻¹ * pose_j)`.
fn relative_error(pose_i: &SE3, pose_j: &SE3, measurement: &SE3) -> Vector6<f64> {
    measurement.inverse().compose(&pose_i.between(pose_j)).to_vector6()
}

fn edge_error(poses: &[SE3], e: &IndexedEdge) -> Vector6<f64> {
    relative_error(&poses[e.i], &poses[e.j], &e.edge.measurement)
}

/// IRLS weight for a residual of norm `r`.
fn huber_weight(r: f64, k: f64) -> f64 {
    if r <= k || r == 0.0 { 1.0 } else { k / r }
}

/// Huber cost of a residual with squared norm `r2`.
fn huber_cost(r2: f64, k: f64) -> f64 {
    let r = r2.sqrt();
    if r <= k { r2 } else { 2.0 * k * r - k * k }
}

fn total_error(poses: &[SE3], edges: &[IndexedEdge], huber_scale: f64) -> f64 {
    edges
        .iter()
        .map(|e| {
            let r2 = edge_error(poses, e).norm_squared();
            let cost = if e.edge.robust { huber_cost(r2, huber_scale) } else { r2 };
            cost * e.edge.information
        })
        .sum()
}

/// Pose of node `idx` from the parameter vector (node 0 is the anchor).
fn pose_from_params(params: &DVector<f64>, idx: usize, anchor: &SE3) -> SE3 {
    if idx == 0 {
        return *anchor;
    }
    let offset = (idx - 1) * POSE_DOF;
    SE3::from_vector6(&Vector6::from_iterator(params.rows(offset, POSE_DOF).iter().copied()))
}

fn poses_from_params(params: &DVector<f64>, n_poses: usize, anchor: &SE3) -> Vec<SE3> {
    (0..n_poses).map(|idx| pose_from_params(params, idx, anchor)).collect()
}

/// Central-difference Jacobian of an edge error w.r.t. one pose's parameters.
fn numeric_jacobian<F: Fn(&SE3) -> Vector6<f64>>(pose: &SE3, error_at: F) -> Matrix6<f64> {
    let base = pose.to_vector6();
    let mut jacobian = Matrix6::zeros();
    for p in 0..POSE_DOF {
        let mut plus = base;
        let mut minus = base;
        plus[p] += JACOBIAN_EPS;
        minus[p] -= JACOBIAN_EPS;
        let column = (error_at(&SE3::from_vector6(&plus)) - error_at(&SE3::from_vector6(&minus))) / (2.0 * JACOBIAN_EPS);
        jacobian.set_column(p, &column);
    }
    jacobian
}

fn run_lm(initial: &[SE3], edges: &[IndexedEdge], config: &PoseGraphParameters) -> LmOutput {
    let n_poses = initial.len();
    let initial_error = total_error(initial, edges, config.huber_scale);

    if n_poses < 2 || edges.is_empty() {
        return LmOutput {
            poses: initial.to_vec(),
            iterations: 0,
            initial_error,
            final_error: initial_error,
        };
    }

    let anchor = initial[0];
    let n_params = (n_poses - 1) * POSE_DOF;
    let mut current_params = DVector::zeros(n_params);
    for (idx, pose) in initial.iter().enumerate().skip(1) {
        current_params
            .rows_mut((idx - 1) * POSE_DOF, POSE_DOF)
            .copy_from(&pose.to_vector6());
    }

    let mut lambda = 1e-3;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-10;
    let max_lambda = 1e10;
    let mut iterations = 0;
    let mut current_error = initial_error;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;
        let poses = poses_from_params(&current_params, n_poses, &anchor);

        // Accumulate the normal equations block by block.
        let mut jtj = DMatrix::zeros(n_params, n_params);
        let mut gradient = DVector::zeros(n_params);

        for e in edges {
            let residual = edge_error(&poses, e);
            let mut weight = e.edge.information;
            if e.edge.robust {
                weight *= huber_weight(residual.norm(), config.huber_scale);
            }

            let mut blocks: Vec<(usize, Matrix6<f64>)> = Vec::with_capacity(2);
            if e.i != 0 {
                let jac = numeric_jacobian(&poses[e.i], |p| relative_error(p, &poses[e.j], &e.edge.measurement));
                blocks.push(((e.i - 1) * POSE_DOF, jac));
            }
            if e.j != 0 {
                let jac = numeric_jacobian(&poses[e.j], |p| relative_error(&poses[e.i], p, &e.edge.measurement));
                blocks.push(((e.j - 1) * POSE_DOF, jac));
            }

            for (row, jac_a) in &blocks {
                let g = jac_a.transpose() * residual * weight;
                let mut g_rows = gradient.rows_mut(*row, POSE_DOF);
                g_rows += g;
                for (col, jac_b) in &blocks {
                    let h = jac_a.transpose() * jac_b * weight;
                    let mut h_block = jtj.view_mut((*row, *col), (POSE_DOF, POSE_DOF));
                    h_block += h;
                }
            }
        }

        if gradient.norm() < config.gradient_tolerance {
            break;
        }

        // Damped system
        let mut damped_jtj = jtj.clone();
        for i in 0..n_params {
            damped_jtj[(i, i)] += lambda * jtj[(i, i)].max(1e-6);
        }

        let delta = match damped_jtj.lu().solve(&(-&gradient)) {
            Some(d) => d,
            None => break,
        };

        if delta.norm() < config.param_tolerance * (current_params.norm() + config.param_tolerance) {
            break;
        }

        // Trial step
        let trial_params = &current_params + &delta;
        let trial_error = total_error(
            &poses_from_params(&trial_params, n_poses, &anchor),
            edges,
            config.huber_scale,
        );

        if trial_error < current_error {
            current_params = trial_params;
            current_error = trial_error;
            lambda = (lambda * lambda_down).max(min_lambda);
        } else {
            lambda = (lambda * lambda_up).min(max_lambda);
            if lambda >= max_lambda {
                break;
            }
        }
    }

    LmOutput {
        poses: poses_from_params(&current_params, n_poses, &anchor),
        iterations,
        initial_error,
        final_error: current_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn node(id: u64, x: f64, y: f64) -> PoseGraphNode {
        PoseGraphNode {
            submap_id: SubmapId(id),
            map_to_submap: SE3::from_translation(Vector3::new(x, y, 0.0)),
        }
    }

    fn edge(source: u64, target: u64, measurement: SE3, kind: ConstraintKind) -> PoseGraphEdge {
        PoseGraphEdge {
            source: SubmapId(source),
            target: SubmapId(target),
            measurement,
            information: 1.0,
            robust: kind == ConstraintKind::LoopClosure,
            kind,
        }
    }

    fn step(x: f64, y: f64) -> SE3 {
        SE3::from_translation(Vector3::new(x, y, 0.0))
    }

    /// Square loop with drifted odometry and one correct loop closure.
    fn square_loop() -> PoseGraph {
        let odometry = ConstraintKind::Odometry;
        PoseGraph {
            nodes: vec![node(0, 0.0, 0.0), node(1, 1.0, 0.0), node(2, 1.0, 1.0), node(3, 0.2, 1.1)],
            edges: vec![
                edge(0, 1, step(1.0, 0.0), odometry),
                edge(1, 2, step(0.0, 1.0), odometry),
                edge(2, 3, step(-0.8, 0.1), odometry),
                edge(3, 0, step(-0.2, -1.1), ConstraintKind::LoopClosure),
            ],
        }
    }

    #[test]
    fn test_consistent_graph_is_unchanged() {
        let graph = PoseGraph {
            nodes: vec![node(0, 0.0, 0.0), node(1, 1.0, 0.0)],
            edges: vec![edge(0, 1, step(1.0, 0.0), ConstraintKind::Odometry)],
        };
        let result = solve_pose_graph(&graph, &PoseGraphParameters::default());

        assert_relative_eq!(result.final_error, 0.0, epsilon = 1e-12);
        assert_relative_eq!(result.poses[1].map_to_submap.translation.x, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_anchor_stays_fixed() {
        let mut graph = square_loop();
        graph.nodes[0].map_to_submap = step(5.0, 5.0);
        let result = solve_pose_graph(&graph, &PoseGraphParameters::default());

        assert_eq!(result.poses[0].submap_id, SubmapId(0));
        assert_eq!(result.poses[0].map_to_submap, step(5.0, 5.0));
    }

    #[test]
    fn test_consistent_loop_reduces_error() {
        let params = PoseGraphParameters {
            huber_scale: 10.0,
            ..PoseGraphParameters::default()
        };
        let mut graph = square_loop();
        // Perturb the initial estimate so there is something to fix.
        graph.nodes[2].map_to_submap = step(1.3, 0.8);

        let result = solve_pose_graph(&graph, &params);

        assert!(result.final_error < result.initial_error);
        assert!(result.pruned_edges.is_empty());
        assert_relative_eq!(result.final_error, 0.0, epsilon = 1e-8);
        assert_relative_eq!(result.poses[2].map_to_submap.translation, Vector3::new(1.0, 1.0, 0.0), epsilon = 1e-4);
    }

    #[test]
    fn test_outlier_loop_closure_is_pruned() {
        let mut graph = square_loop();
        graph.edges[3] = edge(3, 0, step(3.0, 2.0), ConstraintKind::LoopClosure);

        let result = solve_pose_graph(&graph, &PoseGraphParameters::default());

        assert_eq!(result.pruned_edges, vec![(SubmapId(3), SubmapId(0))]);
        // Without the outlier the odometry chain is reproduced exactly.
        assert_relative_eq!(result.poses[3].map_to_submap.translation, Vector3::new(0.2, 1.1, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn test_edges_with_unknown_nodes_are_ignored() {
        let mut graph = square_loop();
        graph.edges.push(edge(0, 42, step(1.0, 0.0), ConstraintKind::Odometry));
        let result = solve_pose_graph(&graph, &PoseGraphParameters::default());
        assert_eq!(result.poses.len(), 4);
    }
}
