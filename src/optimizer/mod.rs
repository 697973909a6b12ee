//! Pose-graph optimization over submaps.
//!
//! - [`pose_graph`] - Levenberg-Marquardt solver with robust loop closures
//! - [`OptimizationProblem`] - constraint bookkeeping and single-flight solve

mod optimization_problem;
pub mod pose_graph;

pub use optimization_problem::{OptimizationProblem, OptimizationState, SolveOutcome, SolveSummary};
pub use pose_graph::{PoseGraph, PoseGraphEdge, PoseGraphNode, PoseGraphResult, solve_pose_graph};
