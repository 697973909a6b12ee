//! Scan registration.
//!
//! [`Registration`] is the seam between the mapping logic and the geometric
//! matcher. Odometry and loop closure only see this trait; [`IcpRegistration`]
//! is the in-crate implementation.

pub mod icp;
#[cfg(test)]
pub(crate) mod scripted;

use std::sync::Arc;

use crate::cloud::PointCloud;
use crate::config::IcpObjective;
use crate::geometry::SE3;

pub use icp::IcpRegistration;

/// Termination criteria for iterative registration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceCriteria {
    pub max_iteration: usize,
    /// Stop when fitness changes less than this between iterations.
    pub relative_fitness: f64,
    /// Stop when inlier RMSE changes less than this between iterations.
    pub relative_rmse: f64,
}

impl Default for ConvergenceCriteria {
    fn default() -> Self {
        Self {
            max_iteration: 30,
            relative_fitness: 1e-6,
            relative_rmse: 1e-6,
        }
    }
}

impl ConvergenceCriteria {
    pub fn with_max_iteration(max_iteration: usize) -> Self {
        Self {
            max_iteration,
            ..Self::default()
        }
    }
}

/// Inputs for a single registration call.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub max_correspondence_distance: f64,
    pub initial_guess: SE3,
    pub objective: IcpObjective,
    pub criteria: ConvergenceCriteria,
}

/// Output of a registration call.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResult {
    /// Transform mapping source points onto the target.
    pub transformation: SE3,
    /// Fraction of source points with a correspondence, in [0, 1].
    pub fitness: f64,
    /// RMSE over inlier correspondences.
    pub inlier_rmse: f64,
}

impl RegistrationResult {
    /// Result for inputs that could not be matched at all.
    pub fn failed(initial_guess: SE3) -> Self {
        Self {
            transformation: initial_guess,
            fitness: 0.0,
            inlier_rmse: 0.0,
        }
    }
}

/// Aligns a source cloud to a target cloud.
///
/// Thresholding on `fitness` is the caller's responsibility.
pub trait Registration: Send + Sync {
    fn register(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        request: &RegistrationRequest,
    ) -> RegistrationResult;
}

impl<T: Registration + ?Sized> Registration for Arc<T> {
    fn register(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        request: &RegistrationRequest,
    ) -> RegistrationResult {
        (**self).register(source, target, request)
    }
}
