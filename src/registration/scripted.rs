//! Registration double that replays queued results.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::cloud::PointCloud;
use crate::geometry::SE3;

use super::{Registration, RegistrationRequest, RegistrationResult};

/// Returns queued results in order, then `fallback` once the queue is empty.
pub(crate) struct ScriptedRegistration {
    responses: Mutex<VecDeque<RegistrationResult>>,
    fallback: RegistrationResult,
    /// (source size, target size, request) for every call.
    calls: Mutex<Vec<(usize, usize, RegistrationRequest)>>,
}

impl ScriptedRegistration {
    pub(crate) fn new(fallback_fitness: f64) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: RegistrationResult {
                transformation: SE3::identity(),
                fitness: fallback_fitness,
                inlier_rmse: 0.01,
            },
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, transformation: SE3, fitness: f64) {
        self.responses.lock().push_back(RegistrationResult {
            transformation,
            fitness,
            inlier_rmse: 0.01,
        });
    }

    pub(crate) fn num_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn last_request(&self) -> Option<RegistrationRequest> {
        self.calls.lock().last().map(|c| c.2.clone())
    }
}

impl Registration for ScriptedRegistration {
    fn register(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        request: &RegistrationRequest,
    ) -> RegistrationResult {
        self.calls.lock().push((source.len(), target.len(), request.clone()));
        self.responses.lock().pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}
