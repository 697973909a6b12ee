//! Inter-thread message types.
//!
//! Messages are triggers only. Workers read the current state from
//! [`super::SharedState`] when they run, so a dropped message never loses data.

use crate::mapping::SubmapId;

/// Sent from ingestion to the mapping worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingJob {
    /// A submap was just finished.
    SubmapFinished(SubmapId),
}

/// Sent from the mapping worker to the optimization worker once a new
/// problem has been built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizationRequest;
