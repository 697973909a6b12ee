//! Submap-based mapping.
//!
//! - [`Submap`] - local map accumulating consecutive scans
//! - [`SubmapCollection`] - submap lifecycle, constraints, loop-closure search
//! - [`AdjacencyMatrix`] - proximity bookkeeping behind [`ProximityIndex`]
//! - [`Constraint`] - relative-pose edges between submaps

pub mod adjacency;
pub mod constraint;
pub mod submap;
mod submap_collection;
pub mod types;

pub use adjacency::{AdjacencyMatrix, ProximityIndex};
pub use constraint::{Constraint, ConstraintKind};
pub use submap::{Submap, SubmapFeatures};
pub use submap_collection::{InsertOutcome, LoopClosureBuild, SubmapCollection, SubmapHandle};
pub use types::{OptimizedSubmapPose, SubmapId};
