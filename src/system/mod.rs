//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem`, the mapping and
//! optimization worker threads it spawns, the shared state they work on and
//! the observer hook for outer layers.

mod mapping_worker;
pub mod messages;
pub mod observer;
mod optimization_worker;
pub mod shared_state;
mod slam_system;

pub use messages::{MappingJob, OptimizationRequest};
pub use observer::{MappingObserver, NoopObserver};
pub use shared_state::SharedState;
pub use slam_system::{ScanOutcome, SlamSystem};
