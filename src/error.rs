//! Error types for the mapping back-end.

use crate::mapping::SubmapId;
use crate::time::Time;

/// Result type alias
pub type Result<T> = std::result::Result<T, MappingError>;

/// Mapping error types
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// Input arrived with a timestamp older than the last accepted one
    #[error("Out of order input: {time} is older than last accepted {last}")]
    OutOfOrderInput { time: Time, last: Time },

    /// Registration fitness below the acceptance threshold
    #[error("Registration failure: fitness {fitness:.3} <= threshold {threshold:.3}")]
    RegistrationFailure { fitness: f64, threshold: f64 },

    /// Interpolation requested outside the buffered time range
    #[error("Buffer query out of range: {time} not within [{earliest:?}, {latest:?}]")]
    BufferQueryOutOfRange {
        time: Time,
        earliest: Option<Time>,
        latest: Option<Time>,
    },

    /// Constraint references a submap that does not exist
    #[error("Unknown submap: {0}")]
    UnknownSubmap(SubmapId),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// YAML decoding error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
