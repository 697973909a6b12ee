//! Frame-to-frame LIDAR odometry.
//!
//! - [`TransformInterpolationBuffer`] - time-indexed odometry poses
//! - [`LidarOdometry`] - scan-to-scan registration state machine

pub mod interpolation_buffer;
mod lidar_odometry;

pub use interpolation_buffer::{DEFAULT_BUFFER_CAPACITY, TransformInterpolationBuffer};
pub use lidar_odometry::{LidarOdometry, OdometryState, OdometryStatus};
