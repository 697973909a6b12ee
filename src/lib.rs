pub mod cloud;
pub mod config;
pub mod error;
pub mod geometry;
pub mod io;
pub mod mapping;
pub mod odometry;
pub mod optimizer;
pub mod registration;
pub mod system;
pub mod time;

pub use error::{MappingError, Result};
