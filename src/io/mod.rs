//! File input and output.
//!
//! - [`scans`] - replaying scans stored as `<time_ns>.csv` files
//! - [`export`] - writing submaps and the assembled map as CSV

pub mod export;
pub mod scans;

pub use export::{save_map, save_submaps, write_cloud_csv};
pub use scans::{ScanFile, list_scan_files, load_scan, load_scan_directory};
