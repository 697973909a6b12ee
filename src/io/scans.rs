use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use nalgebra::Vector3;
use tracing::warn;

use crate::cloud::PointCloud;
use crate::time::Time;

/// One scan file, named by its timestamp in nanoseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFile {
    pub time: Time,
    pub path: PathBuf,
}

/// List `<time_ns>.csv` files in `dir`, sorted by time.
///
/// Files whose stem is not an integer are skipped.
pub fn list_scan_files<P: AsRef<Path>>(dir: P) -> Result<Vec<ScanFile>> {
    let dir = dir.as_ref();
    let entries = fs::read_dir(dir).with_context(|| format!("Failed to read scan directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match stem.parse::<u64>() {
            Ok(ns) => files.push(ScanFile {
                time: Time::from_nanos(ns),
                path,
            }),
            Err(_) => warn!("Skipping {}: name is not a timestamp", path.display()),
        }
    }

    files.sort_by_key(|f| f.time);
    Ok(files)
}

/// Read a scan: one `x,y,z` point per row.
///
/// `#` comments are allowed, and a first row that is not numeric is treated
/// as a header, so files from [`crate::io::write_cloud_csv`] read back as-is.
pub fn load_scan<P: AsRef<Path>>(path: P) -> Result<PointCloud> {
    let path = path.as_ref();
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut points = Vec::new();
    for (row, rec) in rdr.records().enumerate() {
        let rec = rec?;
        if rec.len() < 3 {
            continue;
        }
        if row == 0 && rec[0].trim().parse::<f64>().is_err() {
            continue;
        }
        let parse = |i: usize| -> Result<f64> {
            rec[i]
                .trim()
                .parse()
                .with_context(|| format!("{}: bad value on row {}", path.display(), row + 1))
        };
        points.push(Vector3::new(parse(0)?, parse(1)?, parse(2)?));
    }
    Ok(PointCloud::from_points(points))
}

/// Load every scan in `dir`, sorted by time.
pub fn load_scan_directory<P: AsRef<Path>>(dir: P) -> Result<Vec<(Time, PointCloud)>> {
    list_scan_files(dir)?
        .into_iter()
        .map(|f| Ok((f.time, load_scan(&f.path)?)))
        .collect()
}
