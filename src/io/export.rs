use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use csv::Writer;

use crate::cloud::{PointCloud, voxelize};
use crate::mapping::SubmapCollection;

/// Write `cloud` as CSV with an `x,y,z` header.
pub fn write_cloud_csv<P: AsRef<Path>>(path: P, cloud: &PointCloud) -> Result<()> {
    let path = path.as_ref();
    let mut writer = Writer::from_path(path).with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["x", "y", "z"])?;
    for p in &cloud.points {
        writer.write_record([p.x.to_string(), p.y.to_string(), p.z.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write each submap's map cloud, in the map frame, to
/// `dir/submap_<id>.csv`. Returns the number of files written.
pub fn save_submaps<P: AsRef<Path>>(dir: P, submaps: &SubmapCollection) -> Result<usize> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut written = 0;
    for id in submaps.submap_ids() {
        let Some(handle) = submaps.submap(id) else {
            continue;
        };
        let cloud = handle.read().map_cloud_in_map_frame();
        write_cloud_csv(dir.join(format!("submap_{}.csv", id.0)), &cloud)?;
        written += 1;
    }
    Ok(written)
}

/// Merge all submaps in the map frame, voxelize at `voxel_size` and write
/// the result. Returns the number of points written.
pub fn save_map<P: AsRef<Path>>(path: P, submaps: &SubmapCollection, voxel_size: f64) -> Result<usize> {
    let mut map = PointCloud::new();
    for id in submaps.submap_ids() {
        if let Some(handle) = submaps.submap(id) {
            map.extend_from(&handle.read().map_cloud_in_map_frame());
        }
    }
    let map = voxelize(&map, voxel_size);
    write_cloud_csv(path, &map)?;
    Ok(map.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapperParameters;
    use crate::geometry::SE3;
    use crate::io::load_scan;
    use crate::registration::Registration;
    use crate::registration::scripted::ScriptedRegistration;
    use crate::time::Time;
    use nalgebra::Vector3;
    use std::sync::Arc;

    fn two_submaps() -> SubmapCollection {
        let mut params = MapperParameters::default();
        params.submaps.submap_size = 1.0;
        params.submaps.min_num_range_data = 1;
        let registration: Arc<dyn Registration> = Arc::new(ScriptedRegistration::new(0.0));
        let collection = SubmapCollection::new(params, registration);
        let cloud = PointCloud::from_points(vec![Vector3::new(1.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 0.0)]);
        for (i, x) in [0.0, 2.0, 2.0].into_iter().enumerate() {
            let pose = SE3::from_translation(Vector3::new(x, 0.0, 0.0));
            collection.insert_scan(&cloud, &cloud, &pose, Time(i as u64));
        }
        collection
    }

    #[test]
    fn test_save_submaps_writes_one_file_each() {
        let collection = two_submaps();
        let dir = tempfile::tempdir().unwrap();

        let written = save_submaps(dir.path().join("submaps"), &collection).unwrap();

        assert_eq!(written, 2);
        let first = load_scan(dir.path().join("submaps/submap_0.csv")).unwrap();
        assert_eq!(first.len(), 4);
    }

    #[test]
    fn test_save_map_merges_in_map_frame() {
        let collection = two_submaps();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.csv");

        let written = save_map(&path, &collection, 0.1).unwrap();

        // Points at x=1 and x=3, each at y=0 and y=1.
        assert_eq!(written, 4);
        let map = load_scan(&path).unwrap();
        assert!(map.points.iter().any(|p| (p - Vector3::new(3.0, 1.0, 0.0)).norm() < 1e-9));
    }
}
