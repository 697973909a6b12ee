//! Surface normal estimation from local neighbourhoods.

use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use super::{PointCloud, VoxelHash};

/// Minimum neighbours needed to fit a plane.
const MIN_NEIGHBOURS: usize = 3;

/// Neighbour search radius for a cloud voxelized at `voxel_size`.
pub fn normal_search_radius(voxel_size: f64) -> f64 {
    (voxel_size * 5.0).max(0.5)
}

/// Estimate a unit normal for every point from its `knn` nearest neighbours
/// within `search_radius`.
///
/// The normal is the eigenvector of the neighbourhood covariance with the
/// smallest eigenvalue, flipped to face the frame origin (the sensor for
/// scans, the submap origin for submaps). Points with too few neighbours get
/// +Z.
pub fn estimate_normals(cloud: &mut PointCloud, knn: usize, search_radius: f64) {
    if cloud.is_empty() {
        cloud.normals.clear();
        return;
    }

    let hash = VoxelHash::new(&cloud.points, search_radius);
    let knn = knn.max(MIN_NEIGHBOURS);

    let normals: Vec<Vector3<f64>> = cloud
        .points
        .iter()
        .map(|p| {
            let neighbours = hash.k_nearest(p, knn, search_radius);
            if neighbours.len() < MIN_NEIGHBOURS {
                return Vector3::z();
            }
            let normal = fit_plane_normal(neighbours.iter().map(|&i| hash.point(i)));
            // Face the origin
            if normal.dot(&(-p)) < 0.0 { -normal } else { normal }
        })
        .collect();

    cloud.normals = normals;
}

fn fit_plane_normal<'a, I: Iterator<Item = &'a Vector3<f64>> + Clone>(points: I) -> Vector3<f64> {
    let n = points.clone().count() as f64;
    let mean: Vector3<f64> = points.clone().sum::<Vector3<f64>>() / n;

    let mut cov = Matrix3::zeros();
    for p in points {
        let d = p - mean;
        cov += d * d.transpose();
    }
    cov /= n;

    let eigen = SymmetricEigen::new(cov);
    let min_idx = eigen.eigenvalues.imin();
    let normal: Vector3<f64> = eigen.eigenvectors.column(min_idx).into_owned();
    normal.normalize()
}
