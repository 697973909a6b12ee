//! Voxel-grid utilities: downsampling and neighbour queries.

use std::collections::{BTreeMap, HashMap};

use nalgebra::Vector3;
use rand::Rng;

use super::PointCloud;

type VoxelKey = (i64, i64, i64);

fn voxel_key(p: &Vector3<f64>, inv_size: f64) -> VoxelKey {
    (
        (p.x * inv_size).floor() as i64,
        (p.y * inv_size).floor() as i64,
        (p.z * inv_size).floor() as i64,
    )
}

/// Replace all points falling into the same voxel by their centroid.
///
/// Normals, when present, are averaged and renormalized. A non-positive
/// `voxel_size` returns the cloud unchanged. Output order follows voxel keys,
/// so the result is deterministic.
pub fn voxelize(cloud: &PointCloud, voxel_size: f64) -> PointCloud {
    if cloud.is_empty() || voxel_size <= 0.0 {
        return cloud.clone();
    }

    let inv_size = 1.0 / voxel_size;
    let has_normals = cloud.has_normals();
    // Key -> (sum of points, sum of normals, count)
    let mut accum: BTreeMap<VoxelKey, (Vector3<f64>, Vector3<f64>, usize)> = BTreeMap::new();

    for (i, p) in cloud.points.iter().enumerate() {
        let entry = accum
            .entry(voxel_key(p, inv_size))
            .or_insert((Vector3::zeros(), Vector3::zeros(), 0));
        entry.0 += p;
        if has_normals {
            entry.1 += cloud.normals[i];
        }
        entry.2 += 1;
    }

    let mut out = PointCloud::new();
    out.points.reserve(accum.len());
    for (sum_p, sum_n, count) in accum.into_values() {
        out.points.push(sum_p / count as f64);
        if has_normals {
            out.normals.push(sum_n);
        }
    }
    out.normalize_normals();
    out
}

/// Keep a uniformly random `ratio` of the points, preserving their order.
pub fn random_down_sample<R: Rng + ?Sized>(cloud: &PointCloud, ratio: f64, rng: &mut R) -> PointCloud {
    if ratio >= 1.0 || cloud.is_empty() {
        return cloud.clone();
    }
    let n_keep = ((cloud.len() as f64) * ratio.max(0.0)) as usize;
    let mut indices = rand::seq::index::sample(rng, cloud.len(), n_keep).into_vec();
    indices.sort_unstable();

    let has_normals = cloud.has_normals();
    let mut out = PointCloud::new();
    for i in indices {
        out.points.push(cloud.points[i]);
        if has_normals {
            out.normals.push(cloud.normals[i]);
        }
    }
    out
}

/// Spatial hash over a fixed point set, for radius-bounded neighbour search.
pub struct VoxelHash {
    cell_size: f64,
    inv_cell_size: f64,
    cells: HashMap<VoxelKey, Vec<usize>>,
    points: Vec<Vector3<f64>>,
}

impl VoxelHash {
    /// Index `points` with cubic cells of side `cell_size`.
    pub fn new(points: &[Vector3<f64>], cell_size: f64) -> Self {
        let cell_size = cell_size.max(1e-6);
        let inv_cell_size = 1.0 / cell_size;
        let mut cells: HashMap<VoxelKey, Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(voxel_key(p, inv_cell_size)).or_default().push(i);
        }
        Self {
            cell_size,
            inv_cell_size,
            cells,
            points: points.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, idx: usize) -> &Vector3<f64> {
        &self.points[idx]
    }

    /// Visit every indexed point within `radius` of `query` as (index, squared distance).
    fn for_each_within<F: FnMut(usize, f64)>(&self, query: &Vector3<f64>, radius: f64, mut visit: F) {
        let rings = (radius / self.cell_size).ceil() as i64;
        let center = voxel_key(query, self.inv_cell_size);
        let radius_sq = radius * radius;

        for dx in -rings..=rings {
            for dy in -rings..=rings {
                for dz in -rings..=rings {
                    let key = (center.0 + dx, center.1 + dy, center.2 + dz);
                    let Some(indices) = self.cells.get(&key) else {
                        continue;
                    };
                    for &i in indices {
                        let d2 = (self.points[i] - query).norm_squared();
                        if d2 <= radius_sq {
                            visit(i, d2);
                        }
                    }
                }
            }
        }
    }

    /// Closest point within `max_distance`, as (index, squared distance).
    pub fn nearest(&self, query: &Vector3<f64>, max_distance: f64) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        self.for_each_within(query, max_distance, |i, d2| {
            if best.is_none_or(|(_, bd)| d2 < bd) {
                best = Some((i, d2));
            }
        });
        best
    }

    /// Up to `k` closest points within `radius`, nearest first.
    pub fn k_nearest(&self, query: &Vector3<f64>, k: usize, radius: f64) -> Vec<usize> {
        let mut found: Vec<(usize, f64)> = Vec::new();
        self.for_each_within(query, radius, |i, d2| found.push((i, d2)));
        found.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        found.truncate(k);
        found.into_iter().map(|(i, _)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_voxelize_merges_points_in_same_cell() {
        let cloud = PointCloud::from_points(vec![
            Vector3::new(0.01, 0.01, 0.01),
            Vector3::new(0.03, 0.03, 0.03),
            Vector3::new(1.05, 0.0, 0.0),
        ]);
        let out = voxelize(&cloud, 0.1);

        assert_eq!(out.len(), 2);
        assert!(out.points.iter().any(|p| (p - Vector3::new(0.02, 0.02, 0.02)).norm() < 1e-12));
    }

    #[test]
    fn test_voxelize_non_positive_size_is_identity() {
        let cloud = PointCloud::from_points(vec![Vector3::zeros(), Vector3::zeros()]);
        assert_eq!(voxelize(&cloud, 0.0), cloud);
    }

    #[test]
    fn test_random_down_sample_ratio() {
        let points = (0..100).map(|i| Vector3::new(i as f64, 0.0, 0.0)).collect();
        let cloud = PointCloud::from_points(points);
        let mut rng = StdRng::seed_from_u64(7);
        let out = random_down_sample(&cloud, 0.25, &mut rng);

        assert_eq!(out.len(), 25);
        assert!(out.points.windows(2).all(|w| w[0].x < w[1].x));
    }

    #[test]
    fn test_nearest_respects_max_distance() {
        let points = vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)];
        let hash = VoxelHash::new(&points, 0.5);

        let (idx, d2) = hash.nearest(&Vector3::new(0.9, 0.0, 0.0), 0.5).unwrap();
        assert_eq!(idx, 1);
        assert_relative_eq!(d2, 0.01, epsilon = 1e-12);
        assert!(hash.nearest(&Vector3::new(5.0, 0.0, 0.0), 0.5).is_none());
    }

    #[test]
    fn test_k_nearest_sorted() {
        let points: Vec<_> = (0..10).map(|i| Vector3::new(i as f64 * 0.1, 0.0, 0.0)).collect();
        let hash = VoxelHash::new(&points, 0.2);
        let nn = hash.k_nearest(&Vector3::new(0.0, 0.0, 0.0), 3, 1.0);

        assert_eq!(nn, vec![0, 1, 2]);
    }
}
