//! Iterative closest point registration.
//!
//! Each iteration:
//! 1. Transform the source with the current estimate
//! 2. Find nearest target points within the correspondence distance
//! 3. Solve for the increment (SVD for point-to-point, Gauss-Newton for
//!    point-to-plane)
//! 4. Stop once fitness and RMSE settle or the iteration budget runs out

use nalgebra::{Matrix3, Matrix6, UnitQuaternion, Vector3, Vector6};
use tracing::debug;

use crate::cloud::{PointCloud, VoxelHash};
use crate::config::IcpObjective;
use crate::geometry::SE3;

use super::{Registration, RegistrationRequest, RegistrationResult};

/// Minimum correspondences to attempt an update.
const MIN_CORRESPONDENCES: usize = 6;

/// Stateless ICP matcher.
#[derive(Debug, Clone, Default)]
pub struct IcpRegistration;

impl IcpRegistration {
    pub fn new() -> Self {
        Self
    }
}

/// (source index, target index, squared distance)
type Correspondence = (usize, usize, f64);

impl Registration for IcpRegistration {
    fn register(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        request: &RegistrationRequest,
    ) -> RegistrationResult {
        if source.is_empty() || target.is_empty() {
            return RegistrationResult::failed(request.initial_guess);
        }

        let objective = if request.objective == IcpObjective::PointToPlane && !target.has_normals() {
            debug!("Target has no normals, falling back to point-to-point");
            IcpObjective::PointToPoint
        } else {
            request.objective
        };

        let max_dist = request.max_correspondence_distance;
        let target_index = VoxelHash::new(&target.points, max_dist);

        let mut transform = request.initial_guess;
        let mut moved: Vec<Vector3<f64>> = source.points.iter().map(|p| transform.transform_point(p)).collect();
        let mut correspondences = find_correspondences(&moved, &target_index, max_dist);
        let (mut fitness, mut rmse) = evaluate(&correspondences, source.len());

        for iteration in 0..request.criteria.max_iteration {
            if correspondences.len() < MIN_CORRESPONDENCES {
                break;
            }

            let increment = match objective {
                IcpObjective::PointToPoint => solve_point_to_point(&moved, &target.points, &correspondences),
                IcpObjective::PointToPlane => {
                    solve_point_to_plane(&moved, &target.points, &target.normals, &correspondences)
                }
            };
            let Some(increment) = increment else {
                break;
            };

            transform = increment.compose(&transform);
            moved = source.points.iter().map(|p| transform.transform_point(p)).collect();
            correspondences = find_correspondences(&moved, &target_index, max_dist);

            let (new_fitness, new_rmse) = evaluate(&correspondences, source.len());
            let converged = (new_fitness - fitness).abs() < request.criteria.relative_fitness
                && (new_rmse - rmse).abs() < request.criteria.relative_rmse;
            fitness = new_fitness;
            rmse = new_rmse;

            if converged {
                debug!("ICP converged after {} iterations", iteration + 1);
                break;
            }
        }

        RegistrationResult {
            transformation: transform,
            fitness,
            inlier_rmse: rmse,
        }
    }
}

fn find_correspondences(moved: &[Vector3<f64>], target_index: &VoxelHash, max_dist: f64) -> Vec<Correspondence> {
    moved
        .iter()
        .enumerate()
        .filter_map(|(i, p)| target_index.nearest(p, max_dist).map(|(j, d2)| (i, j, d2)))
        .collect()
}

/// (fitness, inlier RMSE)
fn evaluate(correspondences: &[Correspondence], n_source: usize) -> (f64, f64) {
    if correspondences.is_empty() || n_source == 0 {
        return (0.0, 0.0);
    }
    let sum_sq: f64 = correspondences.iter().map(|c| c.2).sum();
    (
        correspondences.len() as f64 / n_source as f64,
        (sum_sq / correspondences.len() as f64).sqrt(),
    )
}

/// Closed-form rigid alignment of matched points (Kabsch / Horn).
fn solve_point_to_point(
    moved: &[Vector3<f64>],
    target: &[Vector3<f64>],
    correspondences: &[Correspondence],
) -> Option<SE3> {
    let n = correspondences.len() as f64;
    let src_centroid: Vector3<f64> = correspondences.iter().map(|c| moved[c.0]).sum::<Vector3<f64>>() / n;
    let tgt_centroid: Vector3<f64> = correspondences.iter().map(|c| target[c.1]).sum::<Vector3<f64>>() / n;

    let mut h = Matrix3::zeros();
    for &(i, j, _) in correspondences {
        h += (moved[i] - src_centroid) * (target[j] - tgt_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation_mat = v_t.transpose() * u.transpose();
    if rotation_mat.determinant() < 0.0 {
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&nalgebra::Rotation3::from_matrix_unchecked(rotation_mat));
    let translation = tgt_centroid - rotation * src_centroid;
    Some(SE3::new(rotation, translation))
}

/// One Gauss-Newton step on the linearized point-to-plane error.
///
/// Residual: n · (p + ω × p + t - q), parameters [ω, t].
fn solve_point_to_plane(
    moved: &[Vector3<f64>],
    target: &[Vector3<f64>],
    normals: &[Vector3<f64>],
    correspondences: &[Correspondence],
) -> Option<SE3> {
    let mut jtj = Matrix6::zeros();
    let mut jtr = Vector6::zeros();

    for &(i, j, _) in correspondences {
        let p = moved[i];
        let n = normals[j];
        let r = n.dot(&(p - target[j]));
        let cross = p.cross(&n);
        let jac = Vector6::new(cross.x, cross.y, cross.z, n.x, n.y, n.z);
        jtj += jac * jac.transpose();
        jtr += jac * r;
    }

    let delta = jtj.cholesky()?.solve(&(-jtr));
    let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(delta[0], delta[1], delta[2]));
    Some(SE3::new(rotation, Vector3::new(delta[3], delta[4], delta[5])))
}
