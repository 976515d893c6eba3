//! Ground-plane fitting and rectification. RANSAC runs on a seeded RNG so
//! a frame always produces the same plane.

use glam::{Quat, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const RANSAC_ITERATIONS: u32 = 100;
/// 5cm inlier threshold
pub const RANSAC_THRESHOLD_M: f32 = 0.05;
/// A plane must claim at least this fraction of the candidates
pub const RANSAC_MIN_INLIER_RATIO: f32 = 0.20;
/// Plane normal must be within 15 degrees of camera-up
const MAX_TILT_DEG: f32 = 15.0;

/// Fitted ground plane: n . p + d = 0 with n oriented upward
#[derive(Clone, Copy, Debug)]
pub struct GroundPlane {
    pub normal: Vec3,
    pub distance: f32,
    pub inlier_count: usize,
    pub inlier_ratio: f32,
    pub is_valid: bool,
}

/// RANSAC plane fit over the candidate subset of a point cloud.
/// Returns the plane and the candidate-set inlier indices (into `points`),
/// or None when no acceptable plane exists.
pub fn fit_ground_plane(
    points: &[Vec3],
    candidates: &[usize],
    seed: u64,
) -> Option<(GroundPlane, Vec<usize>)> {
    if candidates.len() < 3 {
        return None;
    }

    let min_inliers = ((candidates.len() as f32) * RANSAC_MIN_INLIER_RATIO).ceil() as usize;
    let cos_max_tilt = MAX_TILT_DEG.to_radians().cos();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut best: Option<(Vec3, f32, usize)> = None;

    for _ in 0..RANSAC_ITERATIONS {
        let ia = candidates[rng.random_range(0..candidates.len())];
        let ib = candidates[rng.random_range(0..candidates.len())];
        let ic = candidates[rng.random_range(0..candidates.len())];
        if ia == ib || ib == ic || ia == ic {
            continue;
        }

        let a = points[ia];
        let b = points[ib];
        let c = points[ic];

        let mut normal = (b - a).cross(c - a);
        if normal.length_squared() < 1e-12 {
            continue;
        }
        normal = normal.normalize();
        // Orient upward
        if normal.y < 0.0 {
            normal = -normal;
        }
        if normal.y < cos_max_tilt {
            continue;
        }

        let distance = -normal.dot(a);
        let inliers = candidates
            .iter()
            .filter(|idx| (normal.dot(points[**idx]) + distance).abs() < RANSAC_THRESHOLD_M)
            .count();

        let better = match &best {
            Some((_, _, best_count)) => inliers > *best_count,
            None => true,
        };
        if better {
            best = Some((normal, distance, inliers));
        }
    }

    let (normal, distance, inlier_count) = best?;
    if inlier_count < min_inliers {
        return None;
    }

    let inlier_indices: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|idx| (normal.dot(points[*idx]) + distance).abs() < RANSAC_THRESHOLD_M)
        .collect();

    let plane = GroundPlane {
        normal,
        distance,
        inlier_count,
        inlier_ratio: inlier_count as f32 / candidates.len() as f32,
        is_valid: true,
    };

    Some((plane, inlier_indices))
}

/// Rotates the cloud so the fitted plane becomes Y = 0 with up = +Y
pub fn rectify(points: &[Vec3], plane: &GroundPlane) -> Vec<Vec3> {
    let rotation = Quat::from_rotation_arc(plane.normal, Vec3::Y);
    points
        .iter()
        .map(|p| {
            let rotated = rotation * *p;
            Vec3::new(rotated.x, rotated.y + plane.distance, rotated.z)
        })
        .collect()
}

/// P95 of |Y| over the given indices of a rectified cloud
pub fn flatness_p95(rectified: &[Vec3], indices: &[usize]) -> f32 {
    let abs_y: Vec<f32> = indices.iter().map(|i| rectified[*i].y.abs()).collect();
    crate::utils::percentile(&abs_y, 95.0)
}
