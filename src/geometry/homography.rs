//! Image-to-image homography estimation via DLT with Hartley normalization.
//!
//! Provides:
//! - Direct Linear Transform (DLT) from ≥4 point correspondences.
//! - Seeded RANSAC wrapper with reprojection-error inliers and a final refit.
//! - Point transfer through a homography.

use nalgebra::{Matrix3, Point2, SMatrix, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::ransac::{
    adaptive_iterations, draw_sample, hartley_normalize, smallest_eigenvector, RansacConfig,
    RansacFit,
};

const SAMPLE_SIZE: usize = 4;

/// Project a 2D point through a 3×3 homography: H * [x, y, 1]^T → [u, v].
///
/// Returns `None` when the point maps to infinity.
pub fn transfer(h: &Matrix3<f64>, p: &Point2<f64>) -> Option<Point2<f64>> {
    let q = h * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < 1e-15 {
        return None;
    }
    Some(Point2::new(q.x / q.z, q.y / q.z))
}

/// Estimate H with `dst ≈ H · src` from ≥4 correspondences.
pub fn estimate_homography_dlt(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = src.len();
    if n < SAMPLE_SIZE || n != dst.len() {
        return None;
    }

    let (t_src, src_n) = hartley_normalize(src);
    let (t_dst, dst_n) = hartley_normalize(dst);

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (s, d) in src_n.iter().zip(dst_n.iter()) {
        let r1 = [0.0, 0.0, 0.0, -s.x, -s.y, -1.0, d.y * s.x, d.y * s.y, d.y];
        let r2 = [s.x, s.y, 1.0, 0.0, 0.0, 0.0, -d.x * s.x, -d.x * s.y, -d.x];
        for row in [r1, r2] {
            for i in 0..9 {
                for j in 0..9 {
                    ata[(i, j)] += row[i] * row[j];
                }
            }
        }
    }

    let h_norm = smallest_eigenvector(ata);

    // Denormalize: H = T_dst^-1 * H_norm * T_src
    let h = t_dst.try_inverse()? * h_norm * t_src;
    let scale = h[(2, 2)];
    if !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    if scale.abs() < 1e-15 {
        Some(h)
    } else {
        Some(h / scale)
    }
}

fn reprojection_sq(h: &Matrix3<f64>, src: &Point2<f64>, dst: &Point2<f64>) -> f64 {
    match transfer(h, src) {
        Some(p) => (p - dst).norm_squared(),
        None => f64::INFINITY,
    }
}

fn score(h: &Matrix3<f64>, src: &[Point2<f64>], dst: &[Point2<f64>], th2: f64) -> (Vec<bool>, usize) {
    let inliers: Vec<bool> = src
        .iter()
        .zip(dst.iter())
        .map(|(s, d)| reprojection_sq(h, s, d) <= th2)
        .collect();
    let count = inliers.iter().filter(|&&b| b).count();
    (inliers, count)
}

/// Robustly estimate H with `dst ≈ H · src`.
///
/// Returns `None` if no hypothesis gathers at least four inliers.
pub fn find_homography_ransac(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
    config: &RansacConfig,
) -> Option<RansacFit> {
    let n = src.len();
    if n < SAMPLE_SIZE || n != dst.len() {
        return None;
    }

    let th2 = config.threshold * config.threshold;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<(Matrix3<f64>, Vec<bool>, usize)> = None;
    let mut max_iters = config.max_iterations;
    let mut iterations = 0;

    while iterations < max_iters {
        iterations += 1;

        let sample = draw_sample(&mut rng, n, SAMPLE_SIZE);
        let s: Vec<Point2<f64>> = sample.iter().map(|&i| src[i]).collect();
        let d: Vec<Point2<f64>> = sample.iter().map(|&i| dst[i]).collect();
        let Some(h) = estimate_homography_dlt(&s, &d) else {
            continue;
        };

        let (inliers, count) = score(&h, src, dst, th2);
        if best.as_ref().map_or(true, |b| count > b.2) {
            max_iters = adaptive_iterations(
                config.confidence,
                count as f64 / n as f64,
                SAMPLE_SIZE as i32,
                config.max_iterations,
            );
            best = Some((h, inliers, count));
        }
    }

    let (mut h, mut inliers, mut count) = best?;
    if count < SAMPLE_SIZE {
        return None;
    }

    // Refit on all inliers.
    let s: Vec<Point2<f64>> = (0..n).filter(|&i| inliers[i]).map(|i| src[i]).collect();
    let d: Vec<Point2<f64>> = (0..n).filter(|&i| inliers[i]).map(|i| dst[i]).collect();
    if let Some(refined) = estimate_homography_dlt(&s, &d) {
        let (refined_inliers, refined_count) = score(&refined, src, dst, th2);
        if refined_count >= count {
            h = refined;
            inliers = refined_inliers;
            count = refined_count;
        }
    }

    debug!(iterations, inliers = count, total = n, "homography ransac");

    Some(RansacFit {
        model: h,
        inliers,
        num_inliers: count,
        iterations,
    })
}
