//! Fundamental matrix estimation for two-view validation.
//!
//! Normalized eight-point algorithm with rank-2 enforcement, wrapped in a
//! seeded RANSAC loop. Inliers are scored with the squared point-to-epipolar
//! line distance in both images.

use nalgebra::{Matrix3, Point2, SMatrix, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::ransac::{
    adaptive_iterations, draw_sample, hartley_normalize, smallest_eigenvector, RansacConfig,
    RansacFit,
};

const SAMPLE_SIZE: usize = 8;

/// Squared distance of `x2` to the epipolar line `F · x1` in the second image.
pub fn epipolar_distance_sq(f: &Matrix3<f64>, x1: &Point2<f64>, x2: &Point2<f64>) -> f64 {
    let l = f * Vector3::new(x1.x, x1.y, 1.0);
    let num = l.x * x2.x + l.y * x2.y + l.z;
    let den = l.x * l.x + l.y * l.y;
    if den < 1e-30 {
        return f64::INFINITY;
    }
    num * num / den
}

/// Estimate F with `x2ᵀ F x1 = 0` from ≥8 correspondences.
pub fn estimate_fundamental_8pt(x1: &[Point2<f64>], x2: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = x1.len();
    if n < SAMPLE_SIZE || n != x2.len() {
        return None;
    }

    let (t1, p1) = hartley_normalize(x1);
    let (t2, p2) = hartley_normalize(x2);

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    for (a, b) in p1.iter().zip(p2.iter()) {
        let row = [
            b.x * a.x,
            b.x * a.y,
            b.x,
            b.y * a.x,
            b.y * a.y,
            b.y,
            a.x,
            a.y,
            1.0,
        ];
        for i in 0..9 {
            for j in 0..9 {
                ata[(i, j)] += row[i] * row[j];
            }
        }
    }

    let f_norm = enforce_rank2(&smallest_eigenvector(ata))?;
    let f = t2.transpose() * f_norm * t1;

    if !f.iter().all(|v| v.is_finite()) {
        return None;
    }
    let norm = f.norm();
    if norm < 1e-15 {
        return None;
    }
    Some(f / norm)
}

/// Zero the smallest singular value.
fn enforce_rank2(f: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = f.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut s = svd.singular_values;
    let (min_idx, _) = s
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |acc, (i, &v)| if v < acc.1 { (i, v) } else { acc });
    s[min_idx] = 0.0;
    Some(u * Matrix3::from_diagonal(&s) * v_t)
}

fn score(f: &Matrix3<f64>, x1: &[Point2<f64>], x2: &[Point2<f64>], th2: f64) -> (Vec<bool>, usize) {
    let ft = f.transpose();
    let inliers: Vec<bool> = x1
        .iter()
        .zip(x2.iter())
        .map(|(a, b)| {
            let d2 = epipolar_distance_sq(f, a, b);
            let d1 = epipolar_distance_sq(&ft, b, a);
            d1.max(d2) <= th2
        })
        .collect();
    let count = inliers.iter().filter(|&&b| b).count();
    (inliers, count)
}

/// Robustly estimate F with `x2ᵀ F x1 = 0`.
///
/// Returns `None` if fewer than eight correspondences are given or no
/// hypothesis reaches eight inliers.
pub fn find_fundamental_ransac(
    x1: &[Point2<f64>],
    x2: &[Point2<f64>],
    config: &RansacConfig,
) -> Option<RansacFit> {
    let n = x1.len();
    if n < SAMPLE_SIZE || n != x2.len() {
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
        let a: Vec<Point2<f64>> = sample.iter().map(|&i| x1[i]).collect();
        let b: Vec<Point2<f64>> = sample.iter().map(|&i| x2[i]).collect();
        let Some(f) = estimate_fundamental_8pt(&a, &b) else {
            continue;
        };

        let (inliers, count) = score(&f, x1, x2, th2);
        if best.as_ref().map_or(true, |b| count > b.2) {
            max_iters = adaptive_iterations(
                config.confidence,
                count as f64 / n as f64,
                SAMPLE_SIZE as i32,
                config.max_iterations,
            );
            best = Some((f, inliers, count));
        }
    }

    let (mut f, mut inliers, mut count) = best?;
    if count < SAMPLE_SIZE {
        return None;
    }

    let a: Vec<Point2<f64>> = (0..n).filter(|&i| inliers[i]).map(|i| x1[i]).collect();
    let b: Vec<Point2<f64>> = (0..n).filter(|&i| inliers[i]).map(|i| x2[i]).collect();
    if let Some(refined) = estimate_fundamental_8pt(&a, &b) {
        let (refined_inliers, refined_count) = score(&refined, x1, x2, th2);
        if refined_count >= count {
            f = refined;
            inliers = refined_inliers;
            count = refined_count;
        }
    }

    debug!(iterations, inliers = count, total = n, "fundamental ransac");

    Some(RansacFit {
        model: f,
        inliers,
        num_inliers: count,
        iterations,
    })
}
