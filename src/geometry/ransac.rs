//! Shared RANSAC plumbing for the two-view model estimators.

use nalgebra::{Matrix3, Point2, SMatrix, SymmetricEigen};
use rand::rngs::StdRng;
use rand::seq::index;
use serde::Deserialize;

/// Configuration for a seeded RANSAC run.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    /// Maximum number of hypotheses.
    pub max_iterations: usize,
    /// Inlier threshold in pixels.
    pub threshold: f64,
    /// Probability of having drawn at least one outlier-free sample.
    pub confidence: f64,
    /// Seed of the sampling RNG.
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            threshold: 3.0,
            confidence: 0.995,
            seed: 0,
        }
    }
}

/// Output of a robust fit: the model plus its inlier mask.
#[derive(Debug, Clone)]
pub struct RansacFit {
    pub model: Matrix3<f64>,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    pub iterations: usize,
}

/// Draw `k` distinct indices out of `n`.
pub(crate) fn draw_sample(rng: &mut StdRng, n: usize, k: usize) -> Vec<usize> {
    index::sample(rng, n, k).into_vec()
}

/// Number of iterations needed to reach `confidence` for the given inlier ratio.
pub(crate) fn adaptive_iterations(
    confidence: f64,
    inlier_ratio: f64,
    sample_size: i32,
    max_iterations: usize,
) -> usize {
    if inlier_ratio <= 0.0 {
        return max_iterations;
    }
    let p_good = inlier_ratio.powi(sample_size);
    if p_good >= 1.0 {
        return 1;
    }
    let p_fail = (1.0 - p_good).max(1e-15);
    let k = (1.0 - confidence).ln() / p_fail.ln();
    if !k.is_finite() {
        return max_iterations;
    }
    (k.ceil().max(1.0) as usize).min(max_iterations)
}

/// Hartley normalization: centroid to origin, mean distance sqrt(2).
///
/// Returns the similarity transform and the transformed points.
pub(crate) fn hartley_normalize(pts: &[Point2<f64>]) -> (Matrix3<f64>, Vec<Point2<f64>>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;

    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| Point2::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();

    (t, normalized)
}

/// Null vector of the 9-column design matrix accumulated as AᵀA.
///
/// Uses the eigenvector of the smallest eigenvalue of the symmetric 9×9
/// normal matrix, which also works for minimal samples where A has fewer
/// rows than columns.
pub(crate) fn smallest_eigenvector(ata: SMatrix<f64, 9, 9>) -> Matrix3<f64> {
    let eig = SymmetricEigen::new(ata);
    let mut min_idx = 0;
    let mut min_val = eig.eigenvalues[0].abs();
    for i in 1..9 {
        let v = eig.eigenvalues[i].abs();
        if v < min_val {
            min_val = v;
            min_idx = i;
        }
    }
    let h = eig.eigenvectors.column(min_idx);
    Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8])
}
