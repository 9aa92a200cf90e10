//! Two-view geometric validation of predicted correspondences.
//!
//! A homography and a fundamental matrix are fitted on two threads. Each
//! correspondence is scored against both with symmetric chi-square tests and
//! the model with the better share of the total score decides the outliers.

use std::thread;

use nalgebra::{Matrix3, Point2};
use tracing::{debug, error, warn};

use crate::geometry::fundamental::{epipolar_distance_sq, find_fundamental_ransac};
use crate::geometry::homography::{find_homography_ransac, transfer};
use crate::geometry::RansacConfig;

/// Chi-square threshold for 2 DOF at 95%.
const CHI2_2DOF: f64 = 5.99;
/// Chi-square threshold for 1 DOF at 95%.
const CHI2_1DOF: f64 = 3.84;
/// Homography is chosen when its share of the score exceeds this.
const RH_THRESHOLD: f64 = 0.45;
/// Validation needs more correspondences than this.
const MIN_CORRESPONDENCES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedModel {
    Homography,
    Fundamental,
}

/// Scores of one fitted model.
#[derive(Debug, Clone)]
pub struct ModelCheck {
    pub model: Option<Matrix3<f64>>,
    pub score: f64,
    pub inliers: Vec<bool>,
}

impl ModelCheck {
    fn failed(n: usize) -> Self {
        Self {
            model: None,
            score: 0.0,
            inliers: vec![false; n],
        }
    }
}

/// Outcome of one validation call.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Valid predictions entering validation.
    pub num_candidates: usize,
    pub num_inliers: usize,
    pub num_outliers: usize,
    pub score_h: f64,
    pub score_f: f64,
    /// `score_h / (score_h + score_f)`.
    pub ratio_h: f64,
    pub selected: Option<SelectedModel>,
    /// Score of the selected model.
    pub track_score: f64,
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct GeometricValidator {
    pub sigma: f64,
    pub homography: RansacConfig,
    pub fundamental: RansacConfig,
    pub width: usize,
    pub height: usize,
}

/// Symmetric transfer test against `H21`: `x2 ≈ H21·x1` and `x1 ≈ H21⁻¹·x2`.
pub fn check_homography(
    pts1: &[Point2<f64>],
    pts2: &[Point2<f64>],
    sigma: f64,
    config: &RansacConfig,
) -> ModelCheck {
    let n = pts1.len();
    let Some(fit) = find_homography_ransac(pts1, pts2, config) else {
        return ModelCheck::failed(n);
    };
    let h21 = fit.model;
    let Some(h12) = h21.try_inverse() else {
        return ModelCheck::failed(n);
    };

    let inv_sigma2 = 1.0 / (sigma * sigma);
    let mut score = 0.0;
    let mut inliers = Vec::with_capacity(n);
    for (p1, p2) in pts1.iter().zip(pts2.iter()) {
        let mut inlier = true;
        for (src, dst, h) in [(p1, p2, &h21), (p2, p1, &h12)] {
            let chi2 = match transfer(h, src) {
                Some(p) => (p - dst).norm_squared() * inv_sigma2,
                None => f64::INFINITY,
            };
            if chi2 > CHI2_2DOF {
                inlier = false;
            } else {
                score += CHI2_2DOF - chi2;
            }
        }
        inliers.push(inlier);
    }

    ModelCheck {
        model: Some(h21),
        score,
        inliers,
    }
}

/// Symmetric epipolar test against `F21` with `x2ᵀ·F21·x1 = 0`.
pub fn check_fundamental(
    pts1: &[Point2<f64>],
    pts2: &[Point2<f64>],
    sigma: f64,
    config: &RansacConfig,
) -> ModelCheck {
    let n = pts1.len();
    let Some(fit) = find_fundamental_ransac(pts1, pts2, config) else {
        return ModelCheck::failed(n);
    };
    let f21 = fit.model;
    let f12 = f21.transpose();

    let inv_sigma2 = 1.0 / (sigma * sigma);
    let mut score = 0.0;
    let mut inliers = Vec::with_capacity(n);
    for (p1, p2) in pts1.iter().zip(pts2.iter()) {
        let mut inlier = true;
        for chi2 in [
            epipolar_distance_sq(&f21, p1, p2) * inv_sigma2,
            epipolar_distance_sq(&f12, p2, p1) * inv_sigma2,
        ] {
            if chi2 > CHI2_1DOF {
                inlier = false;
            } else {
                // Scored on the 2-DOF scale so H and F are comparable.
                score += CHI2_2DOF - chi2;
            }
        }
        inliers.push(inlier);
    }

    ModelCheck {
        model: Some(f21),
        score,
        inliers,
    }
}

impl GeometricValidator {
    /// Invalidate geometric outliers among the valid features.
    ///
    /// `pts_ref` and `pts_cur` are the undistorted reference keypoints and
    /// predictions, index-aligned with `status`.
    pub fn validate(
        &self,
        pts_ref: &[Point2<f64>],
        pts_cur: &[Point2<f64>],
        status: &mut [bool],
    ) -> ValidationReport {
        let indices: Vec<usize> = (0..status.len()).filter(|&i| status[i]).collect();
        let pts1: Vec<Point2<f64>> = indices.iter().map(|&i| pts_ref[i]).collect();
        let pts2: Vec<Point2<f64>> = indices.iter().map(|&i| pts_cur[i]).collect();
        let n = indices.len();

        let mut report = ValidationReport {
            num_candidates: n,
            num_inliers: n,
            skipped: true,
            ..ValidationReport::default()
        };

        if n <= MIN_CORRESPONDENCES {
            debug!(n, "too few correspondences, skipping geometric validation");
            return report;
        }

        let (check_h, check_f) = thread::scope(|s| {
            let h = s.spawn(|| check_homography(&pts1, &pts2, self.sigma, &self.homography));
            let f = s.spawn(|| check_fundamental(&pts1, &pts2, self.sigma, &self.fundamental));
            let join = |name: &str, r: thread::Result<ModelCheck>| {
                r.unwrap_or_else(|_| {
                    error!(model = name, "model fitting thread panicked");
                    ModelCheck::failed(n)
                })
            };
            (join("homography", h.join()), join("fundamental", f.join()))
        });

        if check_h.model.is_none() && check_f.model.is_none() {
            warn!(n, "neither homography nor fundamental matrix could be fitted");
            return report;
        }

        let total = check_h.score + check_f.score;
        let ratio_h = if total > 0.0 { check_h.score / total } else { 0.0 };
        let (selected, chosen) = if ratio_h > RH_THRESHOLD {
            (SelectedModel::Homography, &check_h)
        } else {
            (SelectedModel::Fundamental, &check_f)
        };

        let mut num_inliers = 0;
        let mut num_outliers = 0;
        for (k, &i) in indices.iter().enumerate() {
            let p = &pts2[k];
            let outside = p.x < 0.0
                || p.y < 0.0
                || p.x as usize >= self.width
                || p.y as usize >= self.height;
            if !chosen.inliers[k] || outside {
                status[i] = false;
                num_outliers += 1;
            } else {
                num_inliers += 1;
            }
        }

        debug!(
            n,
            num_inliers,
            score_h = check_h.score,
            score_f = check_f.score,
            ratio_h,
            ?selected,
            "geometric validation"
        );

        report.num_inliers = num_inliers;
        report.num_outliers = num_outliers;
        report.score_h = check_h.score;
        report.score_f = check_f.score;
        report.ratio_h = ratio_h;
        report.selected = Some(selected);
        report.track_score = chosen.score;
        report.skipped = false;
        report
    }
}
