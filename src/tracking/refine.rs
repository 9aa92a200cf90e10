//! Photometric refinement contract and the filter applied to its output.

use nalgebra::{Matrix2, Point2};

use crate::camera::CameraModel;
use crate::image::FloatImage;
use crate::tracking::mode::RefinementFlags;

/// Inputs for one batch refinement. All slices are index-aligned.
pub struct RefinementRequest<'a> {
    pub reference: &'a FloatImage,
    pub current: &'a FloatImage,
    pub camera: &'a CameraModel,
    /// Reference keypoints, distorted.
    pub ref_points: &'a [Point2<f64>],
    /// Initial guesses in the current image, distorted.
    pub initial: &'a [Point2<f64>],
    /// Only features with `true` are refined.
    pub active: &'a [bool],
    pub affine: &'a [Matrix2<f64>],
    pub flags: RefinementFlags,
    pub half_patch_size: usize,
    pub iterations: usize,
    pub pyramid_levels: usize,
    pub regularization_weight: f64,
}

impl RefinementRequest<'_> {
    pub fn len(&self) -> usize {
        self.ref_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ref_points.is_empty()
    }
}

/// Refiner output for one feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefinedFeature {
    /// Refined location, distorted.
    pub point: Point2<f64>,
    pub point_un: Point2<f64>,
    pub success: bool,
    /// Mean absolute intensity residual over the patch.
    pub residual: f64,
    pub ncc: f32,
}

impl RefinedFeature {
    pub fn failed(at: Point2<f64>) -> Self {
        Self {
            point: at,
            point_un: at,
            success: false,
            residual: f64::INFINITY,
            ncc: 0.0,
        }
    }
}

/// Patch-level photometric alignment of predicted features.
///
/// Implementations return one entry per request index and perform no
/// filtering of their own.
pub trait PhotometricRefiner: Send + Sync {
    fn refine(&self, request: &RefinementRequest<'_>) -> Vec<RefinedFeature>;
}

/// Result of thresholding a refinement batch.
#[derive(Debug, Clone)]
pub struct RefinementFilter {
    pub avg_residual: f64,
    pub pixel_threshold: f64,
    pub distance_threshold: f64,
    /// Distance of each refined point from its initial guess.
    pub distances: Vec<f64>,
    pub accepted: Vec<bool>,
}

impl RefinementFilter {
    pub fn num_accepted(&self) -> usize {
        self.accepted.iter().filter(|&&a| a).count()
    }
}

/// Keep refined features with `residual < max(4·avg, h)` and a shift from
/// the initial guess below `4·h`. The average is over successful features.
pub fn filter_refined(
    refined: &[RefinedFeature],
    initial: &[Point2<f64>],
    half_patch_size: usize,
) -> RefinementFilter {
    let h = half_patch_size as f64;
    let (sum, cnt) = refined
        .iter()
        .filter(|r| r.success)
        .fold((0.0, 0usize), |(s, c), r| (s + r.residual, c + 1));
    let avg_residual = if cnt > 0 { sum / cnt as f64 } else { 0.0 };

    let pixel_threshold = (4.0 * avg_residual).max(h);
    let distance_threshold = 4.0 * h;

    let distances: Vec<f64> = refined
        .iter()
        .zip(initial.iter())
        .map(|(r, p)| (r.point - p).norm())
        .collect();

    let accepted = refined
        .iter()
        .zip(distances.iter())
        .map(|(r, &d)| r.success && r.residual < pixel_threshold && d < distance_threshold)
        .collect();

    RefinementFilter {
        avg_residual,
        pixel_threshold,
        distance_threshold,
        distances,
        accepted,
    }
}
