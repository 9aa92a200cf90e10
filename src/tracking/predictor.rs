//! Rotation-only pixel prediction.
//!
//! With no depth or translation, a pixel `u1` in the reference frame maps to
//!
//! ```text
//! u2 ≈ λ · K·R·K⁻¹ · u1,   λ = 1 / (r3 · K⁻¹ · u1)
//! ```
//!
//! where `r3` is the third row of the relative rotation. The single-homography
//! model fixes λ = 1.

use nalgebra::{Matrix2, Matrix3, Point2, Vector2};
use rayon::prelude::*;

use crate::camera::CameraModel;
use crate::tracking::affine::{estimate_affine, patch_corners};
use crate::tracking::mode::PredictMethod;

/// Predicted location of one pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelPrediction {
    pub undistorted: Point2<f64>,
    pub distorted: Point2<f64>,
    /// Predicted minus reference, both undistorted.
    pub flow: Vector2<f64>,
}

/// Gyro prediction of a feature and its patch.
#[derive(Debug, Clone)]
pub struct FeaturePrediction {
    pub center: PixelPrediction,
    pub corners_un: [Point2<f64>; 4],
    pub corners: [Point2<f64>; 4],
    /// Predicted corner minus predicted center, undistorted.
    pub corner_offsets: [Vector2<f64>; 4],
    pub affine: Matrix2<f64>,
}

pub struct PixelPredictor<'a> {
    camera: &'a CameraModel,
    rcl: Matrix3<f64>,
    krk_inv: Matrix3<f64>,
    method: PredictMethod,
}

impl<'a> PixelPredictor<'a> {
    pub fn new(camera: &'a CameraModel, rcl: Matrix3<f64>, method: PredictMethod) -> Self {
        let krk_inv = camera.k() * rcl * camera.k_inv();
        Self {
            camera,
            rcl,
            krk_inv,
            method,
        }
    }

    /// Predict where the undistorted reference pixel lands in the current frame.
    pub fn predict_pixel(&self, pt_ref: &Point2<f64>) -> PixelPrediction {
        let lambda = match self.method {
            PredictMethod::PixelAware => {
                let xn = self.camera.normalize_lookup(pt_ref);
                1.0 / (self.rcl[(2, 0)] * xn.x + self.rcl[(2, 1)] * xn.y + self.rcl[(2, 2)])
            }
            PredictMethod::SingleHomography => 1.0,
        };

        let m = &self.krk_inv;
        let undistorted = Point2::new(
            (m[(0, 0)] * pt_ref.x + m[(0, 1)] * pt_ref.y + m[(0, 2)]) * lambda,
            (m[(1, 0)] * pt_ref.x + m[(1, 1)] * pt_ref.y + m[(1, 2)]) * lambda,
        );
        let distorted = self.camera.distort_pixel(&undistorted);

        PixelPrediction {
            undistorted,
            distorted,
            flow: undistorted - pt_ref,
        }
    }

    /// True if both the undistorted and distorted predictions are inside the image.
    pub fn in_bounds(&self, p: &PixelPrediction) -> bool {
        self.camera.in_image(&p.undistorted) && self.camera.in_image(&p.distorted)
    }

    /// Predict a feature, its four patch corners and its affine deformation.
    ///
    /// Returns `None` when the center prediction leaves the image. Corners are
    /// not bounds-checked.
    pub fn predict_feature(
        &self,
        pt_ref: &Point2<f64>,
        template: &[Vector2<f64>; 4],
    ) -> Option<FeaturePrediction> {
        let center = self.predict_pixel(pt_ref);
        if !self.in_bounds(&center) {
            return None;
        }

        let mut corners_un = [Point2::origin(); 4];
        let mut corners = [Point2::origin(); 4];
        let mut corner_offsets = [Vector2::zeros(); 4];
        for (j, offset) in template.iter().enumerate() {
            let corner = self.predict_pixel(&(pt_ref + offset));
            corners_un[j] = corner.undistorted;
            corners[j] = corner.distorted;
            corner_offsets[j] = corner.undistorted - center.undistorted;
        }

        Some(FeaturePrediction {
            center,
            corners_un,
            corners,
            corner_offsets,
            affine: estimate_affine(&corner_offsets, template),
        })
    }
}

/// Predict every reference feature in parallel. The output is index-aligned
/// with `keys_ref_un`.
pub fn predict_features(
    predictor: &PixelPredictor<'_>,
    keys_ref_un: &[Point2<f64>],
    half_patch_size: usize,
) -> Vec<Option<FeaturePrediction>> {
    let template = patch_corners(half_patch_size);
    keys_ref_un
        .par_iter()
        .map(|p| predictor.predict_feature(p, &template))
        .collect()
}
