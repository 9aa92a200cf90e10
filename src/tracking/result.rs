//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during one reference-to-current call:
//! - per-feature predictions written back to the owning frame
//! - correspondence counts and quality rates
//! - timing information for profiling

use nalgebra::{Matrix3, Point2, Vector2};

/// Per-feature data handed back to the frame that owns the current image.
///
/// Every vector is index-aligned with the reference keypoints.
#[derive(Debug, Clone)]
pub struct TrackingOutput {
    /// Gyro-only predictions, before refinement. Undistorted.
    pub gyro_predictions_un: Vec<Point2<f64>>,
    /// Final predictions, distorted.
    pub predictions: Vec<Point2<f64>>,
    pub predictions_un: Vec<Point2<f64>>,
    pub status: Vec<bool>,
    /// NCC reported by the refiner, 0 where no refinement ran.
    pub ncc: Vec<f32>,
    /// Predicted patch corners relative to the predicted center.
    pub corner_flows: Vec<[Vector2<f64>; 4]>,
    pub rcl: Matrix3<f64>,
}

/// Scalar metrics of one tracking call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackingMetrics {
    pub n_ref_keys: usize,
    /// Valid predictions entering geometric validation.
    pub n_predicted: usize,
    /// Predictions surviving geometric validation.
    pub n_inliers: usize,
    pub n_imu: usize,
    pub track_score: f64,
    pub n_matches: usize,
}

fn percent(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        100.0 * num as f64 / den as f64
    }
}

impl TrackingMetrics {
    /// Share of predictions that are geometrically valid, in percent.
    pub fn prediction_success_rate(&self) -> f64 {
        percent(self.n_inliers, self.n_predicted)
    }

    /// Share of reference keypoints tracked to a valid prediction, in percent.
    pub fn track_rate(&self) -> f64 {
        percent(self.n_inliers, self.n_ref_keys)
    }

    /// Share of reference keypoints that received a prediction, in percent.
    pub fn recall_rate(&self) -> f64 {
        percent(self.n_predicted, self.n_ref_keys)
    }
}

/// Stage timings of one call, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingStats {
    pub integrate: f64,
    pub gyro_predict: f64,
    pub opt_flow: f64,
    pub opt_flow_filter: f64,
    pub find_neighbors: f64,
    pub match_features: f64,
    pub geometry_validation: f64,
}

impl TimingStats {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Prediction, refinement, filtering and validation.
    pub fn feature_track_total(&self) -> f64 {
        self.gyro_predict + self.opt_flow + self.opt_flow_filter + self.geometry_validation
    }
}
