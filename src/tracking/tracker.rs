//! Gyro-aided feature tracker: orchestrates one reference-to-current call.
//!
//! Pipeline:
//! - integrate the gyro samples between the two frames into Rcl
//! - predict every reference feature (and its patch corners) from Rcl alone
//! - optionally refine the predictions photometrically and filter them
//! - associate predictions with the current frame's own detections
//! - reject geometric outliers with a homography / fundamental matrix test
//!
//! All per-feature state lives in index-aligned arenas of length N.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use image::GrayImage;
use nalgebra::{Matrix2, Matrix3, Point2, Vector2};
use rayon::prelude::*;
use tracing::{debug, error, info};

use crate::camera::CameraModel;
use crate::error::{Result, TrackerError};
use crate::image::FloatImage;
use crate::imu::{relative_camera_rotation, GyroBias, GyroSample, ImuCalib};
use crate::tracking::config::TrackerConfig;
use crate::tracking::klt::PyramidalPatchRefiner;
use crate::tracking::mode::{RefinementFlags, TrackingMode};
use crate::tracking::neighbors::{
    find_and_sort_near_neighbors, match_features, AssociationParams, Match, NeighborSearch,
};
use crate::tracking::predictor::{predict_features, PixelPredictor};
use crate::tracking::refine::{filter_refined, PhotometricRefiner, RefinedFeature, RefinementRequest};
use crate::tracking::result::{TimingStats, TrackingMetrics, TrackingOutput};
use crate::tracking::stats::DiagnosticLog;
use crate::tracking::validation::{GeometricValidator, ValidationReport};

/// Plain optical-flow results with a residual at or above this are dropped.
const MAX_FLOW_RESIDUAL: f64 = 12.0;
/// Radius of the detection search around optical-flow results, pixels.
const KLT_SEARCH_RADIUS: f64 = 4.0;
const KLT_RATIO: f64 = 0.7;
/// Matches with a disparity above this multiple of the mean are dropped.
const KLT_DISPARITY_FACTOR: f64 = 1.5;

/// One frame as seen by the tracker.
#[derive(Debug, Clone, Copy)]
pub struct FrameData<'a> {
    pub timestamp: f64,
    pub image: &'a GrayImage,
    /// Detected keypoints, distorted.
    pub keypoints: &'a [Point2<f64>],
    pub keypoints_un: &'a [Point2<f64>],
}

impl FrameData<'_> {
    fn check(&self, what: &'static str) -> Result<()> {
        if self.keypoints.len() != self.keypoints_un.len() {
            return Err(TrackerError::LengthMismatch {
                what,
                expected: self.keypoints.len(),
                got: self.keypoints_un.len(),
            });
        }
        if self.image.width() == 0 || self.image.height() == 0 {
            return Err(TrackerError::EmptyImage { which: what });
        }
        Ok(())
    }

    fn check_size(&self, what: &'static str, camera: &CameraModel) -> Result<()> {
        let (w, h) = self.image.dimensions();
        if w as usize != camera.width || h as usize != camera.height {
            return Err(TrackerError::ImageSize {
                which: what,
                width: camera.width,
                height: camera.height,
                got_width: w as usize,
                got_height: h as usize,
            });
        }
        Ok(())
    }
}

pub struct GyroAidedTracker<'a> {
    config: &'a TrackerConfig,
    camera: &'a CameraModel,
    refiner: Arc<dyn PhotometricRefiner>,
    log: Option<DiagnosticLog>,

    t_ref: f64,
    t_cur: f64,
    reference: FloatImage,
    current: FloatImage,
    keys_ref: &'a [Point2<f64>],
    keys_ref_un: &'a [Point2<f64>],
    keys_cur: &'a [Point2<f64>],
    keys_cur_un: &'a [Point2<f64>],

    gyro: &'a [GyroSample],
    bias: GyroBias,
    calib: ImuCalib,
    rcl: Matrix3<f64>,

    // Per-feature arenas, all of length N.
    predictions: Vec<Point2<f64>>,
    predictions_un: Vec<Point2<f64>>,
    flows_un: Vec<Vector2<f64>>,
    status: Vec<bool>,
    corners: Vec<[Point2<f64>; 4]>,
    corners_un: Vec<[Point2<f64>; 4]>,
    corner_flows: Vec<[Vector2<f64>; 4]>,
    affine: Vec<Matrix2<f64>>,
    gyro_predictions: Vec<Point2<f64>>,
    gyro_predictions_un: Vec<Point2<f64>>,
    ncc: Vec<f32>,
    residuals: Vec<f64>,
    refine_distances: Vec<f64>,
    neighbors: Vec<Vec<Match>>,
    flow_errors_un: Vec<Vector2<f64>>,

    matches: Vec<Match>,
    disparities: Vec<f64>,
    validation: Option<ValidationReport>,
    metrics: TrackingMetrics,
    timing: TimingStats,
}

impl<'a> GyroAidedTracker<'a> {
    /// Set up a tracker for one frame pair.
    ///
    /// `gyro` holds the samples between the two frame timestamps.
    pub fn new(
        reference: FrameData<'a>,
        current: FrameData<'a>,
        gyro: &'a [GyroSample],
        bias: GyroBias,
        calib: ImuCalib,
        camera: &'a CameraModel,
        config: &'a TrackerConfig,
    ) -> Result<Self> {
        reference.check("reference")?;
        current.check("current")?;
        reference.check_size("reference", camera)?;
        current.check_size("current", camera)?;

        let n = reference.keypoints.len();
        let log = config.output_dir.as_ref().map(DiagnosticLog::create);

        Ok(Self {
            config,
            camera,
            refiner: Arc::new(PyramidalPatchRefiner::new()),
            log,
            t_ref: reference.timestamp,
            t_cur: current.timestamp,
            reference: FloatImage::from_gray(reference.image),
            current: FloatImage::from_gray(current.image),
            keys_ref: reference.keypoints,
            keys_ref_un: reference.keypoints_un,
            keys_cur: current.keypoints,
            keys_cur_un: current.keypoints_un,
            gyro,
            bias,
            calib,
            rcl: Matrix3::identity(),
            predictions: vec![Point2::origin(); n],
            predictions_un: vec![Point2::origin(); n],
            flows_un: vec![Vector2::zeros(); n],
            status: vec![false; n],
            corners: vec![[Point2::origin(); 4]; n],
            corners_un: vec![[Point2::origin(); 4]; n],
            corner_flows: vec![[Vector2::zeros(); 4]; n],
            affine: vec![Matrix2::identity(); n],
            gyro_predictions: vec![Point2::origin(); n],
            gyro_predictions_un: vec![Point2::origin(); n],
            ncc: vec![0.0; n],
            residuals: vec![0.0; n],
            refine_distances: vec![0.0; n],
            neighbors: vec![Vec::new(); n],
            flow_errors_un: vec![Vector2::zeros(); n],
            matches: Vec::new(),
            disparities: Vec::new(),
            validation: None,
            metrics: TrackingMetrics {
                n_ref_keys: n,
                n_imu: gyro.len(),
                ..TrackingMetrics::default()
            },
            timing: TimingStats::zero(),
        })
    }

    /// Replace the photometric refiner.
    pub fn with_refiner(mut self, refiner: Arc<dyn PhotometricRefiner>) -> Self {
        self.refiner = refiner;
        self
    }

    pub fn num_features(&self) -> usize {
        self.keys_ref.len()
    }

    fn num_valid(&self) -> usize {
        self.status.iter().filter(|&&s| s).count()
    }

    // ------------------------------------------------------------------
    // Rotation
    // ------------------------------------------------------------------

    /// Integrate the gyro samples into Rcl and install it.
    pub fn integrate_gyro_measurements(&mut self) -> Matrix3<f64> {
        let t = Instant::now();
        let rcl = relative_camera_rotation(self.gyro, self.t_ref, self.t_cur, &self.bias, &self.calib);
        self.set_rcl(rcl);
        self.timing.integrate = t.elapsed().as_secs_f64();
        rcl
    }

    /// Install an externally computed relative rotation.
    pub fn set_rcl(&mut self, rcl: Matrix3<f64>) {
        self.rcl = rcl;
    }

    pub fn rcl(&self) -> &Matrix3<f64> {
        &self.rcl
    }

    // ------------------------------------------------------------------
    // Prediction and refinement
    // ------------------------------------------------------------------

    /// Predict every reference feature from Rcl. Returns the number inside
    /// the image.
    pub fn gyro_predict_features(&mut self) -> usize {
        let t = Instant::now();
        let predictor = PixelPredictor::new(self.camera, self.rcl, self.config.predict_method);
        let predictions = predict_features(&predictor, self.keys_ref_un, self.config.half_patch_size);

        for (i, prediction) in predictions.into_iter().enumerate() {
            let Some(p) = prediction else {
                self.status[i] = false;
                continue;
            };
            self.predictions[i] = p.center.distorted;
            self.predictions_un[i] = p.center.undistorted;
            self.flows_un[i] = p.center.flow;
            self.status[i] = true;
            self.corners[i] = p.corners;
            self.corners_un[i] = p.corners_un;
            self.corner_flows[i] = p.corner_offsets;
            self.affine[i] = p.affine;
        }

        self.gyro_predictions.clone_from(&self.predictions);
        self.gyro_predictions_un.clone_from(&self.predictions_un);
        self.timing.gyro_predict = t.elapsed().as_secs_f64();

        let n = self.num_valid();
        debug!(n, total = self.num_features(), "gyro predicted features");
        n
    }

    /// Start every feature at its own reference location.
    fn identity_predictions(&mut self) {
        self.predictions.copy_from_slice(self.keys_ref);
        self.predictions_un.copy_from_slice(self.keys_ref_un);
        self.gyro_predictions.copy_from_slice(self.keys_ref);
        self.gyro_predictions_un.copy_from_slice(self.keys_ref_un);
        self.status.fill(true);
        self.flows_un.fill(Vector2::zeros());
        self.affine.fill(Matrix2::identity());
    }

    fn run_refiner(&self, flags: RefinementFlags) -> Vec<RefinedFeature> {
        let request = RefinementRequest {
            reference: &self.reference,
            current: &self.current,
            camera: self.camera,
            ref_points: self.keys_ref,
            initial: &self.predictions,
            active: &self.status,
            affine: &self.affine,
            flags,
            half_patch_size: self.config.half_patch_size,
            iterations: self.config.iterations,
            pyramid_levels: self.config.pyramid_levels,
            regularization_weight: self.config.regularization_weight,
        };
        let refined = self.refiner.refine(&request);
        if refined.len() != self.num_features() {
            error!(
                expected = self.num_features(),
                got = refined.len(),
                "refiner returned a misaligned batch, dropping every feature"
            );
            return self.predictions.iter().map(|p| RefinedFeature::failed(*p)).collect();
        }
        refined
    }

    /// Gyro prediction (or identity start) followed by photometric refinement
    /// and the residual / distance filter. Returns the number kept.
    pub fn gyro_predict_and_refine(&mut self, flags: RefinementFlags) -> usize {
        if flags.use_initial_guess {
            self.gyro_predict_features();
        } else {
            self.identity_predictions();
        }

        let t = Instant::now();
        let refined = self.run_refiner(flags);
        self.timing.opt_flow = t.elapsed().as_secs_f64();

        let t = Instant::now();
        let filter = filter_refined(&refined, &self.predictions, self.config.half_patch_size);
        for (i, r) in refined.iter().enumerate() {
            self.ncc[i] = r.ncc;
            self.residuals[i] = r.residual;
            self.refine_distances[i] = filter.distances[i];
            if filter.accepted[i] {
                self.predictions[i] = r.point;
                self.predictions_un[i] = r.point_un;
                self.flows_un[i] = r.point_un - self.keys_ref_un[i];
                self.status[i] = true;
            } else {
                self.status[i] = false;
            }
        }
        self.timing.opt_flow_filter = t.elapsed().as_secs_f64();

        let n = filter.num_accepted();
        debug!(
            n,
            avg_residual = filter.avg_residual,
            pixel_threshold = filter.pixel_threshold,
            "refined predictions"
        );
        n
    }

    /// Plain pyramidal optical flow from the reference keypoints, no gyro.
    fn optical_flow_baseline(&mut self) -> usize {
        self.identity_predictions();

        let t = Instant::now();
        let refined = self.run_refiner(RefinementFlags::PLAIN);
        self.timing.opt_flow = t.elapsed().as_secs_f64();

        for (i, r) in refined.iter().enumerate() {
            self.predictions[i] = r.point;
            self.predictions_un[i] = r.point_un;
            self.flows_un[i] = r.point_un - self.keys_ref_un[i];
            self.ncc[i] = r.ncc;
            self.residuals[i] = r.residual;
            self.status[i] = r.success && r.residual < MAX_FLOW_RESIDUAL;
        }
        self.num_valid()
    }

    /// Integrate the gyro and carry every feature into the current frame as
    /// the configured mode prescribes. Returns the number of valid features.
    pub fn track_features(&mut self) -> usize {
        self.integrate_gyro_measurements();

        let mode = self.config.mode;
        match (mode, mode.refinement_flags()) {
            (TrackingMode::OpticalFlowBaseline, _) => self.optical_flow_baseline(),
            (_, Some(flags)) => self.gyro_predict_and_refine(flags),
            (_, None) => self.gyro_predict_features(),
        }
    }

    // ------------------------------------------------------------------
    // Association
    // ------------------------------------------------------------------

    /// Associate the valid predictions with current detections, widening the
    /// search once when too few matches are found.
    fn associate(&mut self) -> usize {
        let params = AssociationParams {
            rank_by: self.config.rank_by,
            ncc_high: self.config.ncc_high,
            ncc_low: self.config.ncc_low,
            ratio: self.config.ratio,
        };

        for level in 1..=2 {
            let t = Instant::now();
            let search = NeighborSearch {
                reference: &self.reference,
                current: &self.current,
                keys_ref: self.keys_ref,
                keys_cur: self.keys_cur,
                keys_cur_un: self.keys_cur_un,
                half_patch_size: self.config.half_patch_size,
                base_radius: self.config.base_search_radius(),
                rank_by: self.config.rank_by,
            };
            find_and_sort_near_neighbors(
                &search,
                &self.predictions_un,
                &self.status,
                &self.affine,
                level,
                &mut self.neighbors,
            );
            self.timing.find_neighbors += t.elapsed().as_secs_f64();

            let t = Instant::now();
            self.matches = match_features(&self.neighbors, &params);
            self.timing.match_features += t.elapsed().as_secs_f64();

            debug!(level, matches = self.matches.len(), "associated predictions");
            if self.matches.len() >= self.config.min_matches {
                break;
            }
        }

        self.flow_errors_un.fill(Vector2::zeros());
        for m in &self.matches {
            self.flow_errors_un[m.ref_idx] = self.keys_cur_un[m.cur_idx] - self.predictions_un[m.ref_idx];
        }
        self.metrics.n_matches = self.matches.len();
        self.matches.len()
    }

    /// Track, then match predictions with the current frame's detections.
    ///
    /// Fails for the plain optical-flow mode, which has no prediction to
    /// search around.
    pub fn search_by_gyro_predict(&mut self) -> Result<usize> {
        if self.config.mode == TrackingMode::OpticalFlowBaseline {
            let code = self.config.mode.code();
            error!(code, "search by gyro prediction does not support this tracking mode");
            return Err(TrackerError::UnsupportedMode(code));
        }
        self.track_features();
        Ok(self.associate())
    }

    /// Image-only baseline: optical flow from the reference keypoints, then
    /// radius matching against current detections and a disparity filter.
    pub fn search_by_klt(&mut self) -> usize {
        let t = Instant::now();
        self.identity_predictions();
        let refined = self.run_refiner(RefinementFlags::PLAIN);
        for (i, r) in refined.iter().enumerate() {
            self.predictions[i] = r.point;
            self.predictions_un[i] = r.point_un;
            self.ncc[i] = r.ncc;
            self.residuals[i] = r.residual;
            self.status[i] = r.success && r.residual < MAX_FLOW_RESIDUAL;
        }
        self.timing.opt_flow = t.elapsed().as_secs_f64();

        let t = Instant::now();
        let keys_cur = self.keys_cur;
        let candidates: Vec<Option<(usize, f64)>> = (0..self.num_features())
            .into_par_iter()
            .map(|i| {
                if !self.status[i] {
                    return None;
                }
                let p = self.predictions[i];
                let mut near: Vec<(usize, f64)> = keys_cur
                    .iter()
                    .enumerate()
                    .map(|(j, k)| (j, (k - p).norm()))
                    .filter(|&(_, d)| d <= KLT_SEARCH_RADIUS)
                    .collect();
                near.sort_by(|a, b| a.1.total_cmp(&b.1));
                match near.as_slice() {
                    [] => None,
                    [only] => Some(*only),
                    [first, second, ..] => (first.1 / second.1 < KLT_RATIO).then_some(*first),
                }
            })
            .collect();
        self.timing.find_neighbors = t.elapsed().as_secs_f64();

        let t = Instant::now();
        let mut claimed = HashSet::new();
        let mut matches = Vec::new();
        let mut disparities = Vec::new();
        for (i, c) in candidates.into_iter().enumerate() {
            let Some((j, distance)) = c else { continue };
            if !claimed.insert(j) {
                continue;
            }
            matches.push(Match {
                ref_idx: i,
                cur_idx: j,
                distance: distance as f32,
                ncc: self.ncc[i],
                level: 0,
            });
            disparities.push((self.keys_ref[i] - keys_cur[j]).norm());
        }

        if !disparities.is_empty() {
            let mean = disparities.iter().sum::<f64>() / disparities.len() as f64;
            let th = mean * KLT_DISPARITY_FACTOR;
            let (kept, kept_disp): (Vec<Match>, Vec<f64>) = matches
                .into_iter()
                .zip(disparities)
                .filter(|&(_, d)| d <= th)
                .unzip();
            matches = kept;
            disparities = kept_disp;
        }
        self.timing.match_features = t.elapsed().as_secs_f64();

        debug!(matches = matches.len(), "klt search");
        self.matches = matches;
        self.disparities = disparities;
        self.metrics.n_matches = self.matches.len();
        self.matches.len()
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Invalidate geometric outliers among the valid predictions and record
    /// the call's metrics. Returns the number of valid features left.
    pub fn geometry_validation(&mut self) -> usize {
        let t = Instant::now();
        let validator = GeometricValidator {
            sigma: self.config.sigma,
            homography: self.config.homography,
            fundamental: self.config.fundamental,
            width: self.camera.width,
            height: self.camera.height,
        };
        let report = validator.validate(self.keys_ref_un, &self.predictions_un, &mut self.status);

        let status = &self.status;
        self.matches.retain(|m| status[m.ref_idx]);
        self.timing.geometry_validation = t.elapsed().as_secs_f64();

        self.metrics.n_predicted = report.num_candidates;
        self.metrics.n_inliers = report.num_inliers;
        self.metrics.track_score = report.track_score;
        self.metrics.n_matches = self.matches.len();

        info!(
            t = self.t_cur,
            features = self.metrics.n_ref_keys,
            predicted = self.metrics.n_predicted,
            valid = self.metrics.n_inliers,
            track_rate = self.metrics.track_rate(),
            "tracked features"
        );
        if let Some(log) = &self.log {
            log.log_frame(self.t_cur, &self.metrics, &self.timing);
        }

        self.validation = Some(report);
        self.metrics.n_inliers
    }

    /// Full pipeline: track, associate when the mode predicts, validate.
    pub fn run(&mut self) -> usize {
        self.track_features();
        if self.config.mode != TrackingMode::OpticalFlowBaseline {
            self.associate();
        }
        self.geometry_validation()
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    /// Per-feature results for the frame that owns the current image.
    pub fn output(&self) -> TrackingOutput {
        TrackingOutput {
            gyro_predictions_un: self.gyro_predictions_un.clone(),
            predictions: self.predictions.clone(),
            predictions_un: self.predictions_un.clone(),
            status: self.status.clone(),
            ncc: self.ncc.clone(),
            corner_flows: self.corner_flows.clone(),
            rcl: self.rcl,
        }
    }

    pub fn predictions(&self) -> &[Point2<f64>] {
        &self.predictions
    }

    pub fn predictions_un(&self) -> &[Point2<f64>] {
        &self.predictions_un
    }

    pub fn gyro_predictions(&self) -> &[Point2<f64>] {
        &self.gyro_predictions
    }

    pub fn flows_un(&self) -> &[Vector2<f64>] {
        &self.flows_un
    }

    pub fn status(&self) -> &[bool] {
        &self.status
    }

    pub fn corners(&self) -> &[[Point2<f64>; 4]] {
        &self.corners
    }

    pub fn corners_un(&self) -> &[[Point2<f64>; 4]] {
        &self.corners_un
    }

    pub fn affine_matrices(&self) -> &[Matrix2<f64>] {
        &self.affine
    }

    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    pub fn refine_distances(&self) -> &[f64] {
        &self.refine_distances
    }

    pub fn neighbors(&self) -> &[Vec<Match>] {
        &self.neighbors
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    /// Detection minus prediction for matched features, zero elsewhere.
    pub fn flow_errors_un(&self) -> &[Vector2<f64>] {
        &self.flow_errors_un
    }

    pub fn disparities(&self) -> &[f64] {
        &self.disparities
    }

    pub fn validation_report(&self) -> Option<&ValidationReport> {
        self.validation.as_ref()
    }

    pub fn metrics(&self) -> &TrackingMetrics {
        &self.metrics
    }

    pub fn timing(&self) -> &TimingStats {
        &self.timing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::so3::exp_so3;
    use crate::tracking::mode::PredictMethod;
    use approx::assert_relative_eq;
    use image::Luma;
    use nalgebra::Vector3;

    fn camera() -> CameraModel {
        CameraModel::new(200.0, 200.0, 160.0, 120.0, 320, 240)
    }

    fn texture(x: f64, y: f64) -> u8 {
        (128.0 + 60.0 * (x * 0.19).sin() * (y * 0.23).cos() + 40.0 * (x * 0.07 - y * 0.05).sin())
            .clamp(0.0, 255.0) as u8
    }

    fn gray(shift: Vector2<f64>) -> GrayImage {
        GrayImage::from_fn(320, 240, |x, y| {
            Luma([texture(x as f64 - shift.x, y as f64 - shift.y)])
        })
    }

    fn keypoints(n: usize) -> Vec<Point2<f64>> {
        (0..n)
            .map(|i| Point2::new(30.0 + 26.0 * (i % 10) as f64, 30.0 + 30.0 * (i / 10) as f64))
            .collect()
    }

    fn still_gyro() -> Vec<GyroSample> {
        (0..11)
            .map(|k| GyroSample::new(k as f64 * 0.005, Vector3::zeros()))
            .collect()
    }

    fn config(mode: TrackingMode) -> TrackerConfig {
        TrackerConfig {
            mode,
            min_matches: 5,
            ..TrackerConfig::default()
        }
    }

    struct Scene {
        img_ref: GrayImage,
        img_cur: GrayImage,
        keys_ref: Vec<Point2<f64>>,
        keys_cur: Vec<Point2<f64>>,
        gyro: Vec<GyroSample>,
        camera: CameraModel,
    }

    impl Scene {
        fn still(n: usize) -> Self {
            let keys = keypoints(n);
            Self {
                img_ref: gray(Vector2::zeros()),
                img_cur: gray(Vector2::zeros()),
                keys_ref: keys.clone(),
                keys_cur: keys,
                gyro: still_gyro(),
                camera: camera(),
            }
        }

        fn tracker<'a>(&'a self, config: &'a TrackerConfig) -> GyroAidedTracker<'a> {
            GyroAidedTracker::new(
                FrameData {
                    timestamp: 0.0,
                    image: &self.img_ref,
                    keypoints: &self.keys_ref,
                    keypoints_un: &self.keys_ref,
                },
                FrameData {
                    timestamp: 0.05,
                    image: &self.img_cur,
                    keypoints: &self.keys_cur,
                    keypoints_un: &self.keys_cur,
                },
                &self.gyro,
                GyroBias::zero(),
                ImuCalib::identity(),
                &self.camera,
                config,
            )
            .unwrap()
        }
    }

    #[test]
    fn test_still_gyro_predicts_reference() {
        let scene = Scene::still(10);
        let cfg = config(TrackingMode::GyroPredict);
        let mut tracker = scene.tracker(&cfg);

        assert_eq!(tracker.track_features(), 10);
        assert_relative_eq!(*tracker.rcl(), Matrix3::identity(), epsilon = 1e-12);
        for i in 0..10 {
            assert_relative_eq!(tracker.predictions_un()[i], scene.keys_ref[i], epsilon = 1e-9);
            assert_relative_eq!(tracker.flows_un()[i], Vector2::zeros(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_set_rcl_overrides_integration() {
        let scene = Scene::still(10);
        let cfg = config(TrackingMode::GyroPredict);
        let mut tracker = scene.tracker(&cfg);

        // Yaw large enough to push the right half out of the image.
        let rcl = exp_so3(&Vector3::new(0.0, 0.35, 0.0));
        tracker.set_rcl(rcl);
        let n = tracker.gyro_predict_features();

        assert!(n < 10);
        let predictor = PixelPredictor::new(&scene.camera, rcl, PredictMethod::PixelAware);
        for i in 0..10 {
            let p = predictor.predict_pixel(&scene.keys_ref[i]);
            assert_eq!(tracker.status()[i], predictor.in_bounds(&p));
        }
    }

    #[test]
    fn test_run_on_still_pair_keeps_everything() {
        let scene = Scene::still(60);
        let cfg = config(TrackingMode::GyroRefinedIlluminationDeformation);
        let mut tracker = scene.tracker(&cfg);

        let n = tracker.run();
        assert_eq!(n, 60);
        assert_eq!(tracker.matches().len(), 60);
        for m in tracker.matches() {
            assert_eq!(m.ref_idx, m.cur_idx);
        }
        let report = tracker.validation_report().unwrap();
        assert!(!report.skipped);
        assert_eq!(tracker.metrics().n_predicted, 60);
    }

    #[test]
    fn test_matches_are_unique_and_valid() {
        let mut scene = Scene::still(40);
        // Two current detections stacked on top of each other.
        scene.keys_cur[5] = scene.keys_cur[6];
        let cfg = TrackerConfig {
            rank_by: crate::tracking::mode::RankBy::Distance,
            ..config(TrackingMode::GyroPredict)
        };
        let mut tracker = scene.tracker(&cfg);
        tracker.run();

        let mut seen = HashSet::new();
        for m in tracker.matches() {
            assert!(seen.insert(m.cur_idx));
            assert!(tracker.status()[m.ref_idx]);
        }
    }

    #[test]
    fn test_search_by_gyro_predict_rejects_baseline_mode() {
        let scene = Scene::still(10);
        let cfg = config(TrackingMode::OpticalFlowBaseline);
        let mut tracker = scene.tracker(&cfg);

        let err = tracker.search_by_gyro_predict().unwrap_err();
        assert!(matches!(err, TrackerError::UnsupportedMode(0)));
    }

    #[test]
    fn test_baseline_mode_tracks_shift() {
        let mut scene = Scene::still(20);
        let d = Vector2::new(2.0, 1.0);
        scene.img_cur = gray(d);
        let cfg = config(TrackingMode::OpticalFlowBaseline);
        let mut tracker = scene.tracker(&cfg);

        let n = tracker.track_features();
        assert!(n >= 18);
        for i in 0..20 {
            if tracker.status()[i] {
                assert_relative_eq!(tracker.flows_un()[i], d, epsilon = 0.2);
            }
        }
    }

    #[test]
    fn test_klt_search_matches_shifted_detections() {
        let mut scene = Scene::still(30);
        let d = Vector2::new(1.5, -1.0);
        scene.img_cur = gray(d);
        scene.keys_cur = scene.keys_ref.iter().map(|p| p + d).collect();
        let cfg = config(TrackingMode::GyroPredict);
        let mut tracker = scene.tracker(&cfg);

        let n = tracker.search_by_klt();
        assert!(n >= 25);
        for (m, disp) in tracker.matches().iter().zip(tracker.disparities()) {
            assert_eq!(m.ref_idx, m.cur_idx);
            assert_relative_eq!(*disp, d.norm(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_mismatched_keypoints_rejected() {
        let scene = Scene::still(10);
        let cfg = config(TrackingMode::GyroPredict);
        let short = &scene.keys_ref[..9];
        let result = GyroAidedTracker::new(
            FrameData {
                timestamp: 0.0,
                image: &scene.img_ref,
                keypoints: &scene.keys_ref,
                keypoints_un: short,
            },
            FrameData {
                timestamp: 0.05,
                image: &scene.img_cur,
                keypoints: &scene.keys_cur,
                keypoints_un: &scene.keys_cur,
            },
            &scene.gyro,
            GyroBias::zero(),
            ImuCalib::identity(),
            &scene.camera,
            &cfg,
        );
        assert!(matches!(
            result,
            Err(TrackerError::LengthMismatch { expected: 10, got: 9, .. })
        ));
    }

    #[test]
    fn test_empty_image_rejected() {
        let scene = Scene::still(10);
        let empty = GrayImage::new(0, 0);
        let cfg = config(TrackingMode::GyroPredict);
        let result = GyroAidedTracker::new(
            FrameData {
                timestamp: 0.0,
                image: &scene.img_ref,
                keypoints: &scene.keys_ref,
                keypoints_un: &scene.keys_ref,
            },
            FrameData {
                timestamp: 0.05,
                image: &empty,
                keypoints: &scene.keys_cur,
                keypoints_un: &scene.keys_cur,
            },
            &scene.gyro,
            GyroBias::zero(),
            ImuCalib::identity(),
            &scene.camera,
            &cfg,
        );
        assert!(matches!(result, Err(TrackerError::EmptyImage { which: "current" })));
    }

    struct FailingRefiner;

    impl PhotometricRefiner for FailingRefiner {
        fn refine(&self, request: &RefinementRequest<'_>) -> Vec<RefinedFeature> {
            request.initial.iter().map(|p| RefinedFeature::failed(*p)).collect()
        }
    }

    #[test]
    fn test_failed_refinement_does_not_fall_back_to_gyro() {
        let scene = Scene::still(10);
        let cfg = config(TrackingMode::GyroRefined);
        let mut tracker = scene.tracker(&cfg).with_refiner(Arc::new(FailingRefiner));

        assert_eq!(tracker.track_features(), 0);
        assert!(tracker.status().iter().all(|&s| !s));
        // The gyro-only snapshot survives.
        assert_relative_eq!(tracker.output().gyro_predictions_un[3], scene.keys_ref[3], epsilon = 1e-9);
    }

    /// Returns only the first two features.
    struct TruncatingRefiner;

    impl PhotometricRefiner for TruncatingRefiner {
        fn refine(&self, request: &RefinementRequest<'_>) -> Vec<RefinedFeature> {
            PyramidalPatchRefiner::new()
                .refine(request)
                .into_iter()
                .take(2)
                .collect()
        }
    }

    #[test]
    fn test_short_refiner_output_invalidates_all() {
        let scene = Scene::still(10);
        for mode in [TrackingMode::GyroRefined, TrackingMode::OpticalFlowBaseline] {
            let cfg = config(mode);
            let mut tracker = scene.tracker(&cfg).with_refiner(Arc::new(TruncatingRefiner));

            let n = tracker.track_features();
            let valid = tracker.status().iter().filter(|&&s| s).count();
            assert_eq!(n, valid);
            assert_eq!(n, 0);
            assert_eq!(tracker.status().len(), 10);
        }

        let cfg = config(TrackingMode::GyroPredict);
        let mut tracker = scene.tracker(&cfg).with_refiner(Arc::new(TruncatingRefiner));
        assert_eq!(tracker.search_by_klt(), 0);
        assert!(tracker.status().iter().all(|&s| !s));
    }

    #[test]
    fn test_image_size_must_match_camera() {
        let scene = Scene::still(10);
        let small = GrayImage::from_pixel(160, 120, Luma([100]));
        let cfg = config(TrackingMode::GyroPredict);
        let result = GyroAidedTracker::new(
            FrameData {
                timestamp: 0.0,
                image: &small,
                keypoints: &scene.keys_ref,
                keypoints_un: &scene.keys_ref,
            },
            FrameData {
                timestamp: 0.05,
                image: &scene.img_cur,
                keypoints: &scene.keys_cur,
                keypoints_un: &scene.keys_cur,
            },
            &scene.gyro,
            GyroBias::zero(),
            ImuCalib::identity(),
            &scene.camera,
            &cfg,
        );
        assert!(matches!(
            result,
            Err(TrackerError::ImageSize {
                which: "reference",
                width: 320,
                height: 240,
                got_width: 160,
                got_height: 120,
            })
        ));
    }
}
