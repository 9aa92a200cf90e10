//! Best-effort diagnostic logs.
//!
//! Two append-only text streams in the output directory, one line per call:
//! counts and rates in `trackFeatures.txt`, stage timings in `timeCost.txt`.
//! Write failures are reported through `tracing` and never reach the caller.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::error;

use crate::tracking::result::{TimingStats, TrackingMetrics};

pub const TRACK_FEATURES_FILE_NAME: &str = "trackFeatures.txt";
pub const TIME_COST_FILE_NAME: &str = "timeCost.txt";

#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    dir: PathBuf,
}

impl DiagnosticLog {
    /// Create the output directory if needed.
    pub fn create<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        if let Err(e) = fs::create_dir_all(&dir) {
            error!(dir = %dir.display(), "cannot create diagnostic directory: {e}");
        }
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one line to `file_name`.
    pub fn append(&self, file_name: &str, line: &str) {
        let path = self.dir.join(file_name);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            error!(path = %path.display(), "cannot write diagnostic log: {e}");
        }
    }

    pub fn log_frame(&self, timestamp: f64, metrics: &TrackingMetrics, timing: &TimingStats) {
        self.append(TRACK_FEATURES_FILE_NAME, &format_track_line(timestamp, metrics));
        self.append(TIME_COST_FILE_NAME, &format_time_line(timestamp, timing));
    }
}

pub fn format_track_line(timestamp: f64, m: &TrackingMetrics) -> String {
    format!(
        "T: {:.6}, RefKey Num: {}, patchMatchPredict Num: {}, Geo. valid: {}, \
         Pred. suc. rate: {:.6}%, feature track rate: {:.6}%, IMU num: {}, \
         track_score: {:.6}, recall rate: {:.6}%",
        timestamp,
        m.n_ref_keys,
        m.n_predicted,
        m.n_inliers,
        m.prediction_success_rate(),
        m.track_rate(),
        m.n_imu,
        m.track_score,
        m.recall_rate(),
    )
}

pub fn format_time_line(timestamp: f64, t: &TimingStats) -> String {
    format!(
        "T: {:.6}, Total FeatureTrack: {:.6}, GyroPredict: {:.6}, OptFlow: {:.6}, \
         OptFlowResultFilterOut: {:.6}, GeometryValidation: {:.6}",
        timestamp,
        t.feature_track_total(),
        t.gyro_predict,
        t.opt_flow,
        t.opt_flow_filter,
        t.geometry_validation,
    )
}
