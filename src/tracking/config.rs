//! Tracker configuration.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::geometry::RansacConfig;
use crate::tracking::mode::{PredictMethod, RankBy, TrackingMode};

/// All tunables of one tracking session. Read-only once a tracker is built.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub mode: TrackingMode,
    pub predict_method: PredictMethod,

    /// Half size of the square patch; the patch is (2h+1)².
    pub half_patch_size: usize,

    /// Candidate ranking for association.
    pub rank_by: RankBy,
    /// Top candidate accepted outright above this NCC.
    pub ncc_high: f32,
    /// With several candidates, reject when the top NCC is below this.
    pub ncc_low: f32,
    /// Second/first separation ratio (NCC) or first/second (distance).
    pub ratio: f32,
    /// Below this many matches the search region is doubled once.
    pub min_matches: usize,

    /// Gauss-Newton iterations per pyramid level.
    pub iterations: usize,
    pub pyramid_levels: usize,
    /// Weight of the pull toward the initial guess when regularizing.
    pub regularization_weight: f64,

    /// Observation noise used to turn squared errors into chi-square values.
    pub sigma: f64,
    pub homography: RansacConfig,
    pub fundamental: RansacConfig,

    /// Directory for `trackFeatures.txt` / `timeCost.txt`. No logs if unset.
    pub output_dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            mode: TrackingMode::default(),
            predict_method: PredictMethod::default(),
            half_patch_size: 5,
            rank_by: RankBy::Ncc,
            ncc_high: 0.6,
            ncc_low: 0.3,
            ratio: 0.75,
            min_matches: 100,
            iterations: 10,
            pyramid_levels: 3,
            regularization_weight: 100.0,
            sigma: 1.0,
            homography: RansacConfig::default(),
            fundamental: RansacConfig {
                confidence: 0.99,
                ..RansacConfig::default()
            },
            output_dir: None,
        }
    }
}

impl TrackerConfig {
    /// Load overrides from a YAML file; missing keys keep their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read tracker config {:?}", path))?;
        let config = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse tracker config {:?}", path))?;
        Ok(config)
    }

    /// Radius of the first neighbor search box, scaled by the search level.
    pub fn base_search_radius(&self) -> f64 {
        2.0 * self.half_patch_size as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = TrackerConfig::default();
        assert_eq!(c.half_patch_size, 5);
        assert_eq!(c.base_search_radius(), 10.0);
        assert_eq!(c.mode, TrackingMode::GyroRefinedIlluminationDeformation);
        assert_eq!(c.fundamental.confidence, 0.99);
        assert_eq!(c.homography.threshold, 3.0);
        assert!(c.output_dir.is_none());
    }

    #[test]
    fn test_partial_yaml_override() {
        let yaml = "mode: 1\nrank_by: distance\nhalf_patch_size: 4\nfundamental:\n  seed: 9\n";
        let c: TrackerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.mode, TrackingMode::GyroPredict);
        assert_eq!(c.rank_by, RankBy::Distance);
        assert_eq!(c.half_patch_size, 4);
        assert_eq!(c.fundamental.seed, 9);
        // Nested structs fall back to their own defaults, not the tracker's.
        assert_eq!(c.fundamental.threshold, 3.0);
        assert_eq!(c.ncc_high, 0.6);
    }

    #[test]
    fn test_bad_mode_rejected() {
        assert!(serde_yaml::from_str::<TrackerConfig>("mode: 12").is_err());
    }
}
