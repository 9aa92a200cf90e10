//! Tracking modes and the refinement flags each one implies.

use serde::Deserialize;
use tracing::error;

use crate::error::TrackerError;

/// How features are carried from the reference to the current frame.
///
/// The numeric codes are the ones used in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "i32")]
pub enum TrackingMode {
    /// Plain pyramidal optical flow from the reference keypoints, no gyro.
    OpticalFlowBaseline,
    /// Gyro prediction only.
    GyroPredict,
    /// Gyro prediction refined by translation-only optical flow.
    GyroRefined,
    /// As `GyroRefined`, also modeling gain and bias changes.
    GyroRefinedIllumination,
    /// As `GyroRefinedIllumination`, with the patch pre-warped by the
    /// predicted affine deformation.
    #[default]
    GyroRefinedIlluminationDeformation,
    /// Image-only optical flow with illumination and affine terms.
    ImageOnlyRefined,
    /// As `GyroRefinedIlluminationDeformation`, regularized toward the gyro
    /// prediction.
    GyroRefinedRegularized,
}

/// Feature switches passed to the photometric refiner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementFlags {
    pub use_initial_guess: bool,
    pub consider_illumination: bool,
    pub consider_affine: bool,
    pub regularization: bool,
}

impl RefinementFlags {
    const fn new(
        use_initial_guess: bool,
        consider_illumination: bool,
        consider_affine: bool,
        regularization: bool,
    ) -> Self {
        Self {
            use_initial_guess,
            consider_illumination,
            consider_affine,
            regularization,
        }
    }

    /// Plain optical flow: no initial guess, translation only.
    pub const PLAIN: Self = Self::new(false, false, false, false);
}

impl TrackingMode {
    pub const ALL: [TrackingMode; 7] = [
        TrackingMode::OpticalFlowBaseline,
        TrackingMode::GyroPredict,
        TrackingMode::GyroRefined,
        TrackingMode::GyroRefinedIllumination,
        TrackingMode::GyroRefinedIlluminationDeformation,
        TrackingMode::ImageOnlyRefined,
        TrackingMode::GyroRefinedRegularized,
    ];

    pub fn code(self) -> i32 {
        match self {
            TrackingMode::OpticalFlowBaseline => 0,
            TrackingMode::GyroPredict => 1,
            TrackingMode::GyroRefined => 2,
            TrackingMode::GyroRefinedIllumination => 3,
            TrackingMode::GyroRefinedIlluminationDeformation => 4,
            TrackingMode::ImageOnlyRefined => 5,
            TrackingMode::GyroRefinedRegularized => 6,
        }
    }

    /// Flags for the gyro-plus-refinement modes, `None` for the two modes
    /// that do not run the gyro-then-refine path.
    pub fn refinement_flags(self) -> Option<RefinementFlags> {
        match self {
            TrackingMode::OpticalFlowBaseline | TrackingMode::GyroPredict => None,
            TrackingMode::GyroRefined => Some(RefinementFlags::new(true, false, false, false)),
            TrackingMode::GyroRefinedIllumination => {
                Some(RefinementFlags::new(true, true, false, false))
            }
            TrackingMode::GyroRefinedIlluminationDeformation => {
                Some(RefinementFlags::new(true, true, true, false))
            }
            TrackingMode::ImageOnlyRefined => Some(RefinementFlags::new(false, true, true, false)),
            TrackingMode::GyroRefinedRegularized => {
                Some(RefinementFlags::new(true, true, true, true))
            }
        }
    }
}

impl TryFrom<i32> for TrackingMode {
    type Error = TrackerError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        TrackingMode::ALL
            .into_iter()
            .find(|m| m.code() == code)
            .ok_or_else(|| {
                error!(code, "unsupported tracking mode");
                TrackerError::UnsupportedMode(code)
            })
    }
}

/// Rotation-only projection model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictMethod {
    /// Keeps the depth-independent scale term of each pixel.
    #[default]
    PixelAware,
    /// Infinite homography `K·R·K⁻¹` with unit scale.
    SingleHomography,
}

/// Ranking of near-neighbor candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankBy {
    /// Descending NCC.
    #[default]
    Ncc,
    /// Ascending distance to the prediction.
    Distance,
}
