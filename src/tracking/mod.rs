//! Feature tracking between a reference and a current frame.
//!
//! This module implements the correspondence core:
//! - Gyro-only pixel prediction with patch-corner affine estimation
//! - Photometric refinement of the predictions (pluggable refiner)
//! - Near-neighbor association with current-frame detections
//! - Two-model geometric validation
//! - Diagnostic logs of counts and stage timings

pub mod affine;
pub mod config;
pub mod klt;
pub mod mode;
pub mod neighbors;
pub mod predictor;
pub mod refine;
pub mod result;
pub mod stats;
pub mod tracker;
pub mod validation;

pub use config::TrackerConfig;
pub use klt::PyramidalPatchRefiner;
pub use mode::{PredictMethod, RankBy, RefinementFlags, TrackingMode};
pub use neighbors::Match;
pub use refine::{PhotometricRefiner, RefinedFeature, RefinementRequest};
pub use result::{TimingStats, TrackingMetrics, TrackingOutput};
pub use tracker::{FrameData, GyroAidedTracker};
pub use validation::{GeometricValidator, SelectedModel, ValidationReport};
