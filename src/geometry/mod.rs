//! Geometry utilities: SO(3) exponential map and two-view model fitting.

pub mod fundamental;
pub mod homography;
pub mod ransac;
pub mod so3;

pub use fundamental::{epipolar_distance_sq, estimate_fundamental_8pt, find_fundamental_ransac};
pub use homography::{estimate_homography_dlt, find_homography_ransac, transfer};
pub use ransac::{RansacConfig, RansacFit};
pub use so3::{exp_so3, skew};
