pub mod camera;
pub mod error;
pub mod geometry;
pub mod image;
pub mod imu;
pub mod io;
pub mod tracking;

pub use error::{Result, TrackerError};
