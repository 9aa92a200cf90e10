pub mod integration;
pub mod sample;

pub use integration::{integrate_gyro, relative_camera_rotation};
pub use sample::{GyroBias, GyroSample, ImuCalib};
