use nalgebra::{Matrix3, Vector3};

/// Single gyroscope measurement.
#[derive(Debug, Clone, Copy)]
pub struct GyroSample {
    pub timestamp_s: f64,
    /// Angular velocity in the body (IMU) frame, rad/s.
    pub gyro: Vector3<f64>,
}

impl GyroSample {
    pub fn new(timestamp_s: f64, gyro: Vector3<f64>) -> Self {
        Self { timestamp_s, gyro }
    }
}

/// Gyroscope bias.
#[derive(Debug, Clone, Copy)]
pub struct GyroBias(pub Vector3<f64>);

impl GyroBias {
    pub fn zero() -> Self {
        Self(Vector3::zeros())
    }
}

impl Default for GyroBias {
    fn default() -> Self {
        Self::zero()
    }
}

/// IMU-to-camera extrinsic calibration.
#[derive(Debug, Clone, Copy)]
pub struct ImuCalib {
    /// Rotation of the camera frame expressed in the body frame (R_bc).
    pub r_bc: Matrix3<f64>,
}

impl ImuCalib {
    pub fn new(r_bc: Matrix3<f64>) -> Self {
        Self { r_bc }
    }

    pub fn identity() -> Self {
        Self {
            r_bc: Matrix3::identity(),
        }
    }
}

impl Default for ImuCalib {
    fn default() -> Self {
        Self::identity()
    }
}
