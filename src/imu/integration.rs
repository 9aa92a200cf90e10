//! Gyroscope integration between two camera frames.
//!
//! The angular velocity over each sample sub-interval is averaged with the
//! trapezoidal rule. The first and last sub-intervals are corrected for the
//! gap between the sample timestamps and the frame timestamps by linear
//! interpolation, then every bias-corrected increment is pushed through the
//! SO(3) exponential map and right-multiplied in sample order.

use nalgebra::{Matrix3, Vector3};
use tracing::warn;

use super::sample::{GyroBias, GyroSample, ImuCalib};
use crate::geometry::so3::exp_so3;

/// Integrate gyroscope samples into the body rotation from `t_ref` to `t_cur`.
///
/// Samples are expected to lie within `[t_ref, t_cur]`. Samples outside that
/// interval are not rejected: the interpolation weights simply extrapolate,
/// and a warning is emitted.
pub fn integrate_gyro(
    samples: &[GyroSample],
    t_ref: f64,
    t_cur: f64,
    bias: &GyroBias,
) -> Matrix3<f64> {
    let mut delta_r = Matrix3::identity();
    if samples.len() < 2 {
        warn!(
            n = samples.len(),
            "fewer than two gyro samples between frames, assuming no rotation"
        );
        return delta_r;
    }

    let first = samples[0].timestamp_s;
    let last = samples[samples.len() - 1].timestamp_s;
    if first < t_ref || last > t_cur {
        warn!(
            t_ref,
            t_cur, first, last, "gyro samples do not bracket the frame interval, extrapolating"
        );
    }

    let n = samples.len() - 1;
    for i in 0..n {
        let a = &samples[i];
        let b = &samples[i + 1];
        let (omega, dt) = sub_interval(a, b, i, n, t_ref, t_cur);

        delta_r *= exp_so3(&((omega - bias.0) * dt));
    }

    delta_r
}

/// Average angular velocity and duration of sub-interval `i` out of `n`.
fn sub_interval(
    a: &GyroSample,
    b: &GyroSample,
    i: usize,
    n: usize,
    t_ref: f64,
    t_cur: f64,
) -> (Vector3<f64>, f64) {
    let tab = b.timestamp_s - a.timestamp_s;
    let is_first = i == 0;
    let is_last = i + 1 == n;

    match (is_first, is_last) {
        // A single interval spans the whole frame gap.
        (true, true) => (a.gyro, t_cur - t_ref),
        (true, false) => {
            let tini = a.timestamp_s - t_ref;
            let omega = (a.gyro + b.gyro - (b.gyro - a.gyro) * (tini / tab)) * 0.5;
            (omega, b.timestamp_s - t_ref)
        }
        (false, true) => {
            let tend = b.timestamp_s - t_cur;
            let omega = (a.gyro + b.gyro - (b.gyro - a.gyro) * (tend / tab)) * 0.5;
            (omega, t_cur - a.timestamp_s)
        }
        (false, false) => ((a.gyro + b.gyro) * 0.5, tab),
    }
}

/// Rotation mapping reference-camera rays to current-camera rays (Rcl).
///
/// The body rotation is conjugated by the extrinsic rotation:
/// `Rcl = R_bcᵀ · ΔRᵀ · R_bc`.
pub fn relative_camera_rotation(
    samples: &[GyroSample],
    t_ref: f64,
    t_cur: f64,
    bias: &GyroBias,
    calib: &ImuCalib,
) -> Matrix3<f64> {
    let delta_r = integrate_gyro(samples, t_ref, t_cur, bias);
    calib.r_bc.transpose() * delta_r.transpose() * calib.r_bc
}
