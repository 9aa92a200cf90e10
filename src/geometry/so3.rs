//! SO(3) utilities for gyroscope integration.
//!
//! Provides skew-symmetric matrix construction and the closed-form
//! exponential map used to turn an integrated angular increment into a
//! rotation matrix.

use nalgebra::{Matrix3, Vector3};

/// Below this rotation magnitude (rad) the exponential map is linearized.
pub const SMALL_ANGLE_THRESHOLD: f64 = 1e-4;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Exponential map of so(3): rotation matrix for the rotation vector θ.
///
/// ```text
/// exp([θ]×) = I + sin(d)/d [θ]× + (1 - cos d)/d² [θ]×²,   d = |θ|
/// ```
///
/// For d < 1e-4 the first-order form `I + [θ]×` is returned.
pub fn exp_so3(theta: &Vector3<f64>) -> Matrix3<f64> {
    let d2 = theta.norm_squared();
    let d = d2.sqrt();
    let w = skew(theta);

    if d < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + w;
    }

    Matrix3::identity() + w * (d.sin() / d) + w * w * ((1.0 - d.cos()) / d2)
}

/// True if `r` is orthonormal with determinant +1 within `tol`.
pub fn is_rotation(r: &Matrix3<f64>, tol: f64) -> bool {
    let should_be_identity = r.transpose() * r;
    (should_be_identity - Matrix3::identity()).amax() < tol && (r.determinant() - 1.0).abs() < tol
}
