//! Local affine deformation of a patch from its predicted corners.

use nalgebra::{Matrix2, Matrix2x4, Vector2};

/// Corner offsets of a square patch: top-left, top-right, bottom-left,
/// bottom-right.
pub fn patch_corners(half_patch_size: usize) -> [Vector2<f64>; 4] {
    let h = half_patch_size as f64;
    [
        Vector2::new(-h, -h),
        Vector2::new(h, -h),
        Vector2::new(-h, h),
        Vector2::new(h, h),
    ]
}

/// Least-squares 2×2 warp `A` with `A·template[j] ≈ offsets[j]`:
/// `A = C·Bᵀ·(B·Bᵀ)⁻¹`.
///
/// Returns the identity when the template is degenerate.
pub fn estimate_affine(offsets: &[Vector2<f64>; 4], template: &[Vector2<f64>; 4]) -> Matrix2<f64> {
    let c = Matrix2x4::from_columns(offsets);
    let b = Matrix2x4::from_columns(template);
    let bt = b.transpose();
    match (b * bt).try_inverse() {
        Some(inv) => c * bt * inv,
        None => Matrix2::identity(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pure_translation_is_identity() {
        let b = patch_corners(5);
        // Offsets relative to the predicted center equal the template.
        let a = estimate_affine(&b, &b);
        assert_relative_eq!(a, Matrix2::identity(), epsilon = 1e-12);
    }

    #[test]
    fn test_recovers_exact_affine() {
        let b = patch_corners(5);
        let truth = Matrix2::new(1.1, 0.05, -0.02, 0.93);
        let c = b.map(|v| truth * v);
        assert_relative_eq!(estimate_affine(&c, &b), truth, epsilon = 1e-12);
    }

    #[test]
    fn test_least_squares_average() {
        // Non-affine corner motion: only one corner moves.
        let b = patch_corners(1);
        let mut c = b;
        c[3] += Vector2::new(0.4, 0.0);
        let a = estimate_affine(&c, &b);
        // x-row gets the mean of the induced gradients: 0.4·(1,1)/4.
        assert_relative_eq!(a, Matrix2::new(1.1, 0.1, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_template() {
        let b = patch_corners(0);
        assert_eq!(estimate_affine(&b, &b), Matrix2::identity());
    }
}
