//! Pyramidal patch refiner: the default `PhotometricRefiner`.
//!
//! Forward-additive Lucas-Kanade run coarse-to-fine on the absolute position
//! in the current image. Optional terms:
//! - gain and bias, for illumination change between the frames
//! - a fixed 2×2 affine pre-warp of the sampled patch
//! - a quadratic pull toward the initial guess
//!
//! The template is sampled at `p + o` in the reference image and compared with
//! `q + A·o` in the current image, for every offset `o` of the square patch.

use nalgebra::{Matrix2, Matrix4, Point2, Vector2, Vector4};
use rayon::prelude::*;

use crate::image::{FloatImage, Pyramid, RefPatch};
use crate::tracking::mode::RefinementFlags;
use crate::tracking::refine::{PhotometricRefiner, RefinedFeature, RefinementRequest};

/// Stop iterating once the update is below this many pixels.
const EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, Default)]
pub struct PyramidalPatchRefiner;

impl PyramidalPatchRefiner {
    pub fn new() -> Self {
        Self
    }
}

impl PhotometricRefiner for PyramidalPatchRefiner {
    fn refine(&self, request: &RefinementRequest<'_>) -> Vec<RefinedFeature> {
        if request.is_empty() {
            return Vec::new();
        }
        let ref_pyr = Pyramid::build(request.reference.clone(), request.pyramid_levels);
        let cur_pyr = Pyramid::build(request.current.clone(), request.pyramid_levels);
        let num_levels = ref_pyr.num_levels().min(cur_pyr.num_levels());

        (0..request.len())
            .into_par_iter()
            .map(|i| {
                let initial = if request.flags.use_initial_guess {
                    request.initial[i]
                } else {
                    request.ref_points[i]
                };
                if !request.active[i] {
                    return RefinedFeature::failed(initial);
                }
                let affine = if request.flags.consider_affine {
                    request.affine[i]
                } else {
                    Matrix2::identity()
                };
                let align = PatchAlignment {
                    half: request.half_patch_size as i32,
                    iterations: request.iterations,
                    flags: request.flags,
                    weight: request.regularization_weight,
                    affine,
                };
                match align.run(&ref_pyr, &cur_pyr, num_levels, &request.ref_points[i], &initial) {
                    Some(mut refined) => {
                        refined.point_un = request.camera.undistort_pixel(&refined.point);
                        refined
                    }
                    None => RefinedFeature::failed(initial),
                }
            })
            .collect()
    }
}

struct PatchAlignment {
    half: i32,
    iterations: usize,
    flags: RefinementFlags,
    weight: f64,
    affine: Matrix2<f64>,
}

impl PatchAlignment {
    fn offsets(&self) -> impl Iterator<Item = Vector2<f64>> + '_ {
        (-self.half..=self.half)
            .flat_map(move |x| (-self.half..=self.half).map(move |y| Vector2::new(x as f64, y as f64)))
    }

    /// Align one patch. `None` if the normal equations become singular.
    fn run(
        &self,
        ref_pyr: &Pyramid,
        cur_pyr: &Pyramid,
        num_levels: usize,
        p: &Point2<f64>,
        initial: &Point2<f64>,
    ) -> Option<RefinedFeature> {
        let mut q = *initial;
        let mut gain = 1.0;
        let mut bias = 0.0;

        for level in (0..num_levels).rev() {
            let s = 0.5f64.powi(level as i32);
            let tmpl_img = ref_pyr.level(level);
            let cur_img = cur_pyr.level(level);
            let pl = Point2::new(p.x * s, p.y * s);
            let template: Vec<(Vector2<f64>, f64)> = self
                .offsets()
                .map(|o| (o, tmpl_img.sample(pl.x + o.x, pl.y + o.y) as f64))
                .collect();

            for _ in 0..self.iterations {
                let ql = Point2::new(q.x * s, q.y * s);
                let delta = self.gauss_newton_step(cur_img, &template, &ql, initial, s, gain, bias)?;

                q.x += delta[0] / s;
                q.y += delta[1] / s;
                if self.flags.consider_illumination {
                    gain += delta[2];
                    bias += delta[3];
                }
                if delta[0] * delta[0] + delta[1] * delta[1] < EPSILON * EPSILON {
                    break;
                }
            }
        }

        let cur0 = cur_pyr.level(0);
        let ref0 = ref_pyr.level(0);
        let mut sum_abs = 0.0;
        let mut n = 0usize;
        for o in self.offsets() {
            let t = ref0.sample(p.x + o.x, p.y + o.y) as f64;
            let w = self.affine * o;
            let mut i = cur0.sample(q.x + w.x, q.y + w.y) as f64;
            if self.flags.consider_illumination {
                i = gain * i + bias;
            }
            sum_abs += (i - t).abs();
            n += 1;
        }
        let residual = sum_abs / n.max(1) as f64;
        let ncc = RefPatch::extract(ref0, p, self.half as usize).ncc(cur0, &q, &self.affine);

        let inside = q.x >= 0.0
            && q.y >= 0.0
            && q.x < cur0.width() as f64
            && q.y < cur0.height() as f64;
        let success = inside && residual.is_finite() && q.x.is_finite() && q.y.is_finite();

        Some(RefinedFeature {
            point: q,
            point_un: q,
            success,
            residual,
            ncc,
        })
    }

    /// One Gauss-Newton update `[dx, dy, dgain, dbias]` at the level with scale `s`.
    #[allow(clippy::too_many_arguments)]
    fn gauss_newton_step(
        &self,
        cur: &FloatImage,
        template: &[(Vector2<f64>, f64)],
        ql: &Point2<f64>,
        initial: &Point2<f64>,
        s: f64,
        gain: f64,
        bias: f64,
    ) -> Option<Vector4<f64>> {
        let illum = self.flags.consider_illumination;
        let mut h = Matrix4::<f64>::zeros();
        let mut b = Vector4::<f64>::zeros();

        for (o, t) in template {
            let w = self.affine * o;
            let (x, y) = (ql.x + w.x, ql.y + w.y);
            let i = cur.sample(x, y) as f64;
            let g = cur.gradient(x, y);
            let (gx, gy) = (g.x as f64, g.y as f64);

            let (j, r) = if illum {
                (Vector4::new(gain * gx, gain * gy, i, 1.0), gain * i + bias - t)
            } else {
                (Vector4::new(gx, gy, 0.0, 0.0), i - t)
            };
            h += j * j.transpose();
            b -= j * r;
        }

        if self.flags.regularization {
            let lambda = self.weight;
            h[(0, 0)] += lambda;
            h[(1, 1)] += lambda;
            b[0] += lambda * (initial.x * s - ql.x);
            b[1] += lambda * (initial.y * s - ql.y);
        }

        let det2 = h[(0, 0)] * h[(1, 1)] - h[(0, 1)] * h[(1, 0)];
        if det2.abs() < 1e-6 {
            return None;
        }

        if illum {
            let delta = h.cholesky()?.solve(&b);
            delta.iter().all(|v| v.is_finite()).then_some(delta)
        } else {
            let inv_det = 1.0 / det2;
            Some(Vector4::new(
                inv_det * (h[(1, 1)] * b[0] - h[(0, 1)] * b[1]),
                inv_det * (h[(0, 0)] * b[1] - h[(1, 0)] * b[0]),
                0.0,
                0.0,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use approx::assert_relative_eq;

    fn texture(x: f64, y: f64) -> f32 {
        (128.0 + 50.0 * (x * 0.21).sin() * (y * 0.17).cos() + 30.0 * (x * 0.05 + y * 0.11).sin())
            as f32
    }

    fn shifted(d: Vector2<f64>, gain: f32, bias: f32) -> (FloatImage, FloatImage) {
        let reference = FloatImage::from_fn(160, 120, |x, y| texture(x as f64, y as f64));
        let current = FloatImage::from_fn(160, 120, |x, y| {
            gain * texture(x as f64 - d.x, y as f64 - d.y) + bias
        });
        (reference, current)
    }

    fn features() -> Vec<Point2<f64>> {
        vec![
            Point2::new(50.0, 40.0),
            Point2::new(80.0, 60.0),
            Point2::new(110.0, 75.0),
        ]
    }

    struct Fixture {
        reference: FloatImage,
        current: FloatImage,
        camera: CameraModel,
        refs: Vec<Point2<f64>>,
        initial: Vec<Point2<f64>>,
        active: Vec<bool>,
        affine: Vec<Matrix2<f64>>,
    }

    impl Fixture {
        fn new(d: Vector2<f64>, guess: Vector2<f64>, gain: f32, bias: f32) -> Self {
            let (reference, current) = shifted(d, gain, bias);
            let refs = features();
            let initial = refs.iter().map(|p| p + guess).collect();
            Self {
                reference,
                current,
                camera: CameraModel::new(150.0, 150.0, 80.0, 60.0, 160, 120),
                active: vec![true; refs.len()],
                affine: vec![Matrix2::identity(); refs.len()],
                initial,
                refs,
            }
        }

        fn request(&self, flags: RefinementFlags, weight: f64) -> RefinementRequest<'_> {
            RefinementRequest {
                reference: &self.reference,
                current: &self.current,
                camera: &self.camera,
                ref_points: &self.refs,
                initial: &self.initial,
                active: &self.active,
                affine: &self.affine,
                flags,
                half_patch_size: 5,
                iterations: 10,
                pyramid_levels: 3,
                regularization_weight: weight,
            }
        }
    }

    const GUESS_ONLY: RefinementFlags = RefinementFlags {
        use_initial_guess: true,
        consider_illumination: false,
        consider_affine: false,
        regularization: false,
    };

    #[test]
    fn test_zero_motion() {
        let fx = Fixture::new(Vector2::zeros(), Vector2::zeros(), 1.0, 0.0);
        let out = PyramidalPatchRefiner.refine(&fx.request(RefinementFlags::PLAIN, 0.0));

        for (r, p) in out.iter().zip(fx.refs.iter()) {
            assert!(r.success);
            assert_relative_eq!(r.point, *p, epsilon = 1e-3);
            assert!(r.residual < 0.1);
            assert!(r.ncc > 0.999);
        }
    }

    #[test]
    fn test_plain_flow_recovers_shift() {
        let d = Vector2::new(2.5, -1.5);
        let fx = Fixture::new(d, Vector2::zeros(), 1.0, 0.0);
        let out = PyramidalPatchRefiner.refine(&fx.request(RefinementFlags::PLAIN, 0.0));

        for (r, p) in out.iter().zip(fx.refs.iter()) {
            assert!(r.success);
            assert_relative_eq!(r.point, p + d, epsilon = 0.1);
        }
    }

    #[test]
    fn test_initial_guess_is_refined() {
        let d = Vector2::new(6.0, 4.0);
        let fx = Fixture::new(d, Vector2::new(5.0, 3.5), 1.0, 0.0);
        let out = PyramidalPatchRefiner.refine(&fx.request(GUESS_ONLY, 0.0));

        for (r, p) in out.iter().zip(fx.refs.iter()) {
            assert!(r.success);
            assert_relative_eq!(r.point, p + d, epsilon = 0.1);
        }
    }

    #[test]
    fn test_illumination_terms() {
        let d = Vector2::new(1.0, 2.0);
        let fx = Fixture::new(d, Vector2::new(1.0, 2.0), 1.3, 15.0);
        let flags = RefinementFlags {
            consider_illumination: true,
            ..GUESS_ONLY
        };
        let out = PyramidalPatchRefiner.refine(&fx.request(flags, 0.0));

        for (r, p) in out.iter().zip(fx.refs.iter()) {
            assert!(r.success);
            assert_relative_eq!(r.point, p + d, epsilon = 0.1);
            assert!(r.residual < 1.0, "residual {}", r.residual);
            assert!(r.ncc > 0.99);
        }
    }

    #[test]
    fn test_strong_regularization_holds_initial_guess() {
        let d = Vector2::new(2.0, 0.0);
        let fx = Fixture::new(d, Vector2::zeros(), 1.0, 0.0);
        let flags = RefinementFlags {
            regularization: true,
            ..GUESS_ONLY
        };
        let out = PyramidalPatchRefiner.refine(&fx.request(flags, 1e12));

        for (r, p) in out.iter().zip(fx.refs.iter()) {
            assert_relative_eq!(r.point, *p, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_inactive_and_flat_features_fail() {
        let mut fx = Fixture::new(Vector2::zeros(), Vector2::zeros(), 1.0, 0.0);
        fx.active[1] = false;
        fx.reference = FloatImage::from_fn(160, 120, |x, y| {
            if x < 40 { 77.0 } else { texture(x as f64, y as f64) }
        });
        fx.current = fx.reference.clone();
        fx.refs[2] = Point2::new(8.0, 60.0);

        let out = PyramidalPatchRefiner.refine(&fx.request(RefinementFlags::PLAIN, 0.0));
        assert!(out[0].success);
        assert!(!out[1].success);
        assert!(!out[2].success);
    }

    #[test]
    fn test_empty_batch() {
        let mut fx = Fixture::new(Vector2::zeros(), Vector2::zeros(), 1.0, 0.0);
        fx.refs.clear();
        fx.initial.clear();
        fx.active.clear();
        fx.affine.clear();

        let request = fx.request(RefinementFlags::PLAIN, 0.0);
        assert!(request.is_empty());
        assert!(PyramidalPatchRefiner.refine(&request).is_empty());
    }
}
