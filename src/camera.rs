//! Pinhole camera model with radial-tangential distortion.
//!
//! Handles:
//! - Pixel <-> normalized coordinate conversion
//! - Forward distortion (k1, k2, p1, p2, k3) and its iterative inverse
//! - An optional per-pixel normalization lookup table
//! - K matrix construction for rotation-only prediction

use nalgebra::{Matrix3, Point2, Vector2};

use crate::error::{Result, TrackerError};

/// Precomputed undistorted pixel -> normalized camera coordinates, one entry
/// per integer pixel. Lookups truncate to the containing pixel.
#[derive(Debug, Clone)]
pub struct NormalizeTable {
    width: usize,
    height: usize,
    values: Vec<Vector2<f64>>,
}

impl NormalizeTable {
    /// Wrap a row-major `width × height` table.
    pub fn new(width: usize, height: usize, values: Vec<Vector2<f64>>) -> Result<Self> {
        if values.len() != width * height {
            return Err(TrackerError::LengthMismatch {
                what: "normalize table",
                expected: width * height,
                got: values.len(),
            });
        }
        Ok(Self {
            width,
            height,
            values,
        })
    }

    /// Build the table from the camera's analytic inverse of K.
    ///
    /// Keys are undistorted pixels, the same space `normalize_lookup` is queried in.
    pub fn from_camera(camera: &CameraModel) -> Self {
        let mut values = Vec::with_capacity(camera.width * camera.height);
        for v in 0..camera.height {
            for u in 0..camera.width {
                values.push(camera.normalize(&Point2::new(u as f64, v as f64)));
            }
        }
        Self {
            width: camera.width,
            height: camera.height,
            values,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Entry at the integer pixel containing `p`, if inside the table.
    pub fn lookup(&self, p: &Point2<f64>) -> Option<Vector2<f64>> {
        if p.x < 0.0 || p.y < 0.0 {
            return None;
        }
        let (u, v) = (p.x as usize, p.y as usize);
        if u >= self.width || v >= self.height {
            return None;
        }
        Some(self.values[v * self.width + u])
    }
}

/// Pinhole intrinsics plus a 5-coefficient distortion model.
#[derive(Debug, Clone)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: usize,
    pub height: usize,
    /// [k1, k2, p1, p2, k3]
    pub distortion: [f64; 5],
    normalize_table: Option<NormalizeTable>,
}

impl CameraModel {
    /// Construct from explicit parameters, without distortion.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, width: usize, height: usize) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            width,
            height,
            distortion: [0.0; 5],
            normalize_table: None,
        }
    }

    /// Set the distortion coefficients. Four coefficients leave k3 at zero.
    pub fn with_distortion(mut self, coeffs: &[f64]) -> Self {
        let mut d = [0.0; 5];
        for (dst, src) in d.iter_mut().zip(coeffs.iter()) {
            *dst = *src;
        }
        self.distortion = d;
        self
    }

    /// Attach a normalization lookup table. It must cover the full image.
    pub fn with_normalize_table(mut self, table: NormalizeTable) -> Result<Self> {
        if table.width != self.width || table.height != self.height {
            return Err(TrackerError::NormalizeTableSize {
                width: self.width,
                height: self.height,
                got_width: table.width,
                got_height: table.height,
            });
        }
        self.normalize_table = Some(table);
        Ok(self)
    }

    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    pub fn k_inv(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx, 0.0, -self.cx / self.fx, //
            0.0, 1.0 / self.fy, -self.cy / self.fy, //
            0.0, 0.0, 1.0,
        )
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|&c| c != 0.0)
    }

    /// Apply K^-1 to [u, v, 1]. Does not undistort.
    #[inline]
    pub fn normalize(&self, p: &Point2<f64>) -> Vector2<f64> {
        Vector2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }

    /// Normalized coordinates of the undistorted pixel `p`, from the lookup
    /// table when one is set.
    ///
    /// Pixels outside the table fall back to the analytic inverse.
    pub fn normalize_lookup(&self, p: &Point2<f64>) -> Vector2<f64> {
        self.normalize_table
            .as_ref()
            .and_then(|t| t.lookup(p))
            .unwrap_or_else(|| self.normalize(p))
    }

    #[inline]
    pub fn denormalize(&self, xn: &Vector2<f64>) -> Point2<f64> {
        Point2::new(xn.x * self.fx + self.cx, xn.y * self.fy + self.cy)
    }

    /// Forward radial-tangential distortion in normalized coordinates.
    ///
    /// ```text
    /// x_d = x(1 + k1 r² + k2 r⁴ + k3 r⁶) + 2 p1 x y + p2 (r² + 2x²)
    /// y_d = y(1 + k1 r² + k2 r⁴ + k3 r⁶) + p1 (r² + 2y²) + 2 p2 x y
    /// ```
    pub fn distort_normalized(&self, xn: &Vector2<f64>) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let (x, y) = (xn.x, xn.y);
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Distort an undistorted pixel.
    pub fn distort_pixel(&self, p: &Point2<f64>) -> Point2<f64> {
        self.denormalize(&self.distort_normalized(&self.normalize(p)))
    }

    /// Undistort a distorted pixel by fixed-point iteration on the forward model.
    pub fn undistort_pixel(&self, p: &Point2<f64>) -> Point2<f64> {
        if !self.has_distortion() {
            return *p;
        }
        let [k1, k2, p1, p2, k3] = self.distortion;
        let d = self.normalize(p);
        let (mut x, mut y) = (d.x, d.y);

        for _ in 0..20 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

            x = (d.x - dx) / radial;
            y = (d.y - dy) / radial;
        }

        self.denormalize(&Vector2::new(x, y))
    }

    /// True if `p` lies in [0, width) × [0, height).
    #[inline]
    pub fn in_image(&self, p: &Point2<f64>) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x < self.width as f64 && p.y < self.height as f64
    }
}
