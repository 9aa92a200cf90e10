//! Grayscale float images, bilinear sampling, pyramids and patch correlation.

use image::GrayImage;
use nalgebra::{Matrix2, Point2, Vector2};

/// Row-major `f32` image holding raw intensities (0..255 for 8-bit input).
#[derive(Debug, Clone)]
pub struct FloatImage {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl FloatImage {
    pub fn from_gray(img: &GrayImage) -> Self {
        let (w, h) = img.dimensions();
        Self {
            width: w as usize,
            height: h as usize,
            data: img.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    /// Build an image by evaluating `f(x, y)` at every pixel.
    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear interpolation with coordinates clamped to the image border.
    ///
    /// Returns 0 for an empty image.
    pub fn sample(&self, x: f64, y: f64) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let max_x = (self.width - 1) as f64;
        let max_y = (self.height - 1) as f64;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let p00 = self.get(x0, y0);
        let p10 = self.get(x1, y0);
        let p01 = self.get(x0, y1);
        let p11 = self.get(x1, y1);
        (1.0 - fx) * (1.0 - fy) * p00 + fx * (1.0 - fy) * p10 + (1.0 - fx) * fy * p01 + fx * fy * p11
    }

    /// Central-difference gradient at a sub-pixel location.
    pub fn gradient(&self, x: f64, y: f64) -> Vector2<f32> {
        Vector2::new(
            0.5 * (self.sample(x + 1.0, y) - self.sample(x - 1.0, y)),
            0.5 * (self.sample(x, y + 1.0) - self.sample(x, y - 1.0)),
        )
    }

    /// Half-resolution image, each pixel the mean of a 2×2 block.
    pub fn half_sample(&self) -> Self {
        let w = (self.width / 2).max(1);
        let h = (self.height / 2).max(1);
        Self::from_fn(w, h, |x, y| {
            let x0 = (2 * x).min(self.width - 1);
            let y0 = (2 * y).min(self.height - 1);
            let x1 = (x0 + 1).min(self.width - 1);
            let y1 = (y0 + 1).min(self.height - 1);
            0.25 * (self.get(x0, y0) + self.get(x1, y0) + self.get(x0, y1) + self.get(x1, y1))
        })
    }
}

/// Image pyramid, level 0 at full resolution.
#[derive(Debug, Clone)]
pub struct Pyramid {
    pub levels: Vec<FloatImage>,
}

impl Pyramid {
    /// Build `num_levels` levels (at least one). Halving stops once a level
    /// would drop below 2 pixels on either side.
    pub fn build(base: FloatImage, num_levels: usize) -> Self {
        let mut levels = vec![base];
        while levels.len() < num_levels.max(1) {
            let Some(last) = levels.last() else {
                break;
            };
            if last.width() < 4 || last.height() < 4 {
                break;
            }
            let next = last.half_sample();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn level(&self, level: usize) -> &FloatImage {
        &self.levels[level]
    }
}

/// Reference patch of (2h+1)² samples around a keypoint, with its mean.
///
/// Samples are stored with x as the outer loop and y as the inner loop.
#[derive(Debug, Clone)]
pub struct RefPatch {
    half: i32,
    values: Vec<f32>,
    mean: f32,
}

impl RefPatch {
    pub fn extract(img: &FloatImage, center: &Point2<f64>, half: usize) -> Self {
        let half = half as i32;
        let mut values = Vec::with_capacity(((2 * half + 1) * (2 * half + 1)) as usize);
        for x in -half..=half {
            for y in -half..=half {
                values.push(img.sample(center.x + x as f64, center.y + y as f64));
            }
        }
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        Self { half, values, mean }
    }

    /// NCC between this patch and the patch of `cur` centered on `at`,
    /// sampled through `affine` (offset `o` maps to `at + A·o`).
    ///
    /// Returns 0 when either patch has no variance.
    pub fn ncc(&self, cur: &FloatImage, at: &Point2<f64>, affine: &Matrix2<f64>) -> f32 {
        let mut cur_values = Vec::with_capacity(self.values.len());
        for x in -self.half..=self.half {
            for y in -self.half..=self.half {
                let o = affine * Vector2::new(x as f64, y as f64);
                cur_values.push(cur.sample(at.x + o.x, at.y + o.y));
            }
        }
        let cur_mean = cur_values.iter().sum::<f32>() / cur_values.len() as f32;

        let mut num = 0.0f32;
        let mut den_ref = 0.0f32;
        let mut den_cur = 0.0f32;
        for (r, c) in self.values.iter().zip(cur_values.iter()) {
            let dr = r - self.mean;
            let dc = c - cur_mean;
            num += dr * dc;
            den_ref += dr * dr;
            den_cur += dc * dc;
        }

        let den = (den_ref * den_cur).sqrt();
        if den < 1e-6 {
            return 0.0;
        }
        num / den
    }
}
