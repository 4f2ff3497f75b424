use image::{Rgba, RgbaImage};
use rayon::prelude::*;

/// 2-D affine transform in canvas convention:
/// `x' = a*x + c*y + e`, `y' = b*x + d*y + f`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Default for Affine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        e: 0.0,
        f: 0.0,
    };

    /// `self * other`: `other` is applied to points first.
    pub fn then(&self, other: &Affine) -> Affine {
        Affine {
            a: self.a * other.a + self.c * other.b,
            b: self.b * other.a + self.d * other.b,
            c: self.a * other.c + self.c * other.d,
            d: self.b * other.c + self.d * other.d,
            e: self.a * other.e + self.c * other.f + self.e,
            f: self.b * other.e + self.d * other.f + self.f,
        }
    }

    pub fn translate(&self, x: f64, y: f64) -> Affine {
        self.then(&Affine {
            e: x,
            f: y,
            ..Self::IDENTITY
        })
    }

    pub fn rotate(&self, radians: f64) -> Affine {
        let (sin, cos) = radians.sin_cos();
        self.then(&Affine {
            a: cos,
            b: sin,
            c: -sin,
            d: cos,
            e: 0.0,
            f: 0.0,
        })
    }

    pub fn scale(&self, sx: f64, sy: f64) -> Affine {
        self.then(&Affine {
            a: sx,
            d: sy,
            ..Self::IDENTITY
        })
    }

    #[inline]
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    pub fn invert(&self) -> Option<Affine> {
        let det = self.a * self.d - self.b * self.c;
        if det.abs() < f64::EPSILON || !det.is_finite() {
            return None;
        }
        let inv = 1.0 / det;
        Some(Affine {
            a: self.d * inv,
            b: -self.b * inv,
            c: -self.c * inv,
            d: self.a * inv,
            e: (self.c * self.f - self.d * self.e) * inv,
            f: (self.b * self.e - self.a * self.f) * inv,
        })
    }
}

/// Display transform of the base image, shared by every layer drawn over it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportState {
    pub scale: f64,
    /// Pan offset in canvas pixels.
    pub translation: (f64, f64),
    /// Clockwise rotation in degrees.
    pub rotation: f64,
    pub hflip: bool,
    pub vflip: bool,
}

impl Default for ViewportState {
    fn default() -> Self {
        Self {
            scale: 1.0,
            translation: (0.0, 0.0),
            rotation: 0.0,
            hflip: false,
            vflip: false,
        }
    }
}

impl ViewportState {
    /// Scale the image to fit inside the container and center it.
    /// Rotation and flips are kept.
    pub fn fit_contain(&mut self, container: (u32, u32), image: (u32, u32)) {
        let (cw, ch) = (f64::from(container.0), f64::from(container.1));
        let (iw, ih) = (f64::from(image.0), f64::from(image.1));
        if iw > 0.0 && ih > 0.0 && cw > 0.0 && ch > 0.0 {
            self.scale = (cw / iw).min(ch / ih);
        }
        self.translation = (0.0, 0.0);
    }

    /// Transform from image space onto a canvas: translate to the canvas
    /// center plus pan, rotate, scale (negated per flipped axis), then move the
    /// image center to the origin.
    pub fn draw_transform(&self, canvas: (u32, u32), image: (u32, u32)) -> Affine {
        let sx = if self.hflip { -self.scale } else { self.scale };
        let sy = if self.vflip { -self.scale } else { self.scale };
        Affine::IDENTITY
            .translate(
                f64::from(canvas.0) / 2.0 + self.translation.0,
                f64::from(canvas.1) / 2.0 + self.translation.1,
            )
            .rotate(self.rotation.to_radians())
            .scale(sx, sy)
            .translate(-f64::from(image.0) / 2.0, -f64::from(image.1) / 2.0)
    }

    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        self.translation.0 += dx;
        self.translation.1 += dy;
    }

    pub fn zoom_by(&mut self, factor: f64) {
        if factor.is_finite() && factor > 0.0 {
            self.scale = (self.scale * factor).max(1e-3);
        }
    }

    pub fn rotate_by(&mut self, degrees: f64) {
        self.rotation = (self.rotation + degrees).rem_euclid(360.0);
    }

    pub fn toggle_hflip(&mut self) {
        self.hflip = !self.hflip;
    }

    pub fn toggle_vflip(&mut self) {
        self.vflip = !self.vflip;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// On-screen RGBA surface of one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Canvas {
    image: RgbaImage,
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<&Rgba<u8>> {
        self.image.get_pixel_checked(x, y)
    }

    /// Resize and clear.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.image.dimensions() != (width, height) {
            self.image = RgbaImage::new(width, height);
        } else {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.image.fill(0);
    }

    pub fn is_blank(&self) -> bool {
        self.image.pixels().all(|p| p.0[3] == 0)
    }

    /// Draw `source` through `transform` with nearest-neighbour sampling and
    /// source-over blending.
    pub fn draw_image(&mut self, source: &RgbaImage, transform: &Affine) {
        let Some(inverse) = transform.invert() else {
            return;
        };
        let (width, _) = self.image.dimensions();
        let (src_w, src_h) = source.dimensions();
        if width == 0 || src_w == 0 || src_h == 0 {
            return;
        }

        self.image
            .par_chunks_mut(width as usize * 4)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, dst) in row.chunks_exact_mut(4).enumerate() {
                    let (sx, sy) = inverse.apply(x as f64 + 0.5, y as f64 + 0.5);
                    if sx < 0.0 || sy < 0.0 || sx >= f64::from(src_w) || sy >= f64::from(src_h) {
                        continue;
                    }
                    let src = source.get_pixel(sx as u32, sy as u32);
                    blend_over(dst, &src.0);
                }
            });
    }
}

#[inline]
fn blend_over(dst: &mut [u8], src: &[u8; 4]) {
    let sa = f32::from(src[3]) / 255.0;
    if sa <= 0.0 {
        return;
    }
    if sa >= 1.0 {
        dst.copy_from_slice(src);
        return;
    }
    let da = f32::from(dst[3]) / 255.0;
    let out_a = sa + da * (1.0 - sa);
    for channel in 0..3 {
        let sc = f32::from(src[channel]);
        let dc = f32::from(dst[channel]);
        dst[channel] = ((sc * sa + dc * da * (1.0 - sa)) / out_a).round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round() as u8;
}
