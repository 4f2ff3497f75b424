use crate::{
    labels::{LabelTable, LabelValue},
    slice_cache::DecodedSlice,
    viewport::{Affine, Canvas, ViewportState},
};

use image::RgbaImage;
use rayon::prelude::*;
use std::collections::HashMap;

const TRANSPARENT: [u8; 4] = [0, 0, 0, 0];

/// Label value to RGBA lookup built from a [`LabelTable`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelLut {
    colors: HashMap<LabelValue, [u8; 4]>,
}

impl LabelLut {
    /// Disabled and zero-opacity labels map to fully transparent.
    pub fn from_table(table: &LabelTable) -> Self {
        let colors = table
            .iter()
            .map(|(value, label)| {
                let alpha = (label.opacity.clamp(0.0, 1.0) * 255.0).round() as u8;
                let rgba = if !label.enabled || alpha == 0 {
                    TRANSPARENT
                } else {
                    let [r, g, b] = label.color;
                    [r, g, b, alpha]
                };
                (value, rgba)
            })
            .collect();
        Self { colors }
    }

    /// Zero and unknown values are transparent.
    #[inline]
    pub fn get(&self, value: LabelValue) -> [u8; 4] {
        if value == 0 {
            return TRANSPARENT;
        }
        self.colors.get(&value).copied().unwrap_or(TRANSPARENT)
    }
}

/// Colorize a label slice at its native rows x columns.
pub fn colorize(slice: &DecodedSlice, lut: &LabelLut) -> RgbaImage {
    let (width, height) = (slice.columns(), slice.rows());
    let mut raster = RgbaImage::new(width, height);
    if width == 0 || height == 0 {
        return raster;
    }

    raster
        .par_chunks_mut(width as usize * 4)
        .zip(slice.samples().par_chunks(width as usize))
        .for_each(|(out_row, label_row)| {
            for (out, &value) in out_row.chunks_exact_mut(4).zip(label_row) {
                let rgba = lut.get(value);
                if rgba[3] != 0 {
                    out.copy_from_slice(&rgba);
                }
            }
        });
    raster
}

/// What the last overlay redraw produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverlayDraw {
    /// No matching overlay slice; the canvas is left cleared.
    Cleared,
    Drawn {
        transform: Affine,
        image_size: (u32, u32),
    },
}

pub struct OverlayCompositor;

impl OverlayCompositor {
    /// Redraw the overlay canvas in registration with the base image.
    ///
    /// The canvas is resized to `target_size` (the rendered size of the base
    /// layer) and cleared. The colorized slice is then drawn with the same
    /// [`ViewportState::draw_transform`] the base layer uses.
    pub fn draw(
        canvas: &mut Canvas,
        target_size: (u32, u32),
        overlay: Option<&DecodedSlice>,
        lut: &LabelLut,
        viewport: &ViewportState,
    ) -> OverlayDraw {
        canvas.resize(target_size.0, target_size.1);
        let Some(slice) = overlay else {
            return OverlayDraw::Cleared;
        };

        let raster = colorize(slice, lut);
        let image_size = (slice.columns(), slice.rows());
        let transform = viewport.draw_transform(target_size, image_size);
        canvas.draw_image(&raster, &transform);

        OverlayDraw::Drawn {
            transform,
            image_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViewerConfig;
    use image::Rgba;
    use ndarray::Array2;

    fn table() -> LabelTable {
        let mut table = LabelTable::new();
        table.merge_discovered(&[3, 9], &ViewerConfig::default());
        table
    }

    #[test]
    fn lut_hides_disabled_and_zero_opacity_labels() {
        let mut table = table();
        table.set_enabled(3, false);
        table.set_opacity(9, 0.0);
        let lut = LabelLut::from_table(&table);
        assert_eq!(lut.get(3)[3], 0);
        assert_eq!(lut.get(9)[3], 0);
    }

    #[test]
    fn lut_uses_color_and_scaled_alpha() {
        let mut table = table();
        table.set_color(3, [10, 20, 30]);
        table.set_opacity(3, 1.0);
        let lut = LabelLut::from_table(&table);
        assert_eq!(lut.get(3), [10, 20, 30, 255]);
        assert_eq!(lut.get(9)[3], 89);
        assert_eq!(lut.get(0), TRANSPARENT);
        assert_eq!(lut.get(1234), TRANSPARENT);
    }

    #[test]
    fn colorize_keeps_native_geometry_and_skips_background() {
        let mut table = table();
        table.set_opacity(3, 1.0);
        let lut = LabelLut::from_table(&table);
        let slice = DecodedSlice::new(Array2::from_shape_vec((2, 3), vec![0, 3, 0, 0, 0, 77]).unwrap());
        let raster = colorize(&slice, &lut);
        assert_eq!(raster.dimensions(), (3, 2));
        assert_eq!(raster.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
        assert_eq!(raster.get_pixel(1, 0).0[3], 255);
        assert_eq!(raster.get_pixel(2, 1), &Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn missing_overlay_leaves_canvas_cleared() {
        let mut canvas = Canvas::new(2, 2);
        canvas.draw_image(
            &RgbaImage::from_pixel(2, 2, Rgba([1, 1, 1, 255])),
            &Affine::IDENTITY,
        );
        let outcome = OverlayCompositor::draw(
            &mut canvas,
            (8, 6),
            None,
            &LabelLut::default(),
            &ViewportState::default(),
        );
        assert_eq!(outcome, OverlayDraw::Cleared);
        assert_eq!(canvas.size(), (8, 6));
        assert!(canvas.is_blank());
    }

    #[test]
    fn overlay_uses_base_transform() {
        let viewport = ViewportState {
            scale: 2.5,
            translation: (7.0, -3.0),
            rotation: 45.0,
            hflip: true,
            vflip: true,
        };
        let slice = DecodedSlice::new(Array2::from_elem((16, 32), 3));
        let mut canvas = Canvas::default();
        let outcome = OverlayCompositor::draw(
            &mut canvas,
            (200, 100),
            Some(&slice),
            &LabelLut::from_table(&table()),
            &viewport,
        );
        let base = viewport.draw_transform((200, 100), (32, 16));
        assert_eq!(
            outcome,
            OverlayDraw::Drawn {
                transform: base,
                image_size: (32, 16)
            }
        );
        assert!(!canvas.is_blank());
    }
}
