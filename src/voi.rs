use crate::{instance::InstanceDescriptor, slice_cache::DecodedSlice};

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

/// Window center/width intensity mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Voi {
    pub center: f64,
    pub width: f64,
}

impl Voi {
    /// Accept a window only when both values are finite and the width exceeds 1.
    /// Narrower windows saturate the whole image.
    pub fn from_tags(center: Option<f64>, width: Option<f64>) -> Option<Self> {
        match (center, width) {
            (Some(center), Some(width))
                if center.is_finite() && width.is_finite() && width > 1.0 =>
            {
                Some(Self { center, width })
            }
            _ => None,
        }
    }

    /// Window of an instance: its own tags, then the decoder default, then the
    /// value range of the decoded slice.
    pub fn resolve(instance: &InstanceDescriptor, slice: &DecodedSlice) -> Self {
        Self::from_tags(instance.window_center, instance.window_width)
            .or(slice.default_voi())
            .unwrap_or_else(|| Self::from_range(slice))
    }

    fn from_range(slice: &DecodedSlice) -> Self {
        let (min, max) = slice
            .samples()
            .iter()
            .map(|&raw| slice.rescale().apply(raw))
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
                (min.min(v), max.max(v))
            });
        if !min.is_finite() {
            return Self {
                center: 0.0,
                width: 2.0,
            };
        }
        Self {
            center: (min + max) / 2.0,
            width: (max - min).max(2.0),
        }
    }

    /// Linear VOI function (PS3.3 C.11.2.1.2.1) onto 8 bits.
    #[inline]
    pub fn map(&self, value: f64) -> u8 {
        let center = self.center - 0.5;
        let width = self.width - 1.0;
        if value <= center - width / 2.0 {
            0
        } else if value > center + width / 2.0 {
            255
        } else {
            (((value - center) / width + 0.5) * 255.0).clamp(0.0, 255.0).round() as u8
        }
    }
}

/// Grayscale raster of a decoded slice at its native size.
pub fn render_grayscale(slice: &DecodedSlice, voi: &Voi) -> RgbaImage {
    let rescale = slice.rescale();
    let pixel_data: Vec<u8> = slice
        .samples()
        .par_iter()
        .flat_map_iter(|&raw| {
            let gray = voi.map(rescale.apply(raw));
            [gray, gray, gray, 255]
        })
        .collect();
    RgbaImage::from_raw(slice.columns(), slice.rows(), pixel_data)
        .unwrap_or_else(|| RgbaImage::from_pixel(slice.columns(), slice.rows(), Rgba([0, 0, 0, 255])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn degenerate_width_is_rejected() {
        assert_eq!(Voi::from_tags(Some(40.0), Some(1.0)), None);
        assert_eq!(Voi::from_tags(Some(f64::NAN), Some(400.0)), None);
        assert_eq!(Voi::from_tags(Some(40.0), None), None);
        assert!(Voi::from_tags(Some(40.0), Some(400.0)).is_some());
    }

    #[test]
    fn degenerate_tags_fall_back_to_decoder_default() {
        let decoder_default = Voi {
            center: 100.0,
            width: 50.0,
        };
        let slice =
            DecodedSlice::new(Array2::zeros((2, 2))).with_default_voi(Some(decoder_default));
        let instance = InstanceDescriptor::new("a", 1).with_window(40.0, 1.0);
        assert_eq!(Voi::resolve(&instance, &slice), decoder_default);
    }

    #[test]
    fn range_fallback_covers_slice_values() {
        let slice = DecodedSlice::new(Array2::from_shape_vec((1, 3), vec![0, 50, 100]).unwrap());
        let voi = Voi::resolve(&InstanceDescriptor::new("a", 1), &slice);
        assert_eq!(voi.center, 50.0);
        assert_eq!(voi.width, 100.0);
    }

    #[test]
    fn linear_map_saturates_outside_window() {
        let voi = Voi {
            center: 40.0,
            width: 400.0,
        };
        assert_eq!(voi.map(-1000.0), 0);
        assert_eq!(voi.map(1000.0), 255);
        let mid = voi.map(40.0);
        assert!((126..=129).contains(&mid));
    }

    #[test]
    fn grayscale_has_native_geometry() {
        let slice = DecodedSlice::new(Array2::from_elem((3, 5), 10));
        let image = render_grayscale(
            &slice,
            &Voi {
                center: 0.0,
                width: 2.0,
            },
        );
        assert_eq!(image.dimensions(), (5, 3));
        assert_eq!(image.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    }
}
