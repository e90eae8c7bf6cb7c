//! Greyscale converters.

use super::{check_len, gray_image, plane_row, rgb_image, Converter, GrayImage, RgbImage};
use crate::error::Result;
use crate::format::Format;

/// Sample width of a greyscale format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreyDepth {
    /// One byte per pixel.
    Eight,
    /// Two bytes per pixel, little endian.
    Sixteen,
}

/// Converter for `GREY` and `Y16`.
#[derive(Debug, Clone, Copy)]
pub struct Grey {
    depth: GreyDepth,
}

impl Grey {
    /// Create a converter for `depth`.
    #[must_use]
    pub const fn new(depth: GreyDepth) -> Self {
        Self { depth }
    }

    /// 8-bit samples of one row; 16-bit samples keep their high byte.
    fn samples(self, row: &[u8]) -> impl Iterator<Item = u8> + '_ {
        let step = match self.depth {
            GreyDepth::Eight => 1,
            GreyDepth::Sixteen => 2,
        };
        row.chunks_exact(step)
            .map(|sample| sample.last().copied().unwrap_or_default())
    }
}

impl Converter for Grey {
    fn name(&self) -> &'static str {
        match self.depth {
            GreyDepth::Eight => "grey",
            GreyDepth::Sixteen => "y16",
        }
    }

    fn expected_len(&self, format: &Format) -> usize {
        format.stride as usize * format.height as usize
    }

    fn convert(&self, raw: &[u8], format: &Format, flip: bool) -> Result<RgbImage> {
        check_len(raw, self.expected_len(format))?;
        let stride = format.stride as usize;
        rgb_image(format, flip, |y, out| {
            for (rgb, value) in out.chunks_exact_mut(3).zip(self.samples(plane_row(raw, stride, y))) {
                rgb.fill(value);
            }
        })
    }

    fn convert_gray(&self, raw: &[u8], format: &Format, flip: bool) -> Result<GrayImage> {
        check_len(raw, self.expected_len(format))?;
        let stride = format.stride as usize;
        gray_image(format, flip, |y, out| {
            for (dst, value) in out.iter_mut().zip(self.samples(plane_row(raw, stride, y))) {
                *dst = value;
            }
        })
    }
}
