//! Packed RGB converters.

use super::{check_len, plane_row, rgb_image, Converter, RgbImage};
use crate::error::Result;
use crate::format::Format;

/// Memory layout of a packed RGB pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RgbLayout {
    /// R, G, B.
    Rgb24,
    /// B, G, R.
    Bgr24,
    /// Padding byte, then R, G, B.
    Xrgb32,
    /// B, G, R, then padding byte.
    Bgrx32,
    /// 16-bit little endian, red in the top five bits.
    Rgb565,
}

impl RgbLayout {
    const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb565 => 2,
            Self::Rgb24 | Self::Bgr24 => 3,
            Self::Xrgb32 | Self::Bgrx32 => 4,
        }
    }

    /// Decode one pixel from exactly `bytes_per_pixel` bytes.
    fn decode(self, pixel: &[u8]) -> [u8; 3] {
        match (self, pixel) {
            (Self::Rgb24, &[r, g, b]) | (Self::Bgr24, &[b, g, r]) => [r, g, b],
            (Self::Xrgb32, &[_, r, g, b]) | (Self::Bgrx32, &[b, g, r, _]) => [r, g, b],
            (Self::Rgb565, &[low, high]) => {
                let value = u16::from_le_bytes([low, high]);
                [
                    expand(value >> 11, 5),
                    expand((value >> 5) & 0x3f, 6),
                    expand(value & 0x1f, 5),
                ]
            }
            _ => [0, 0, 0],
        }
    }
}

/// Scale a `bits`-wide channel to 8 bits by replicating its top bits.
#[allow(clippy::cast_possible_truncation)]
const fn expand(value: u16, bits: u32) -> u8 {
    let shifted = value << (8 - bits);
    (shifted | (shifted >> bits)) as u8
}

/// Converter for packed RGB formats.
#[derive(Debug, Clone, Copy)]
pub struct PackedRgb {
    layout: RgbLayout,
}

impl PackedRgb {
    /// Create a converter for `layout`.
    #[must_use]
    pub const fn new(layout: RgbLayout) -> Self {
        Self { layout }
    }
}

impl Converter for PackedRgb {
    fn name(&self) -> &'static str {
        match self.layout {
            RgbLayout::Rgb24 => "rgb24",
            RgbLayout::Bgr24 => "bgr24",
            RgbLayout::Xrgb32 => "xrgb32",
            RgbLayout::Bgrx32 => "bgrx32",
            RgbLayout::Rgb565 => "rgb565",
        }
    }

    fn expected_len(&self, format: &Format) -> usize {
        format.stride as usize * format.height as usize
    }

    fn convert(&self, raw: &[u8], format: &Format, flip: bool) -> Result<RgbImage> {
        check_len(raw, self.expected_len(format))?;
        let stride = format.stride as usize;
        let bytes_per_pixel = self.layout.bytes_per_pixel();
        rgb_image(format, flip, |y, out| {
            let source = plane_row(raw, stride, y).chunks_exact(bytes_per_pixel);
            for (rgb, pixel) in out.chunks_exact_mut(3).zip(source) {
                rgb.copy_from_slice(&self.layout.decode(pixel));
            }
        })
    }
}
