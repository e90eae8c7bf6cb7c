//! 8-bit Bayer converters.
//!
//! Demosaicing is per 2x2 cell: every pixel of a cell gets the cell's red
//! and blue sample and the mean of its two green samples.

use super::{check_len, plane_row, rgb_image, Converter, RgbImage};
use crate::error::Result;
use crate::format::Format;

/// Colour filter arrangement, named by the top-left 2x2 cell read row by row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BayerPattern {
    /// B G / G R.
    Bggr,
    /// G B / R G.
    Gbrg,
    /// G R / B G.
    Grbg,
    /// R G / G B.
    Rggb,
}

impl BayerPattern {
    /// Split a cell `[top-left, top-right, bottom-left, bottom-right]` into RGB.
    const fn demosaic(self, [a, b, c, d]: [u8; 4]) -> [u8; 3] {
        let (r, g0, g1, b) = match self {
            Self::Bggr => (d, b, c, a),
            Self::Gbrg => (c, a, d, b),
            Self::Grbg => (b, a, d, c),
            Self::Rggb => (a, b, c, d),
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
        let g = ((g0 as u16 + g1 as u16) / 2) as u8;
        [r, g, b]
    }
}

/// Converter for 8-bit Bayer formats.
#[derive(Debug, Clone, Copy)]
pub struct Bayer {
    pattern: BayerPattern,
}

impl Bayer {
    /// Create a converter for `pattern`.
    #[must_use]
    pub const fn new(pattern: BayerPattern) -> Self {
        Self { pattern }
    }
}

impl Converter for Bayer {
    fn name(&self) -> &'static str {
        match self.pattern {
            BayerPattern::Bggr => "bayer-bggr",
            BayerPattern::Gbrg => "bayer-gbrg",
            BayerPattern::Grbg => "bayer-grbg",
            BayerPattern::Rggb => "bayer-rggb",
        }
    }

    fn expected_len(&self, format: &Format) -> usize {
        format.stride as usize * format.height as usize
    }

    fn convert(&self, raw: &[u8], format: &Format, flip: bool) -> Result<RgbImage> {
        check_len(raw, self.expected_len(format))?;
        let stride = format.stride as usize;
        let width = format.width as usize;
        let height = format.height as usize;
        // Odd trailing rows and columns reuse the previous cell's samples.
        let cell_start = |position: usize, extent: usize| (position & !1).min(extent.saturating_sub(2));
        let sample = |row: &[u8], x: usize| row.get(x).copied().unwrap_or_default();

        rgb_image(format, flip, |y, out| {
            let top_y = cell_start(y, height);
            let top = plane_row(raw, stride, top_y);
            let bottom = plane_row(raw, stride, (top_y + 1).min(height - 1));
            for (x, rgb) in out.chunks_exact_mut(3).enumerate() {
                let left = cell_start(x, width);
                let right = (left + 1).min(width - 1);
                let cell = [
                    sample(top, left),
                    sample(top, right),
                    sample(bottom, left),
                    sample(bottom, right),
                ];
                rgb.copy_from_slice(&self.pattern.demosaic(cell));
            }
        })
    }
}
