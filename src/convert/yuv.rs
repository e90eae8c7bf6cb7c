//! YUV 4:2:2 packed and 4:2:0 planar converters.

use super::{check_len, gray_image, plane_row, rgb_image, Converter, GrayImage, RgbImage};
use crate::error::{CaptureError, Result};
use crate::format::Format;

/// BT.601 YCbCr to RGB with 8-bit fixed-point coefficients.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = i32::from(y);
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;
    let r = y + ((359 * v) >> 8);
    let g = y - ((88 * u + 183 * v) >> 8);
    let b = y + ((454 * u) >> 8);
    [
        r.clamp(0, 255) as u8,
        g.clamp(0, 255) as u8,
        b.clamp(0, 255) as u8,
    ]
}

/// Byte order of a packed 4:2:2 macropixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YuvOrder {
    /// Y0 U Y1 V.
    Yuyv,
    /// U Y0 V Y1.
    Uyvy,
    /// Y0 V Y1 U.
    Yvyu,
}

impl YuvOrder {
    /// Split a 4-byte macropixel into `(y0, y1, u, v)`.
    const fn split(self, [a, b, c, d]: [u8; 4]) -> (u8, u8, u8, u8) {
        match self {
            Self::Yuyv => (a, c, b, d),
            Self::Uyvy => (b, d, a, c),
            Self::Yvyu => (a, c, d, b),
        }
    }
}

/// Packed 4:2:2 converter.
#[derive(Debug, Clone, Copy)]
pub struct PackedYuv {
    order: YuvOrder,
}

impl PackedYuv {
    /// Create a converter for `order`.
    #[must_use]
    pub const fn new(order: YuvOrder) -> Self {
        Self { order }
    }

    fn macropixels<'a>(&self, row: &'a [u8], width: usize) -> impl Iterator<Item = (u8, u8, u8, u8)> + 'a {
        let order = self.order;
        row.chunks_exact(4)
            .take(width / 2)
            .filter_map(move |chunk| <[u8; 4]>::try_from(chunk).ok())
            .map(move |bytes| order.split(bytes))
    }
}

impl Converter for PackedYuv {
    fn name(&self) -> &'static str {
        match self.order {
            YuvOrder::Yuyv => "yuyv",
            YuvOrder::Uyvy => "uyvy",
            YuvOrder::Yvyu => "yvyu",
        }
    }

    fn expected_len(&self, format: &Format) -> usize {
        format.stride as usize * format.height as usize
    }

    fn convert(&self, raw: &[u8], format: &Format, flip: bool) -> Result<RgbImage> {
        check_len(raw, self.expected_len(format))?;
        let stride = format.stride as usize;
        let width = format.width as usize;
        rgb_image(format, flip, |y, out| {
            let pixels = out.chunks_exact_mut(6);
            for (rgb, (y0, y1, u, v)) in pixels.zip(self.macropixels(plane_row(raw, stride, y), width)) {
                let (left, right) = rgb.split_at_mut(3);
                left.copy_from_slice(&yuv_to_rgb(y0, u, v));
                right.copy_from_slice(&yuv_to_rgb(y1, u, v));
            }
        })
    }

    fn convert_gray(&self, raw: &[u8], format: &Format, flip: bool) -> Result<GrayImage> {
        check_len(raw, self.expected_len(format))?;
        let stride = format.stride as usize;
        let width = format.width as usize;
        gray_image(format, flip, |y, out| {
            let luma = self
                .macropixels(plane_row(raw, stride, y), width)
                .flat_map(|(y0, y1, _, _)| [y0, y1]);
            for (dst, value) in out.iter_mut().zip(luma) {
                *dst = value;
            }
        })
    }
}

/// Plane arrangement of a 4:2:0 format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanarYuvLayout {
    /// Y, then U, then V planes.
    I420,
    /// Y, then V, then U planes.
    Yv12,
    /// Y plane, then interleaved U/V.
    Nv12,
    /// Y plane, then interleaved V/U.
    Nv21,
}

/// Planar and semi-planar 4:2:0 converter.
#[derive(Debug, Clone, Copy)]
pub struct PlanarYuv {
    layout: PlanarYuvLayout,
}

/// Borrowed planes of one 4:2:0 frame.
struct Planes<'a> {
    luma: &'a [u8],
    luma_stride: usize,
    first: &'a [u8],
    second: &'a [u8],
    chroma_stride: usize,
}

impl PlanarYuv {
    /// Create a converter for `layout`.
    #[must_use]
    pub const fn new(layout: PlanarYuvLayout) -> Self {
        Self { layout }
    }

    const fn interleaved(&self) -> bool {
        matches!(self.layout, PlanarYuvLayout::Nv12 | PlanarYuvLayout::Nv21)
    }

    fn chroma_stride(&self, format: &Format) -> usize {
        let stride = format.stride as usize;
        if self.interleaved() {
            stride
        } else {
            stride.div_ceil(2)
        }
    }

    fn split<'a>(&self, raw: &'a [u8], format: &Format) -> Result<Planes<'a>> {
        let luma_stride = format.stride as usize;
        let chroma_stride = self.chroma_stride(format);
        let luma_len = luma_stride * format.height as usize;
        let chroma_rows = format.height.div_ceil(2) as usize;
        let short = || CaptureError::PartialFrame {
            expected: self.expected_len(format),
            actual: raw.len(),
        };

        let (luma, chroma) = raw.split_at_checked(luma_len).ok_or_else(short)?;
        let (first, second) = if self.interleaved() {
            (chroma, chroma)
        } else {
            chroma
                .split_at_checked(chroma_stride * chroma_rows)
                .ok_or_else(short)?
        };
        Ok(Planes {
            luma,
            luma_stride,
            first,
            second,
            chroma_stride,
        })
    }

    /// `(u, v)` for the pixel in column `x` of chroma row `row`.
    fn chroma(&self, planes: &Planes<'_>, row: usize, x: usize) -> (u8, u8) {
        let first = plane_row(planes.first, planes.chroma_stride, row);
        let second = plane_row(planes.second, planes.chroma_stride, row);
        let at = |plane: &[u8], index: usize| plane.get(index).copied().unwrap_or(128);
        match self.layout {
            PlanarYuvLayout::I420 => (at(first, x / 2), at(second, x / 2)),
            PlanarYuvLayout::Yv12 => (at(second, x / 2), at(first, x / 2)),
            PlanarYuvLayout::Nv12 => (at(first, x / 2 * 2), at(first, x / 2 * 2 + 1)),
            PlanarYuvLayout::Nv21 => (at(first, x / 2 * 2 + 1), at(first, x / 2 * 2)),
        }
    }
}

impl Converter for PlanarYuv {
    fn name(&self) -> &'static str {
        match self.layout {
            PlanarYuvLayout::I420 => "i420",
            PlanarYuvLayout::Yv12 => "yv12",
            PlanarYuvLayout::Nv12 => "nv12",
            PlanarYuvLayout::Nv21 => "nv21",
        }
    }

    fn expected_len(&self, format: &Format) -> usize {
        let luma = format.stride as usize * format.height as usize;
        let chroma_rows = format.height.div_ceil(2) as usize;
        let chroma = self.chroma_stride(format) * chroma_rows;
        if self.interleaved() {
            luma + chroma
        } else {
            luma + 2 * chroma
        }
    }

    fn convert(&self, raw: &[u8], format: &Format, flip: bool) -> Result<RgbImage> {
        check_len(raw, self.expected_len(format))?;
        let planes = self.split(raw, format)?;
        rgb_image(format, flip, |y, out| {
            let luma = plane_row(planes.luma, planes.luma_stride, y);
            for (x, (rgb, &value)) in out.chunks_exact_mut(3).zip(luma).enumerate() {
                let (u, v) = self.chroma(&planes, y / 2, x);
                rgb.copy_from_slice(&yuv_to_rgb(value, u, v));
            }
        })
    }

    fn convert_gray(&self, raw: &[u8], format: &Format, flip: bool) -> Result<GrayImage> {
        check_len(raw, self.expected_len(format))?;
        let planes = self.split(raw, format)?;
        gray_image(format, flip, |y, out| {
            let luma = plane_row(planes.luma, planes.luma_stride, y);
            for (dst, &value) in out.iter_mut().zip(luma) {
                *dst = value;
            }
        })
    }
}
