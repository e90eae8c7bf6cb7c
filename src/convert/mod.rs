//! Raw frame to image conversion.
//!
//! Every converter turns the bytes of one pixel format into the canonical
//! [`RgbImage`] (packed 8-bit RGB, rows top to bottom, stride `3 * width`)
//! and can produce a single-channel [`GrayImage`] as well.
//!
//! Converters are looked up through an explicit [`ConversionRegistry`]
//! built once per session. The first converter registered for a format
//! keeps it.

mod bayer;
mod grey;
mod mjpeg;
mod rgb;
mod yuv;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use image::{GrayImage, RgbImage};
use tracing::{debug, warn};

pub use bayer::{Bayer, BayerPattern};
pub use grey::{Grey, GreyDepth};
pub use mjpeg::Jpeg;
pub use rgb::{PackedRgb, RgbLayout};
pub use yuv::{PackedYuv, PlanarYuv, PlanarYuvLayout, YuvOrder};

use crate::error::{CaptureError, Result};
use crate::format::Format;
use crate::traits::FourCC;

/// Turns raw frames of one pixel format into images.
///
/// Implementations must check the input length before touching pixels
/// and report a short frame as [`CaptureError::PartialFrame`].
pub trait Converter: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Bytes a complete frame of `format` occupies.
    fn expected_len(&self, format: &Format) -> usize;

    /// Convert a raw frame. With `flip`, row 0 of the output is the last
    /// row of the input.
    ///
    /// Raw formats write rows in flipped order directly. Compressed formats
    /// cannot, so [`Jpeg`] decodes first and flips the decoded image in a
    /// second pass.
    fn convert(&self, raw: &[u8], format: &Format, flip: bool) -> Result<RgbImage>;

    /// Convert a raw frame to a single luminance channel.
    fn convert_gray(&self, raw: &[u8], format: &Format, flip: bool) -> Result<GrayImage> {
        let rgb = self.convert(raw, format, flip)?;
        Ok(image::imageops::grayscale(&rgb))
    }
}

/// Map from pixel format to converter.
#[derive(Debug, Clone, Default)]
pub struct ConversionRegistry {
    converters: HashMap<FourCC, Arc<dyn Converter>>,
}

impl ConversionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in converter.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let builtin: [(FourCC, Arc<dyn Converter>); 20] = [
            (FourCC::YUYV, Arc::new(PackedYuv::new(YuvOrder::Yuyv))),
            (FourCC::UYVY, Arc::new(PackedYuv::new(YuvOrder::Uyvy))),
            (FourCC::YVYU, Arc::new(PackedYuv::new(YuvOrder::Yvyu))),
            (FourCC::YUV420, Arc::new(PlanarYuv::new(PlanarYuvLayout::I420))),
            (FourCC::YVU420, Arc::new(PlanarYuv::new(PlanarYuvLayout::Yv12))),
            (FourCC::NV12, Arc::new(PlanarYuv::new(PlanarYuvLayout::Nv12))),
            (FourCC::NV21, Arc::new(PlanarYuv::new(PlanarYuvLayout::Nv21))),
            (FourCC::RGB24, Arc::new(PackedRgb::new(RgbLayout::Rgb24))),
            (FourCC::BGR24, Arc::new(PackedRgb::new(RgbLayout::Bgr24))),
            (FourCC::RGB32, Arc::new(PackedRgb::new(RgbLayout::Xrgb32))),
            (FourCC::BGR32, Arc::new(PackedRgb::new(RgbLayout::Bgrx32))),
            (FourCC::RGB565, Arc::new(PackedRgb::new(RgbLayout::Rgb565))),
            (FourCC::GREY, Arc::new(Grey::new(GreyDepth::Eight))),
            (FourCC::Y16, Arc::new(Grey::new(GreyDepth::Sixteen))),
            (FourCC::SBGGR8, Arc::new(Bayer::new(BayerPattern::Bggr))),
            (FourCC::SGBRG8, Arc::new(Bayer::new(BayerPattern::Gbrg))),
            (FourCC::SGRBG8, Arc::new(Bayer::new(BayerPattern::Grbg))),
            (FourCC::SRGGB8, Arc::new(Bayer::new(BayerPattern::Rggb))),
            (FourCC::MJPG, Arc::new(Jpeg)),
            (FourCC::JPEG, Arc::new(Jpeg)),
        ];
        for (fourcc, converter) in builtin {
            registry.register(fourcc, converter);
        }
        registry
    }

    /// Register `converter` for `fourcc`.
    ///
    /// Returns `false` if a different converter already owns the format;
    /// the existing one is kept. Registering the same instance again is
    /// accepted and changes nothing.
    pub fn register(&mut self, fourcc: FourCC, converter: Arc<dyn Converter>) -> bool {
        match self.converters.entry(fourcc) {
            Entry::Occupied(existing) => {
                let same = Arc::ptr_eq(existing.get(), &converter);
                if !same {
                    warn!(
                        %fourcc,
                        kept = existing.get().name(),
                        rejected = converter.name(),
                        "converter already registered for format"
                    );
                }
                same
            }
            Entry::Vacant(slot) => {
                debug!(%fourcc, converter = converter.name(), "registered converter");
                slot.insert(converter);
                true
            }
        }
    }

    /// Converter registered for `fourcc`.
    #[must_use]
    pub fn lookup(&self, fourcc: FourCC) -> Option<Arc<dyn Converter>> {
        self.converters.get(&fourcc).map(Arc::clone)
    }

    /// Whether a converter is registered for `fourcc`.
    #[must_use]
    pub fn supports(&self, fourcc: FourCC) -> bool {
        self.converters.contains_key(&fourcc)
    }

    /// Formats with a registered converter, in no particular order.
    pub fn formats(&self) -> impl Iterator<Item = FourCC> + '_ {
        self.converters.keys().copied()
    }
}

/// Fail with [`CaptureError::PartialFrame`] unless `raw` holds `expected` bytes.
pub(crate) fn check_len(raw: &[u8], expected: usize) -> Result<()> {
    if raw.len() < expected {
        return Err(CaptureError::PartialFrame {
            expected,
            actual: raw.len(),
        });
    }
    Ok(())
}

/// Call `fill(source_row, output_row)` for every output row.
///
/// With `flip` the output rows are visited bottom-up, so the image comes
/// out vertically flipped without a second pass.
pub(crate) fn fill_rows<F>(data: &mut [u8], row_len: usize, flip: bool, mut fill: F)
where
    F: FnMut(usize, &mut [u8]),
{
    if row_len == 0 {
        return;
    }
    let rows = data.chunks_exact_mut(row_len);
    if flip {
        rows.rev().enumerate().for_each(|(y, row)| fill(y, row));
    } else {
        rows.enumerate().for_each(|(y, row)| fill(y, row));
    }
}

/// Build an RGB image of `format`'s size row by row.
pub(crate) fn rgb_image<F>(format: &Format, flip: bool, fill: F) -> Result<RgbImage>
where
    F: FnMut(usize, &mut [u8]),
{
    let row_len = format.width as usize * 3;
    let mut data = vec![0; row_len * format.height as usize];
    fill_rows(&mut data, row_len, flip, fill);
    RgbImage::from_raw(format.width, format.height, data)
        .ok_or_else(|| CaptureError::CorruptFrame("RGB buffer size mismatch".to_owned()))
}

/// Build a grey image of `format`'s size row by row.
pub(crate) fn gray_image<F>(format: &Format, flip: bool, fill: F) -> Result<GrayImage>
where
    F: FnMut(usize, &mut [u8]),
{
    let row_len = format.width as usize;
    let mut data = vec![0; row_len * format.height as usize];
    fill_rows(&mut data, row_len, flip, fill);
    GrayImage::from_raw(format.width, format.height, data)
        .ok_or_else(|| CaptureError::CorruptFrame("grey buffer size mismatch".to_owned()))
}

/// Rows of a packed plane, `stride` bytes apart.
pub(crate) fn plane_row(plane: &[u8], stride: usize, y: usize) -> &[u8] {
    plane.get(y * stride..).unwrap_or_default()
}
