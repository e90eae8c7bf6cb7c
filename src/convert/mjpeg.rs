//! Motion-JPEG and JPEG frames, decoded with the `image` crate.

use image::imageops;
use image::ImageFormat;

use super::{Converter, GrayImage, RgbImage};
use crate::error::{CaptureError, Result};
use crate::format::Format;

/// Start-of-image marker every JPEG payload begins with.
const SOI: [u8; 2] = [0xff, 0xd8];

/// Converter for `MJPG` and `JPEG`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Jpeg;

impl Jpeg {
    fn decode(raw: &[u8], format: &Format) -> Result<image::DynamicImage> {
        if raw.len() < SOI.len() {
            return Err(CaptureError::PartialFrame {
                expected: SOI.len(),
                actual: raw.len(),
            });
        }
        if !raw.starts_with(&SOI) {
            return Err(CaptureError::CorruptFrame("missing JPEG start marker".to_owned()));
        }
        let decoded = image::load_from_memory_with_format(raw, ImageFormat::Jpeg)
            .map_err(|err| CaptureError::CorruptFrame(err.to_string()))?;
        if (decoded.width(), decoded.height()) != (format.width, format.height) {
            return Err(CaptureError::CorruptFrame(format!(
                "JPEG frame is {}x{}, negotiated {}x{}",
                decoded.width(),
                decoded.height(),
                format.width,
                format.height
            )));
        }
        Ok(decoded)
    }
}

impl Converter for Jpeg {
    fn name(&self) -> &'static str {
        "jpeg"
    }

    /// Compressed frames have no fixed size; only the marker is required.
    fn expected_len(&self, _format: &Format) -> usize {
        SOI.len()
    }

    fn convert(&self, raw: &[u8], format: &Format, flip: bool) -> Result<RgbImage> {
        let mut image = Self::decode(raw, format)?.to_rgb8();
        if flip {
            imageops::flip_vertical_in_place(&mut image);
        }
        Ok(image)
    }

    fn convert_gray(&self, raw: &[u8], format: &Format, flip: bool) -> Result<GrayImage> {
        let mut image = Self::decode(raw, format)?.to_luma8();
        if flip {
            imageops::flip_vertical_in_place(&mut image);
        }
        Ok(image)
    }
}
