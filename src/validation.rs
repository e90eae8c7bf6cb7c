//! Frame validation utilities for test pattern verification.
//!
//! These check converted frames against the patterns virtual cameras
//! generate, which makes them useful for integration testing with vivid.

use image::RgbImage;

use crate::error::{CaptureError, Result};
use crate::session::Frame;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u8 = 15;

fn mismatch(message: String) -> CaptureError {
    CaptureError::CorruptFrame(message)
}

fn pixel(image: &RgbImage, x: u32, y: u32) -> Result<(u8, u8, u8)> {
    image
        .get_pixel_checked(x, y)
        .map(|pixel| {
            let [r, g, b] = pixel.0;
            (r, g, b)
        })
        .ok_or_else(|| mismatch(format!("pixel ({x}, {y}) outside the frame")))
}

/// Validates that an image contains the SMPTE color bar pattern.
///
/// Samples the centre of each of the 8 vertical stripes on the middle row.
///
/// # Errors
///
/// Returns [`CaptureError::CorruptFrame`] if any bar doesn't match the
/// expected color within tolerance.
pub fn validate_color_bars(image: &RgbImage) -> Result<()> {
    let (width, height) = image.dimensions();
    let bar_width = width / 8;
    let center_y = height / 2;

    for (bar_idx, expected) in (0_u32..).zip(SMPTE_COLOR_BARS) {
        let sample_x = bar_idx * bar_width + bar_width / 2;
        let actual = pixel(image, sample_x, center_y)?;

        if !colors_match(actual, expected, COLOR_TOLERANCE) {
            return Err(mismatch(format!(
                "color bar {bar_idx} mismatch at ({sample_x}, {center_y}): \
                 expected RGB{expected:?}, got RGB{actual:?}"
            )));
        }
    }

    Ok(())
}

/// Validates that an image contains a horizontal gradient.
///
/// Luminance along the middle row must not fall (beyond rounding) from left
/// to right, and must rise by at least 50 overall.
///
/// # Errors
///
/// Returns [`CaptureError::CorruptFrame`] if the luminance decreases or the
/// total change is too small (solid color).
pub fn validate_gradient(image: &RgbImage) -> Result<()> {
    let (width, height) = image.dimensions();
    let center_y = height / 2;

    let mut first: Option<f32> = None;
    let mut previous: Option<f32> = None;

    for x in (0..width).step_by(10) {
        let (r, g, b) = pixel(image, x, center_y)?;
        // Rec. 601 luma
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = previous {
            if luminance < prev - 1.0 {
                return Err(mismatch(format!(
                    "gradient not monotonically increasing at x={x}: \
                     luminance {luminance} < previous {prev}"
                )));
            }
        }
        first.get_or_insert(luminance);
        previous = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, previous) {
        let change = last - first;
        if change < 50.0 {
            return Err(mismatch(format!(
                "insufficient luminance change for gradient: {change} (expected at least 50.0)"
            )));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by exactly 1.
///
/// # Errors
///
/// Returns [`CaptureError::CorruptFrame`] if `frames` is empty or a
/// sequence number is skipped or repeated.
pub fn validate_frame_sequence<I>(frames: &[Frame<I>]) -> Result<()> {
    if frames.is_empty() {
        return Err(mismatch("cannot validate empty frame sequence".to_owned()));
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.metadata.sequence.wrapping_add(1);
            if curr.metadata.sequence != expected {
                return Err(mismatch(format!(
                    "frame sequence gap at index {}: expected {expected}, got {}",
                    index + 1,
                    curr.metadata.sequence
                )));
            }
        }
    }

    Ok(())
}

/// Whether all three channels are within `tolerance` of each other.
const fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u8) -> bool {
    actual.0.abs_diff(expected.0) <= tolerance
        && actual.1.abs_diff(expected.1) <= tolerance
        && actual.2.abs_diff(expected.2) <= tolerance
}
