//! Resolution of a requested (format, resolution, rate) into what the device does.
//!
//! The catalog is only a hint: every choice is confirmed with a live
//! `set_format` call and the driver's answer wins.

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::format::{
    Format, FormatCapability, FormatCatalog, FrameInterval, FrameSize, IntervalRange, Resolution,
};
use crate::traits::{FourCC, VideoDevice};

/// Formats tried in order when the requested one is unavailable.
///
/// Uncompressed color formats first, then Bayer and grey, then YUV, then
/// compressed formats which cost a decode per frame.
pub const FORMAT_PREFERENCE: [FourCC; 16] = [
    FourCC::RGB32,
    FourCC::BGR32,
    FourCC::RGB24,
    FourCC::BGR24,
    FourCC::RGB565,
    FourCC::SBGGR8,
    FourCC::GREY,
    FourCC::Y16,
    FourCC::YVU420,
    FourCC::YUYV,
    FourCC::UYVY,
    FourCC::NV12,
    FourCC::NV21,
    FourCC::YUV420,
    FourCC::MJPG,
    FourCC::JPEG,
];

/// What the caller would like to capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatRequest {
    /// Desired pixel format, `None` for automatic selection.
    pub pixel_format: Option<FourCC>,
    /// Desired frame size.
    pub resolution: Resolution,
    /// Desired frames per second.
    pub frame_rate: f32,
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Layout the driver settled on.
    pub format: Format,
    /// Frame interval the driver settled on, if it supports setting one.
    pub interval: Option<FrameInterval>,
}

impl Accepted {
    /// Negotiated frames per second, if known.
    #[must_use]
    pub fn frame_rate(&self) -> Option<f64> {
        self.interval.map(FrameInterval::fps)
    }
}

/// Picks the closest supported configuration using a [`FormatCatalog`].
#[derive(Debug, Clone, Copy)]
pub struct FormatNegotiator<'a> {
    catalog: &'a FormatCatalog,
}

impl<'a> FormatNegotiator<'a> {
    /// Create a negotiator over `catalog`.
    #[must_use]
    pub const fn new(catalog: &'a FormatCatalog) -> Self {
        Self { catalog }
    }

    /// Negotiate a format with the device.
    ///
    /// `convertible` filters the fallback formats down to those the caller
    /// can turn into images. An explicitly requested format is always tried.
    pub fn resolve<D, F>(&self, device: &mut D, request: &FormatRequest, convertible: F) -> Result<Accepted>
    where
        D: VideoDevice,
        F: Fn(FourCC) -> bool,
    {
        let mut tried = Vec::new();
        for fourcc in self.candidates(request.pixel_format, convertible) {
            tried.push(fourcc);
            let capability = self.catalog.get(fourcc);
            let resolution = capability
                .and_then(|capability| choose_resolution(capability, request.resolution))
                .unwrap_or(request.resolution);

            let format = match device.set_format(fourcc, resolution) {
                Ok(format) if format.fourcc == fourcc => format.sanitized(),
                Ok(format) => {
                    debug!(requested = %fourcc, got = %format.fourcc, "driver substituted pixel format");
                    continue;
                }
                Err(err) => {
                    debug!(%fourcc, %resolution, error = %err, "driver rejected pixel format");
                    continue;
                }
            };
            if format.resolution() != resolution {
                debug!(requested = %resolution, got = %format.resolution(), "driver adjusted resolution");
            }

            let interval = Self::apply_interval(device, capability, &format, request.frame_rate);
            info!(
                fourcc = %format.fourcc,
                width = format.width,
                height = format.height,
                stride = format.stride,
                size = format.size,
                interval = ?interval.map(|interval| interval.to_string()),
                "negotiated capture format"
            );
            return Ok(Accepted { format, interval });
        }
        Err(CaptureError::NoAcceptableFormat { tried })
    }

    /// Formats to try, in order, without duplicates.
    fn candidates<F>(&self, requested: Option<FourCC>, convertible: F) -> Vec<FourCC>
    where
        F: Fn(FourCC) -> bool,
    {
        let mut order = Vec::new();
        if let Some(fourcc) = requested {
            if self.catalog.is_empty() || self.catalog.contains(fourcc) {
                order.push(fourcc);
            } else {
                warn!(%fourcc, "requested pixel format not offered by device; falling back");
            }
        }

        let preferred = FORMAT_PREFERENCE
            .iter()
            .copied()
            .filter(|fourcc| self.catalog.is_empty() || self.catalog.contains(*fourcc));
        let others = self
            .catalog
            .formats()
            .iter()
            .map(|format| format.descriptor.fourcc)
            .filter(|fourcc| !FORMAT_PREFERENCE.contains(fourcc));
        for fourcc in preferred.chain(others) {
            if convertible(fourcc) && !order.contains(&fourcc) {
                order.push(fourcc);
            }
        }
        order
    }

    /// Set the frame interval closest to `frame_rate`. Best effort.
    fn apply_interval<D: VideoDevice>(
        device: &mut D,
        capability: Option<&FormatCapability>,
        format: &Format,
        frame_rate: f32,
    ) -> Option<FrameInterval> {
        let requested = FrameInterval::from_fps(frame_rate)?;
        let target = capability
            .and_then(|capability| capability.intervals_for(format.resolution()))
            .and_then(|ranges| choose_interval(ranges, requested))
            .unwrap_or(requested);

        match device.set_frame_interval(target) {
            Ok(actual) if actual.is_valid() => Some(actual),
            Ok(_) => None,
            Err(err) => {
                warn!(interval = %target, error = %err, "setting frame interval not supported");
                None
            }
        }
    }
}

/// Pick a supported resolution for `requested`.
///
/// An exact match wins. Otherwise the largest size not exceeding the
/// request in either dimension, and failing that the smallest size.
#[must_use]
pub fn choose_resolution(capability: &FormatCapability, requested: Resolution) -> Option<Resolution> {
    if capability
        .sizes
        .iter()
        .any(|entry| entry.size.contains(requested))
    {
        return Some(requested);
    }

    let mut candidates = Vec::new();
    for entry in &capability.sizes {
        match entry.size {
            FrameSize::Discrete(size) => candidates.push(size),
            FrameSize::Stepwise(range) => {
                candidates.extend(range.largest_within(requested));
                candidates.push(range.smallest());
            }
        }
    }

    let by_size = |a: &Resolution, b: &Resolution| a.area().cmp(&b.area()).then(a.width.cmp(&b.width));
    candidates
        .iter()
        .copied()
        .filter(|size| size.fits_within(requested))
        .max_by(by_size)
        .or_else(|| candidates.iter().copied().min_by(by_size))
}

/// Pick the interval whose rate is closest to `requested`'s.
///
/// Equidistant candidates resolve to the higher frame rate.
#[must_use]
pub fn choose_interval(ranges: &[IntervalRange], requested: FrameInterval) -> Option<FrameInterval> {
    ranges
        .iter()
        .flat_map(|range| range.candidates_near(requested))
        .filter(|interval| interval.is_valid())
        .min_by(|a, b| compare_rate_distance(*a, *b, requested).then_with(|| a.cmp(b)))
}

/// Order `a` and `b` by how far their frame rates are from `target`'s.
///
/// Exact: compares `|fps(a) - fps(t)|` against `|fps(b) - fps(t)|` with
/// integer cross-multiplication.
fn compare_rate_distance(a: FrameInterval, b: FrameInterval, target: FrameInterval) -> Ordering {
    let distance_numerator = |x: FrameInterval| {
        let lhs = u128::from(x.denominator) * u128::from(target.numerator);
        let rhs = u128::from(target.denominator) * u128::from(x.numerator);
        lhs.abs_diff(rhs)
    };
    let lhs = distance_numerator(a) * u128::from(b.numerator);
    let rhs = distance_numerator(b) * u128::from(a.numerator);
    lhs.cmp(&rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatDescriptor, SizeCapability, StepwiseSize};
    use crate::mock::MockDevice;

    fn discrete_capability(sizes: &[(u32, u32)]) -> FormatCapability {
        FormatCapability {
            descriptor: FormatDescriptor {
                fourcc: FourCC::YUYV,
                description: "YUYV 4:2:2".to_owned(),
                compressed: false,
            },
            sizes: sizes
                .iter()
                .map(|&(width, height)| SizeCapability {
                    size: FrameSize::Discrete(Resolution::new(width, height)),
                    intervals: Vec::new(),
                    intervals_guessed: false,
                })
                .collect(),
        }
    }

    fn intervals(list: &[(u32, u32)]) -> Vec<IntervalRange> {
        list.iter()
            .map(|&(n, d)| IntervalRange::Discrete(FrameInterval::new(n, d)))
            .collect()
    }

    fn request(pixel_format: Option<FourCC>, width: u32, height: u32, frame_rate: f32) -> FormatRequest {
        FormatRequest {
            pixel_format,
            resolution: Resolution::new(width, height),
            frame_rate,
        }
    }

    #[test]
    fn test_largest_resolution_not_exceeding_request() {
        let capability = discrete_capability(&[(160, 120), (320, 240), (640, 480)]);
        assert_eq!(
            choose_resolution(&capability, Resolution::new(400, 300)),
            Some(Resolution::new(320, 240))
        );
        assert_eq!(
            choose_resolution(&capability, Resolution::new(640, 480)),
            Some(Resolution::new(640, 480))
        );
        assert_eq!(
            choose_resolution(&capability, Resolution::new(4000, 3000)),
            Some(Resolution::new(640, 480))
        );
    }

    #[test]
    fn test_smallest_resolution_when_request_is_below_all() {
        let capability = discrete_capability(&[(320, 240), (160, 120), (640, 480)]);
        assert_eq!(
            choose_resolution(&capability, Resolution::new(100, 100)),
            Some(Resolution::new(160, 120))
        );
    }

    #[test]
    fn test_resolution_always_from_catalog() {
        let listed = [(160, 120), (176, 144), (320, 240), (352, 288), (640, 480)];
        let capability = discrete_capability(&listed);
        for width in (0..=800).step_by(37) {
            for height in (0..=600).step_by(29) {
                let chosen = choose_resolution(&capability, Resolution::new(width, height))
                    .expect("catalog is not empty");
                assert!(
                    listed.contains(&(chosen.width, chosen.height)),
                    "{width}x{height} resolved to unlisted {chosen}"
                );
            }
        }
    }

    #[test]
    fn test_stepwise_resolution_snaps_to_grid() {
        let mut capability = discrete_capability(&[]);
        capability.sizes.push(SizeCapability {
            size: FrameSize::Stepwise(StepwiseSize {
                min_width: 64,
                max_width: 1280,
                step_width: 64,
                min_height: 48,
                max_height: 960,
                step_height: 48,
            }),
            intervals: Vec::new(),
            intervals_guessed: false,
        });
        assert_eq!(
            choose_resolution(&capability, Resolution::new(400, 300)),
            Some(Resolution::new(384, 288))
        );
        assert_eq!(
            choose_resolution(&capability, Resolution::new(10, 10)),
            Some(Resolution::new(64, 48))
        );
    }

    #[test]
    fn test_closest_frame_rate() {
        let ranges = intervals(&[(1, 30), (1, 15), (1, 5)]);
        let chosen = choose_interval(&ranges, FrameInterval::new(1, 20)).expect("non-empty");
        assert_eq!(chosen, FrameInterval::new(1, 15));
    }

    #[test]
    fn test_frame_rate_tie_prefers_higher_rate() {
        let ranges = intervals(&[(1, 5), (1, 15), (1, 30)]);
        let chosen = choose_interval(&ranges, FrameInterval::new(1, 10)).expect("non-empty");
        assert_eq!(chosen, FrameInterval::new(1, 15));
    }

    #[test]
    fn test_resolve_against_catalog() {
        let mut device = MockDevice::new();
        let catalog = FormatCatalog::probe(&mut device);
        let negotiator = FormatNegotiator::new(&catalog);

        let accepted = negotiator
            .resolve(&mut device, &request(Some(FourCC::YUYV), 400, 300, 20.0), |_| true)
            .expect("negotiation should succeed");
        assert_eq!(accepted.format.fourcc, FourCC::YUYV);
        assert_eq!(accepted.format.resolution(), Resolution::new(320, 240));
        assert_eq!(accepted.interval, Some(FrameInterval::new(1, 15)));
    }

    #[test]
    fn test_unlisted_format_falls_back_by_preference() {
        let mut device = MockDevice::new();
        let catalog = FormatCatalog::probe(&mut device);
        let negotiator = FormatNegotiator::new(&catalog);

        let accepted = negotiator
            .resolve(&mut device, &request(Some(FourCC::RGB24), 640, 480, 30.0), |_| true)
            .expect("negotiation should succeed");
        // YUYV precedes MJPG in the preference order.
        assert_eq!(accepted.format.fourcc, FourCC::YUYV);
    }

    #[test]
    fn test_fallback_skips_unconvertible_formats() {
        let mut device = MockDevice::new();
        let catalog = FormatCatalog::probe(&mut device);
        let negotiator = FormatNegotiator::new(&catalog);

        let accepted = negotiator
            .resolve(&mut device, &request(None, 640, 480, 30.0), |fourcc| {
                fourcc == FourCC::MJPG
            })
            .expect("negotiation should succeed");
        assert_eq!(accepted.format.fourcc, FourCC::MJPG);
    }

    #[test]
    fn test_empty_catalog_sets_blindly() {
        let mut device = MockDevice::new()
            .without_enumeration()
            .with_accepted_formats(&[FourCC::YUYV]);
        let catalog = FormatCatalog::probe(&mut device);
        assert!(catalog.is_empty());

        let accepted = FormatNegotiator::new(&catalog)
            .resolve(&mut device, &request(None, 320, 240, 30.0), |_| true)
            .expect("blind set should succeed");
        assert_eq!(accepted.format.fourcc, FourCC::YUYV);
        assert_eq!(accepted.interval, Some(FrameInterval::new(1, 30)));

        let attempts = device.log().borrow().set_format_calls.clone();
        assert_eq!(attempts.first().map(|(fourcc, _)| *fourcc), Some(FourCC::RGB32));
        assert_eq!(attempts.last().map(|(fourcc, _)| *fourcc), Some(FourCC::YUYV));
    }

    #[test]
    fn test_every_format_rejected() {
        let mut device = MockDevice::new().with_accepted_formats(&[]);
        let catalog = FormatCatalog::probe(&mut device);

        let err = FormatNegotiator::new(&catalog)
            .resolve(&mut device, &request(None, 320, 240, 30.0), |_| true)
            .expect_err("no format accepted");
        assert!(
            matches!(&err, CaptureError::NoAcceptableFormat { tried } if *tried == [FourCC::YUYV, FourCC::MJPG]),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_interval_is_best_effort() {
        let mut device = MockDevice::new().without_frame_interval();
        let catalog = FormatCatalog::probe(&mut device);

        let accepted = FormatNegotiator::new(&catalog)
            .resolve(&mut device, &request(None, 320, 240, 30.0), |_| true)
            .expect("negotiation should succeed");
        assert_eq!(accepted.interval, None);
        assert_eq!(accepted.frame_rate(), None);
    }
}
