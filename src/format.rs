//! Pixel formats, frame geometry and the device format catalog.
//!
//! The catalog is built once per session by walking the device's
//! format, frame size and frame interval enumerations. Stepwise ranges are
//! kept as ranges: a driver advertising `min..=max` in steps of `step` is
//! not guaranteed to accept every size a naive expansion would produce.

use std::cmp::Ordering;
use std::fmt;

use tracing::{debug, warn};

use crate::traits::{FourCC, VideoDevice};

/// Upper bound on enumeration indices, in case a driver never reports the end.
const ENUMERATION_LIMIT: u32 = 1024;

/// Frame interval assumed when a driver cannot enumerate intervals (60 Hz).
const GUESSED_BASE_INTERVAL: FrameInterval = FrameInterval::new(1, 60);

/// Number of guessed intervals, each doubling the previous one.
const GUESSED_INTERVAL_COUNT: u32 = 5;

/// A pixel format as described by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    /// Four-character code.
    pub fourcc: FourCC,
    /// Human readable description from the driver.
    pub description: String,
    /// Whether the payload is compressed.
    pub compressed: bool,
}

/// Width and height of a frame in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Resolution {
    /// Create a resolution.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Whether both dimensions are less than or equal to `limit`'s.
    #[must_use]
    pub const fn fits_within(self, limit: Self) -> bool {
        self.width <= limit.width && self.height <= limit.height
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Seconds per frame as a rational `numerator / denominator`.
///
/// Equality and ordering compare the represented duration by
/// cross-multiplication, so `1/30 == 2/60`.
#[derive(Debug, Clone, Copy)]
pub struct FrameInterval {
    /// Numerator (seconds).
    pub numerator: u32,
    /// Denominator.
    pub denominator: u32,
}

impl FrameInterval {
    /// Create an interval of `numerator / denominator` seconds.
    #[must_use]
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Interval matching a frame rate in frames per second.
    ///
    /// Fractional rates keep three decimals (29.97 becomes 1000/29970).
    #[must_use]
    pub fn from_fps(fps: f32) -> Option<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return None;
        }
        let millis = (f64::from(fps) * 1000.0).round();
        if millis < 1.0 || millis > f64::from(u32::MAX) {
            return None;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = millis as u32;
        Some(Self::new(1000, millis).reduced())
    }

    /// Whether numerator and denominator are both non-zero.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.numerator != 0 && self.denominator != 0
    }

    /// Frames per second.
    #[must_use]
    pub fn fps(self) -> f64 {
        f64::from(self.denominator) / f64::from(self.numerator)
    }

    /// Lowest-terms form of this interval.
    #[must_use]
    pub fn reduced(self) -> Self {
        let divisor = gcd(u64::from(self.numerator), u64::from(self.denominator));
        if divisor <= 1 {
            return self;
        }
        #[allow(clippy::cast_possible_truncation)]
        Self::new(
            (u64::from(self.numerator) / divisor) as u32,
            (u64::from(self.denominator) / divisor) as u32,
        )
    }

    /// Build an interval from wide arithmetic, reducing and range-checking it.
    fn from_wide(numerator: u128, denominator: u128) -> Option<Self> {
        if numerator == 0 || denominator == 0 {
            return None;
        }
        let divisor = gcd_wide(numerator, denominator);
        let numerator = u32::try_from(numerator / divisor).ok()?;
        let denominator = u32::try_from(denominator / divisor).ok()?;
        Some(Self::new(numerator, denominator))
    }
}

impl PartialEq for FrameInterval {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrameInterval {}

impl PartialOrd for FrameInterval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameInterval {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = u64::from(self.numerator) * u64::from(other.denominator);
        let rhs = u64::from(other.numerator) * u64::from(self.denominator);
        lhs.cmp(&rhs)
    }
}

impl fmt::Display for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn gcd_wide(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// A frame size range expressed as `min..=max` in steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepwiseSize {
    /// Minimum width.
    pub min_width: u32,
    /// Maximum width.
    pub max_width: u32,
    /// Width increment (0 or 1 for continuous ranges).
    pub step_width: u32,
    /// Minimum height.
    pub min_height: u32,
    /// Maximum height.
    pub max_height: u32,
    /// Height increment (0 or 1 for continuous ranges).
    pub step_height: u32,
}

impl StepwiseSize {
    /// Whether `resolution` lies on the step grid inside the range.
    #[must_use]
    pub fn contains(&self, resolution: Resolution) -> bool {
        on_grid(resolution.width, self.min_width, self.max_width, self.step_width)
            && on_grid(resolution.height, self.min_height, self.max_height, self.step_height)
    }

    /// Smallest size in the range.
    #[must_use]
    pub const fn smallest(&self) -> Resolution {
        Resolution::new(self.min_width, self.min_height)
    }

    /// Largest size on the step grid.
    #[must_use]
    pub fn largest(&self) -> Resolution {
        Resolution::new(
            snap_down(self.max_width, self.min_width, self.step_width),
            snap_down(self.max_height, self.min_height, self.step_height),
        )
    }

    /// Largest on-grid size not exceeding `limit` in either dimension.
    #[must_use]
    pub fn largest_within(&self, limit: Resolution) -> Option<Resolution> {
        if limit.width < self.min_width || limit.height < self.min_height {
            return None;
        }
        let width = snap_down(limit.width.min(self.max_width), self.min_width, self.step_width);
        let height = snap_down(
            limit.height.min(self.max_height),
            self.min_height,
            self.step_height,
        );
        Some(Resolution::new(width, height))
    }
}

fn on_grid(value: u32, min: u32, max: u32, step: u32) -> bool {
    value >= min && value <= max && (value - min) % step.max(1) == 0
}

fn snap_down(value: u32, min: u32, step: u32) -> u32 {
    let step = step.max(1);
    min + (value.saturating_sub(min) / step) * step
}

/// One entry of a frame size enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    /// A single supported size.
    Discrete(Resolution),
    /// A stepwise or continuous range of sizes.
    Stepwise(StepwiseSize),
}

impl FrameSize {
    /// Whether the entry admits `resolution`.
    #[must_use]
    pub fn contains(&self, resolution: Resolution) -> bool {
        match self {
            Self::Discrete(size) => *size == resolution,
            Self::Stepwise(range) => range.contains(resolution),
        }
    }

    /// The size used to probe frame intervals for this entry.
    #[must_use]
    pub fn representative(&self) -> Resolution {
        match self {
            Self::Discrete(size) => *size,
            Self::Stepwise(range) => range.largest(),
        }
    }
}

/// A frame interval range expressed as `min..=max` in steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepwiseInterval {
    /// Shortest interval (highest rate).
    pub min: FrameInterval,
    /// Longest interval (lowest rate).
    pub max: FrameInterval,
    /// Increment; a zero numerator marks a continuous range.
    pub step: FrameInterval,
}

impl StepwiseInterval {
    /// Whether `interval` lies on the step grid inside the range.
    #[must_use]
    pub fn contains(&self, interval: FrameInterval) -> bool {
        if interval < self.min || interval > self.max {
            return false;
        }
        if !self.step.is_valid() {
            return true;
        }
        // (interval - min) / step must be a whole number.
        let (num, den) = self.offset_in_steps(interval);
        num % den == 0
    }

    /// On-grid intervals bracketing `target` (at most two).
    #[must_use]
    pub fn candidates_near(&self, target: FrameInterval) -> Vec<FrameInterval> {
        let clamped = target.clamp(self.min, self.max);
        if !self.step.is_valid() {
            return vec![clamped];
        }
        let (num, den) = self.offset_in_steps(clamped);
        let below = num / den;
        [below, below + 1]
            .into_iter()
            .filter_map(|k| self.nth(k))
            .filter(|candidate| *candidate <= self.max)
            .collect()
    }

    /// `(interval - min) / step` as a wide fraction `(num, den)`.
    fn offset_in_steps(&self, interval: FrameInterval) -> (u128, u128) {
        let (n, d) = (u128::from(interval.numerator), u128::from(interval.denominator));
        let (min_n, min_d) = (u128::from(self.min.numerator), u128::from(self.min.denominator));
        let (step_n, step_d) = (
            u128::from(self.step.numerator),
            u128::from(self.step.denominator),
        );
        let diff = (n * min_d).saturating_sub(min_n * d);
        (diff * step_d, (d * min_d * step_n).max(1))
    }

    /// The `k`-th interval of the grid, `min + k * step`.
    fn nth(&self, k: u128) -> Option<FrameInterval> {
        let (min_n, min_d) = (u128::from(self.min.numerator), u128::from(self.min.denominator));
        let (step_n, step_d) = (
            u128::from(self.step.numerator),
            u128::from(self.step.denominator),
        );
        FrameInterval::from_wide(min_n * step_d + k * step_n * min_d, min_d * step_d)
    }
}

/// One entry of a frame interval enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalRange {
    /// A single supported interval.
    Discrete(FrameInterval),
    /// A stepwise or continuous range of intervals.
    Stepwise(StepwiseInterval),
}

impl IntervalRange {
    /// Supported intervals closest to `target` within this entry.
    #[must_use]
    pub fn candidates_near(&self, target: FrameInterval) -> Vec<FrameInterval> {
        match self {
            Self::Discrete(interval) => vec![*interval],
            Self::Stepwise(range) => range.candidates_near(target),
        }
    }
}

/// Frame sizes of one format together with the intervals each supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeCapability {
    /// Size entry.
    pub size: FrameSize,
    /// Intervals available at this size.
    pub intervals: Vec<IntervalRange>,
    /// Whether `intervals` were guessed because the driver could not list them.
    pub intervals_guessed: bool,
}

/// Everything the device claims to support for one pixel format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatCapability {
    /// Format description.
    pub descriptor: FormatDescriptor,
    /// Supported sizes in enumeration order.
    pub sizes: Vec<SizeCapability>,
}

impl FormatCapability {
    /// Size entries admitting `resolution`, discrete entries first.
    #[must_use]
    pub fn size_entry(&self, resolution: Resolution) -> Option<&SizeCapability> {
        self.sizes
            .iter()
            .find(|entry| entry.size == FrameSize::Discrete(resolution))
            .or_else(|| self.sizes.iter().find(|entry| entry.size.contains(resolution)))
    }

    /// Intervals listed for `resolution`, if the resolution is listed at all.
    #[must_use]
    pub fn intervals_for(&self, resolution: Resolution) -> Option<&[IntervalRange]> {
        self.size_entry(resolution).map(|entry| entry.intervals.as_slice())
    }
}

/// Immutable map of formats, sizes and intervals the device advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatCatalog {
    formats: Vec<FormatCapability>,
}

impl FormatCatalog {
    /// Build a catalog from already known capabilities.
    #[must_use]
    pub const fn from_formats(formats: Vec<FormatCapability>) -> Self {
        Self { formats }
    }

    /// Walk the device's enumerations and record what it supports.
    ///
    /// Never fails: a device that cannot enumerate yields an empty catalog,
    /// and negotiation then falls back to setting formats blindly.
    pub fn probe<D: VideoDevice>(device: &mut D) -> Self {
        let mut formats = Vec::new();
        for index in 0..ENUMERATION_LIMIT {
            match device.enum_format(index) {
                Ok(Some(descriptor)) => {
                    debug!(
                        fourcc = %descriptor.fourcc,
                        description = %descriptor.description,
                        "found pixel format"
                    );
                    let sizes = Self::probe_sizes(device, descriptor.fourcc);
                    formats.push(FormatCapability { descriptor, sizes });
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(index, error = %err, "pixel format enumeration failed");
                    break;
                }
            }
        }
        if formats.is_empty() {
            warn!("device reported no pixel formats; negotiation will set formats blindly");
        }
        Self { formats }
    }

    fn probe_sizes<D: VideoDevice>(device: &mut D, fourcc: FourCC) -> Vec<SizeCapability> {
        let mut sizes = Vec::new();
        for index in 0..ENUMERATION_LIMIT {
            let size = match device.enum_frame_size(fourcc, index) {
                Ok(Some(size)) => size,
                Ok(None) => break,
                Err(err) => {
                    debug!(%fourcc, index, error = %err, "frame size enumeration failed");
                    break;
                }
            };
            let (intervals, intervals_guessed) =
                Self::probe_intervals(device, fourcc, size.representative());
            debug!(%fourcc, ?size, intervals = intervals.len(), "found frame size");
            sizes.push(SizeCapability {
                size,
                intervals,
                intervals_guessed,
            });
            // A stepwise entry describes the whole range on its own.
            if matches!(size, FrameSize::Stepwise(_)) {
                break;
            }
        }
        sizes
    }

    /// Enumerate the frame intervals for one format and size.
    ///
    /// Returns the intervals and whether they had to be guessed because
    /// the driver lists none.
    pub fn probe_intervals<D: VideoDevice>(
        device: &mut D,
        fourcc: FourCC,
        resolution: Resolution,
    ) -> (Vec<IntervalRange>, bool) {
        let mut intervals = Vec::new();
        for index in 0..ENUMERATION_LIMIT {
            match device.enum_frame_interval(fourcc, resolution, index) {
                Ok(Some(range)) => {
                    let stepwise = matches!(range, IntervalRange::Stepwise(_));
                    intervals.push(range);
                    if stepwise {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(%fourcc, %resolution, error = %err, "frame interval enumeration failed");
                    break;
                }
            }
        }
        intervals.retain(|range| match range {
            IntervalRange::Discrete(interval) => interval.is_valid(),
            IntervalRange::Stepwise(range) => range.min.is_valid() && range.max.is_valid(),
        });
        if intervals.is_empty() {
            warn!(%fourcc, %resolution, "no frame intervals listed; guessing from 60 Hz");
            return (guessed_intervals(), true);
        }
        (intervals, false)
    }

    /// Whether the device listed no formats at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// All formats in enumeration order.
    #[must_use]
    pub fn formats(&self) -> &[FormatCapability] {
        &self.formats
    }

    /// Capabilities of one format.
    #[must_use]
    pub fn get(&self, fourcc: FourCC) -> Option<&FormatCapability> {
        self.formats
            .iter()
            .find(|format| format.descriptor.fourcc == fourcc)
    }

    /// Whether the device listed `fourcc`.
    #[must_use]
    pub fn contains(&self, fourcc: FourCC) -> bool {
        self.get(fourcc).is_some()
    }
}

/// Intervals assumed for a size whose intervals cannot be enumerated.
fn guessed_intervals() -> Vec<IntervalRange> {
    (0..GUESSED_INTERVAL_COUNT)
        .map(|doubling| {
            let interval = FrameInterval::new(
                GUESSED_BASE_INTERVAL.numerator << doubling,
                GUESSED_BASE_INTERVAL.denominator,
            );
            IntervalRange::Discrete(interval.reduced())
        })
        .collect()
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride) of the first plane.
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a new format specification with a tightly packed layout.
    #[must_use]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        Self {
            width,
            height,
            fourcc,
            stride: 0,
            size: 0,
        }
        .sanitized()
    }

    /// Frame size as a [`Resolution`].
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Raise `stride` and `size` to the minimum the geometry requires.
    ///
    /// Some drivers report a zero or too small `bytesperline`/`sizeimage`.
    #[must_use]
    pub const fn sanitized(mut self) -> Self {
        let min_stride = match self.fourcc.bits_per_pixel() {
            Some(bits) => self.width * bits / 8,
            // Compressed payloads have no meaningful stride.
            None => 0,
        };
        if self.stride < min_stride {
            self.stride = min_stride;
        }
        let min_size = if self.fourcc.is_planar_420() {
            self.stride * self.height * 3 / 2
        } else if self.stride == 0 {
            // Worst case for compressed formats, like YUYV.
            self.width * self.height * 2
        } else {
            self.stride * self.height
        };
        if self.size < min_size {
            self.size = min_size;
        }
        self
    }
}
