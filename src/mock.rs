//! Scripted mock device for testing without hardware.
//!
//! Behaves like a small UVC camera: YUYV and MJPG at three sizes, a few
//! controls, and a FIFO buffer queue. Builders inject the failures real
//! drivers produce; every interaction worth asserting on lands in a shared
//! [`MockLog`] that stays readable after the device moves into a session.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::controls::{ControlDescriptor, ControlKind};
use crate::format::{
    Format, FormatDescriptor, FrameInterval, FrameSize, IntervalRange, Resolution, StepwiseSize,
};
use crate::traits::{
    BufferDescriptor, DeviceCapabilities, Dequeued, FourCC, FrameMetadata, IoStrategy, QueueSlot,
    Readiness, VideoDevice,
};

/// Brightness, an integer control in `0..=255`.
pub const BRIGHTNESS: u32 = 0x0098_0900;
/// Contrast, reported but disabled.
pub const DISABLED_CONTROL: u32 = 0x0098_0901;
/// Power line frequency, a menu control.
pub const POWER_LINE: u32 = 0x0098_0918;

const DEFAULT_BUFFER_LIMIT: u32 = 32;

/// What the mock saw.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    pub set_format_calls: Vec<(FourCC, Resolution)>,
    pub control_writes: Vec<(u32, i64)>,
    pub buffer_requests: Vec<(IoStrategy, u32)>,
    pub mapped: Vec<u32>,
    pub unmapped: Vec<u32>,
    pub stream_on: u32,
    pub stream_off: u32,
    pub waits: u32,
    pub closed: bool,
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

/// YUV values of the eight bars: white, yellow, cyan, green, magenta,
/// red, blue, black.
const COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

impl TestPattern {
    /// YUV sample at column `x` of a `width` wide frame.
    fn sample(self, x: usize, width: usize) -> (u8, u8, u8) {
        match self {
            Self::ColorBars => {
                let bar_width = (width / COLOR_BARS.len()).max(1);
                let bar = (x / bar_width).min(COLOR_BARS.len() - 1);
                COLOR_BARS.get(bar).copied().unwrap_or_default()
            }
            Self::Gradient => {
                let luma = (x * 255) / width.max(1);
                (u8::try_from(luma).unwrap_or(u8::MAX), 128, 128)
            }
            Self::Solid(y, u, v) => (y, u, v),
        }
    }
}

/// Render `pattern` as a packed YUYV frame of `format`'s geometry.
pub fn generate_test_frame(format: &Format, pattern: TestPattern) -> Vec<u8> {
    let width = format.width as usize;
    let stride = (width * 2).max(1);
    let mut data = vec![0u8; stride * format.height as usize];

    for row in data.chunks_exact_mut(stride) {
        for (pair, macropixel) in row.chunks_exact_mut(4).enumerate() {
            let (y, u, v) = pattern.sample(pair * 2, width);
            macropixel.copy_from_slice(&[y, u, y, v]);
        }
    }
    data
}

/// Contents of one "mapped" driver buffer.
#[derive(Debug)]
pub struct MockMapping {
    index: u32,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MockMapping {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Mock device for testing without hardware.
#[derive(Debug)]
pub struct MockDevice {
    capabilities: DeviceCapabilities,
    formats: Vec<(FormatDescriptor, Vec<FrameSize>)>,
    intervals: Vec<FrameInterval>,
    enumerate: bool,
    enumerate_intervals: bool,
    accepted: Vec<FourCC>,
    frame_interval_supported: bool,
    format: Format,
    controls: Vec<ControlDescriptor>,
    values: HashMap<u32, i64>,
    pattern: TestPattern,
    buffer_limit: u32,
    granted: u32,
    failing_map: Option<u32>,
    failing_unmap: Option<u32>,
    release_fails: bool,
    failing_stream_on: bool,
    failing_stream_off: bool,
    waits: VecDeque<io::Result<Readiness>>,
    dequeue_errors: VecDeque<i32>,
    rogue_dequeue: Option<u32>,
    lifo: bool,
    short_frames: u32,
    queue: VecDeque<u32>,
    sequence: u32,
    log: Rc<RefCell<MockLog>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        let sizes = |list: &[(u32, u32)]| {
            list.iter()
                .map(|&(width, height)| FrameSize::Discrete(Resolution::new(width, height)))
                .collect::<Vec<_>>()
        };
        let formats = vec![
            (
                FormatDescriptor {
                    fourcc: FourCC::YUYV,
                    description: "YUYV 4:2:2".to_owned(),
                    compressed: false,
                },
                sizes(&[(160, 120), (320, 240), (640, 480)]),
            ),
            (
                FormatDescriptor {
                    fourcc: FourCC::MJPG,
                    description: "Motion-JPEG".to_owned(),
                    compressed: true,
                },
                sizes(&[(320, 240), (640, 480)]),
            ),
        ];
        let controls = vec![
            ControlDescriptor {
                id: BRIGHTNESS,
                name: "Brightness".to_owned(),
                kind: ControlKind::Integer,
                minimum: 0,
                maximum: 255,
                step: 1,
                default: 128,
                disabled: false,
            },
            ControlDescriptor {
                id: DISABLED_CONTROL,
                name: "Contrast".to_owned(),
                kind: ControlKind::Integer,
                minimum: 0,
                maximum: 255,
                step: 1,
                default: 32,
                disabled: true,
            },
            ControlDescriptor {
                id: POWER_LINE,
                name: "Power Line Frequency".to_owned(),
                kind: ControlKind::Menu,
                minimum: 0,
                maximum: 2,
                step: 1,
                default: 1,
                disabled: false,
            },
        ];
        let values = controls
            .iter()
            .map(|control| (control.id, control.default))
            .collect();

        Self {
            capabilities: Self::default_capabilities(),
            accepted: formats.iter().map(|(descriptor, _)| descriptor.fourcc).collect(),
            formats,
            intervals: vec![
                FrameInterval::new(1, 30),
                FrameInterval::new(1, 15),
                FrameInterval::new(1, 5),
            ],
            enumerate: true,
            enumerate_intervals: true,
            frame_interval_supported: true,
            format: Format::new(320, 240, FourCC::YUYV),
            controls,
            values,
            pattern: TestPattern::ColorBars,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            granted: 0,
            failing_map: None,
            failing_unmap: None,
            release_fails: false,
            failing_stream_on: false,
            failing_stream_off: false,
            waits: VecDeque::new(),
            dequeue_errors: VecDeque::new(),
            rogue_dequeue: None,
            lifo: false,
            short_frames: 0,
            queue: VecDeque::new(),
            sequence: 0,
            log: Rc::default(),
        }
    }

    /// Capabilities of a camera supporting every I/O strategy.
    #[must_use]
    pub fn default_capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            driver: "mock".to_owned(),
            card: "Mock Camera".to_owned(),
            bus_info: "mock:0".to_owned(),
            can_capture: true,
            can_stream: true,
            can_read: true,
        }
    }

    /// Shared interaction log.
    #[must_use]
    pub fn log(&self) -> Rc<RefCell<MockLog>> {
        Rc::clone(&self.log)
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Add a format with a single stepwise size range.
    #[must_use]
    pub fn with_stepwise_format(mut self, fourcc: FourCC, range: StepwiseSize) -> Self {
        self.formats.push((
            FormatDescriptor {
                fourcc,
                description: format!("{fourcc} stepwise"),
                compressed: false,
            },
            vec![FrameSize::Stepwise(range)],
        ));
        self.accepted.push(fourcc);
        self
    }

    /// Refuse format and control enumeration.
    #[must_use]
    pub const fn without_enumeration(mut self) -> Self {
        self.enumerate = false;
        self
    }

    /// List formats and sizes but no frame intervals.
    #[must_use]
    pub const fn without_interval_enumeration(mut self) -> Self {
        self.enumerate_intervals = false;
        self
    }

    /// Only these formats are taken as asked; others are substituted with
    /// the first entry. An empty list makes every format request fail.
    #[must_use]
    pub fn with_accepted_formats(mut self, accepted: &[FourCC]) -> Self {
        self.accepted = accepted.to_vec();
        self
    }

    /// Reject frame interval changes.
    #[must_use]
    pub const fn without_frame_interval(mut self) -> Self {
        self.frame_interval_supported = false;
        self
    }

    /// Pattern written into every frame.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Grant at most `limit` buffers.
    #[must_use]
    pub const fn with_buffer_limit(mut self, limit: u32) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Fail to map buffer `index`.
    #[must_use]
    pub const fn with_failing_map(mut self, index: u32) -> Self {
        self.failing_map = Some(index);
        self
    }

    /// Fail to unmap buffer `index`.
    #[must_use]
    pub const fn with_failing_unmap(mut self, index: u32) -> Self {
        self.failing_unmap = Some(index);
        self
    }

    /// Fail `VIDIOC_STREAMON`.
    #[must_use]
    pub const fn with_failing_stream_on(mut self) -> Self {
        self.failing_stream_on = true;
        self
    }

    /// Fail `VIDIOC_STREAMOFF`; queued buffers stay with the device.
    #[must_use]
    pub const fn with_failing_stream_off(mut self) -> Self {
        self.failing_stream_off = true;
        self
    }

    /// Script the outcomes of successive waits; once exhausted every wait
    /// reports ready.
    #[must_use]
    pub fn with_waits<I>(mut self, waits: I) -> Self
    where
        I: IntoIterator<Item = io::Result<Readiness>>,
    {
        self.waits.extend(waits);
        self
    }

    /// Fail the next dequeue with `code`.
    #[must_use]
    pub fn with_dequeue_error(mut self, code: i32) -> Self {
        self.dequeue_errors.push_back(code);
        self
    }

    /// Always report buffer `index` as dequeued, queued or not.
    #[must_use]
    pub const fn with_rogue_dequeue(mut self, index: u32) -> Self {
        self.rogue_dequeue = Some(index);
        self
    }

    /// Return the most recently queued buffer first.
    #[must_use]
    pub const fn with_lifo_dequeue(mut self) -> Self {
        self.lifo = true;
        self
    }

    /// Report the next `count` frames one byte short.
    #[must_use]
    pub const fn with_short_frames(mut self, count: u32) -> Self {
        self.short_frames = count;
        self
    }

    /// Refuse to free the buffer queue.
    pub fn fail_buffer_release(&mut self) {
        self.release_fails = true;
    }

    /// Change a control value behind the caller's back.
    pub fn poke_control(&mut self, id: u32, value: i64) {
        self.values.insert(id, value);
    }

    fn frame(&self) -> Vec<u8> {
        let mut data = generate_test_frame(&self.format, self.pattern);
        data.resize(self.format.size as usize, 0);
        data
    }

    fn sizes(&self, fourcc: FourCC) -> Option<&[FrameSize]> {
        self.formats
            .iter()
            .find(|(descriptor, _)| descriptor.fourcc == fourcc)
            .map(|(_, sizes)| sizes.as_slice())
    }
}

impl VideoDevice for MockDevice {
    type Mapping = MockMapping;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn enum_format(&mut self, index: u32) -> io::Result<Option<FormatDescriptor>> {
        if !self.enumerate {
            return Err(errno(libc::ENOTTY));
        }
        Ok(self
            .formats
            .get(index as usize)
            .map(|(descriptor, _)| descriptor.clone()))
    }

    fn enum_frame_size(&mut self, fourcc: FourCC, index: u32) -> io::Result<Option<FrameSize>> {
        let sizes = self.sizes(fourcc).ok_or_else(|| errno(libc::EINVAL))?;
        Ok(sizes.get(index as usize).copied())
    }

    fn enum_frame_interval(
        &mut self,
        fourcc: FourCC,
        resolution: Resolution,
        index: u32,
    ) -> io::Result<Option<IntervalRange>> {
        let sizes = self.sizes(fourcc).ok_or_else(|| errno(libc::EINVAL))?;
        if !sizes.iter().any(|size| size.contains(resolution)) {
            return Err(errno(libc::EINVAL));
        }
        if !self.enumerate_intervals {
            return Ok(None);
        }
        Ok(self
            .intervals
            .get(index as usize)
            .copied()
            .map(IntervalRange::Discrete))
    }

    fn query_controls(&mut self) -> io::Result<Vec<ControlDescriptor>> {
        if !self.enumerate {
            return Err(errno(libc::ENOTTY));
        }
        Ok(self.controls.clone())
    }

    fn control(&mut self, id: u32) -> io::Result<i64> {
        self.values.get(&id).copied().ok_or_else(|| errno(libc::EINVAL))
    }

    fn set_control(&mut self, id: u32, value: i64) -> io::Result<()> {
        if !self.values.contains_key(&id) {
            return Err(errno(libc::EINVAL));
        }
        self.log.borrow_mut().control_writes.push((id, value));
        self.values.insert(id, value);
        Ok(())
    }

    fn format(&mut self) -> io::Result<Format> {
        Ok(self.format.clone())
    }

    fn set_format(&mut self, fourcc: FourCC, resolution: Resolution) -> io::Result<Format> {
        self.log.borrow_mut().set_format_calls.push((fourcc, resolution));
        let granted = if self.accepted.contains(&fourcc) {
            fourcc
        } else {
            *self.accepted.first().ok_or_else(|| errno(libc::EINVAL))?
        };
        self.format = Format::new(resolution.width, resolution.height, granted);
        Ok(self.format.clone())
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval> {
        if self.frame_interval_supported {
            Ok(interval)
        } else {
            Err(errno(libc::ENOTTY))
        }
    }

    fn request_buffers(&mut self, strategy: IoStrategy, count: u32) -> io::Result<u32> {
        self.log.borrow_mut().buffer_requests.push((strategy, count));
        if count == 0 {
            if self.release_fails {
                return Err(errno(libc::EBUSY));
            }
            self.queue.clear();
            self.granted = 0;
            return Ok(0);
        }
        self.granted = count.min(self.buffer_limit);
        Ok(self.granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        if index >= self.granted {
            return Err(errno(libc::EINVAL));
        }
        Ok(BufferDescriptor {
            index,
            offset: index * self.format.size,
            length: self.format.size as usize,
        })
    }

    fn map(&mut self, descriptor: &BufferDescriptor) -> io::Result<MockMapping> {
        if self.failing_map == Some(descriptor.index) {
            return Err(errno(libc::ENOMEM));
        }
        let mut data = self.frame();
        data.resize(descriptor.length, 0);
        self.log.borrow_mut().mapped.push(descriptor.index);
        Ok(MockMapping {
            index: descriptor.index,
            data,
        })
    }

    fn unmap(&mut self, mapping: MockMapping) -> io::Result<()> {
        self.log.borrow_mut().unmapped.push(mapping.index);
        if self.failing_unmap == Some(mapping.index) {
            return Err(errno(libc::EINVAL));
        }
        Ok(())
    }

    fn queue(&mut self, slot: QueueSlot<'_>) -> io::Result<()> {
        let index = slot.index();
        if index >= self.granted {
            return Err(errno(libc::EINVAL));
        }
        if let QueueSlot::User { memory, .. } = slot {
            let frame = self.frame();
            let len = frame.len().min(memory.len());
            if let (Some(dst), Some(src)) = (memory.get_mut(..len), frame.get(..len)) {
                dst.copy_from_slice(src);
            }
        }
        self.queue.push_back(index);
        Ok(())
    }

    fn dequeue(&mut self, _strategy: IoStrategy) -> io::Result<Dequeued> {
        if let Some(code) = self.dequeue_errors.pop_front() {
            return Err(errno(code));
        }
        let index = match self.rogue_dequeue {
            Some(index) => index,
            None => {
                let next = if self.lifo {
                    self.queue.pop_back()
                } else {
                    self.queue.pop_front()
                };
                next.ok_or_else(|| errno(libc::EAGAIN))?
            }
        };

        let mut bytes_used = self.format.size;
        if self.short_frames > 0 {
            self.short_frames -= 1;
            bytes_used = bytes_used.saturating_sub(1);
        }
        let sequence = self.sequence;
        self.sequence += 1;
        Ok(Dequeued {
            index,
            metadata: FrameMetadata {
                sequence,
                timestamp: Duration::from_millis(u64::from(sequence) * 33),
                bytes_used,
            },
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.failing_stream_on {
            return Err(errno(libc::EIO));
        }
        self.log.borrow_mut().stream_on += 1;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        if self.failing_stream_off {
            return Err(errno(libc::EIO));
        }
        self.log.borrow_mut().stream_off += 1;
        self.queue.clear();
        Ok(())
    }

    fn wait_readable(&mut self, _timeout: Duration) -> io::Result<Readiness> {
        self.log.borrow_mut().waits += 1;
        self.waits.pop_front().unwrap_or(Ok(Readiness::Ready))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let frame = self.frame();
        let len = frame.len().min(buf.len());
        if let (Some(dst), Some(src)) = (buf.get_mut(..len), frame.get(..len)) {
            dst.copy_from_slice(src);
        }
        Ok(len)
    }

    fn close(&mut self) -> io::Result<()> {
        self.log.borrow_mut().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_creation() {
        let device = MockDevice::new();
        assert_eq!(device.capabilities().driver, "mock");
        assert!(device.capabilities().can_capture);
        assert!(device.capabilities().can_stream);
    }

    #[test]
    fn test_mock_device_format() {
        let mut device = MockDevice::new();
        let format = device.format().expect("format should succeed");
        assert_eq!(format.resolution(), Resolution::new(320, 240));

        let actual = device
            .set_format(FourCC::RGB24, Resolution::new(1280, 720))
            .expect("set_format should succeed");
        assert_eq!(actual.resolution(), Resolution::new(1280, 720));
        // Unsupported formats are silently substituted, like real drivers do.
        assert_eq!(actual.fourcc, FourCC::YUYV);
    }

    #[test]
    fn test_mock_queue_round_trip() {
        let mut device = MockDevice::new();
        assert_eq!(
            device
                .request_buffers(IoStrategy::MemoryMap, 2)
                .expect("reqbufs"),
            2
        );
        device.queue(QueueSlot::Mapped { index: 1 }).expect("queue");

        let first = device.dequeue(IoStrategy::MemoryMap).expect("dequeue");
        assert_eq!(first.index, 1);
        assert_eq!(first.metadata.sequence, 0);
        let empty = device
            .dequeue(IoStrategy::MemoryMap)
            .expect_err("nothing queued");
        assert_eq!(empty.raw_os_error(), Some(libc::EAGAIN));
    }

    #[test]
    fn test_color_bars_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::ColorBars);

        assert_eq!(data.len(), 640 * 480 * 2);
        // First bar is white, last bar black.
        assert_eq!(data.first(), Some(&235));
        assert_eq!(data.get(640 * 2 - 4), Some(&16));
    }

    #[test]
    fn test_gradient_pattern() {
        let format = Format::new(640, 480, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Gradient);

        let last_row = data.chunks_exact(640 * 2).last().expect("rows");
        assert!(last_row.first().is_some_and(|&y| y < 10));
        assert!(last_row.get(638 * 2).is_some_and(|&y| y > 200));
    }

    #[test]
    fn test_solid_pattern() {
        let format = Format::new(64, 64, FourCC::YUYV);
        let data = generate_test_frame(&format, TestPattern::Solid(128, 64, 192));

        assert!(data.chunks_exact(4).all(|pixel| pixel == [128, 64, 128, 192]));
    }
}
