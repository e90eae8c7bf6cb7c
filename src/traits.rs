//! Core traits and types for the V4L2 device primitive surface.
//!
//! Everything above this layer (catalog, negotiation, buffers, capture loop)
//! talks to a camera only through [`VideoDevice`], so the whole engine can be
//! driven by real hardware or by a scripted mock.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::controls::ControlDescriptor;
use crate::format::{FormatDescriptor, Format, FrameInterval, FrameSize, IntervalRange, Resolution};

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// YVYU pixel format (4:2:2 packed, V before U).
    pub const YVYU: Self = Self::new(b"YVYU");
    /// Planar YUV 4:2:0 (I420).
    pub const YUV420: Self = Self::new(b"YU12");
    /// Planar YVU 4:2:0 (YV12).
    pub const YVU420: Self = Self::new(b"YV12");
    /// Semi-planar Y/CbCr 4:2:0.
    pub const NV12: Self = Self::new(b"NV12");
    /// Semi-planar Y/CrCb 4:2:0.
    pub const NV21: Self = Self::new(b"NV21");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB24: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR24: Self = Self::new(b"BGR3");
    /// 32-bit xRGB.
    pub const RGB32: Self = Self::new(b"RGB4");
    /// 32-bit BGRx.
    pub const BGR32: Self = Self::new(b"BGR4");
    /// 16-bit RGB 5-6-5, little endian.
    pub const RGB565: Self = Self::new(b"RGBP");
    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// 16-bit greyscale, little endian.
    pub const Y16: Self = Self::new(b"Y16 ");
    /// 8-bit Bayer, BGGR order.
    pub const SBGGR8: Self = Self::new(b"BA81");
    /// 8-bit Bayer, GBRG order.
    pub const SGBRG8: Self = Self::new(b"GBRG");
    /// 8-bit Bayer, GRBG order.
    pub const SGRBG8: Self = Self::new(b"GRBG");
    /// 8-bit Bayer, RGGB order.
    pub const SRGGB8: Self = Self::new(b"RGGB");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// JFIF JPEG.
    pub const JPEG: Self = Self::new(b"JPEG");

    /// Little-endian `u32` code as used by the kernel API.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Bits per pixel of the first plane for uncompressed formats.
    ///
    /// Planar 4:2:0 formats report 8 (the luma plane); use
    /// [`FourCC::is_planar_420`] to account for the chroma planes.
    #[must_use]
    pub const fn bits_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"GREY" | b"BA81" | b"GBRG" | b"GRBG" | b"RGGB" | b"YU12" | b"YV12" | b"NV12"
            | b"NV21" => Some(8),
            b"YUYV" | b"UYVY" | b"YVYU" | b"RGBP" | b"Y16 " => Some(16),
            b"RGB3" | b"BGR3" => Some(24),
            b"RGB4" | b"BGR4" => Some(32),
            _ => None,
        }
    }

    /// Whether this is a 4:2:0 planar or semi-planar format.
    #[must_use]
    pub const fn is_planar_420(self) -> bool {
        matches!(&self.0, b"YU12" | b"YV12" | b"NV12" | b"NV21")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{s}"),
            Err(_) => write!(f, "0x{:08x}", self.to_u32()),
        }
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
    /// Whether the device supports `read()` I/O.
    pub can_read: bool,
}

/// Buffering strategy used to move frames out of the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStrategy {
    /// Blocking `read()` into one process-owned buffer.
    Read,
    /// Driver buffers mapped into the process.
    MemoryMap,
    /// Process-allocated buffers lent to the driver.
    UserPointer,
}

impl IoStrategy {
    /// Whether this strategy uses the driver's buffer queue.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::MemoryMap | Self::UserPointer)
    }
}

/// Outcome of waiting for the device to become readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A frame is ready.
    Ready,
    /// Nothing arrived within the timeout.
    TimedOut,
    /// The wait was interrupted by a signal.
    Interrupted,
}

/// Location of one driver buffer, as reported by a buffer query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Buffer index in the driver queue.
    pub index: u32,
    /// Offset to pass to `mmap`.
    pub offset: u32,
    /// Buffer length in bytes.
    pub length: usize,
}

/// A buffer handed to the driver for filling.
#[derive(Debug)]
pub enum QueueSlot<'a> {
    /// A memory-mapped buffer, identified by index.
    Mapped {
        /// Buffer index.
        index: u32,
    },
    /// A process-owned buffer lent to the driver.
    ///
    /// The driver keeps writing into `memory` until the buffer is dequeued;
    /// callers must not touch or free it in the meantime.
    User {
        /// Buffer index.
        index: u32,
        /// Backing memory.
        memory: &'a mut [u8],
    },
}

impl QueueSlot<'_> {
    /// Index of the buffer being queued.
    #[must_use]
    pub const fn index(&self) -> u32 {
        match self {
            Self::Mapped { index } | Self::User { index, .. } => *index,
        }
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A filled buffer reclaimed from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    /// Buffer index.
    pub index: u32,
    /// Frame metadata reported by the driver.
    pub metadata: FrameMetadata,
}

/// Primitive operations a video capture device must provide.
///
/// Each method corresponds to one kernel request. Enumeration methods
/// return `Ok(None)` once the index runs past the last entry; an `Err`
/// means the device cannot enumerate at all or failed doing so.
pub trait VideoDevice {
    /// Memory mapping of one driver buffer.
    type Mapping: AsRef<[u8]>;

    /// Get device capabilities.
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Describe the pixel format at `index`.
    fn enum_format(&mut self, index: u32) -> io::Result<Option<FormatDescriptor>>;

    /// Describe the frame size entry at `index` for `fourcc`.
    fn enum_frame_size(&mut self, fourcc: FourCC, index: u32) -> io::Result<Option<FrameSize>>;

    /// Describe the frame interval entry at `index` for a format and size.
    fn enum_frame_interval(
        &mut self,
        fourcc: FourCC,
        resolution: Resolution,
        index: u32,
    ) -> io::Result<Option<IntervalRange>>;

    /// List every control the device exposes.
    fn query_controls(&mut self) -> io::Result<Vec<ControlDescriptor>>;

    /// Read the current value of a control.
    fn control(&mut self, id: u32) -> io::Result<i64>;

    /// Write a control value.
    fn set_control(&mut self, id: u32, value: i64) -> io::Result<()>;

    /// Get current format.
    fn format(&mut self) -> io::Result<Format>;

    /// Set capture format. Returns the actual format set by the driver.
    fn set_format(&mut self, fourcc: FourCC, resolution: Resolution) -> io::Result<Format>;

    /// Set the frame interval. Returns the interval the driver settled on.
    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval>;

    /// Ask the driver for `count` buffers. Returns the granted count;
    /// a count of zero frees the driver-side queue.
    fn request_buffers(&mut self, strategy: IoStrategy, count: u32) -> io::Result<u32>;

    /// Query offset and length of a memory-mapped buffer.
    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor>;

    /// Map a driver buffer into the process.
    fn map(&mut self, descriptor: &BufferDescriptor) -> io::Result<Self::Mapping>;

    /// Unmap a driver buffer. The mapping is gone afterwards even on error.
    fn unmap(&mut self, mapping: Self::Mapping) -> io::Result<()>;

    /// Hand a buffer to the driver for filling.
    fn queue(&mut self, slot: QueueSlot<'_>) -> io::Result<()>;

    /// Reclaim a filled buffer from the driver.
    fn dequeue(&mut self, strategy: IoStrategy) -> io::Result<Dequeued>;

    /// Start streaming.
    fn stream_on(&mut self) -> io::Result<()>;

    /// Stop streaming; the driver gives back every queued buffer.
    fn stream_off(&mut self) -> io::Result<()>;

    /// Block until the device is readable or `timeout` elapses.
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness>;

    /// Read one frame directly into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Close the device handle.
    fn close(&mut self) -> io::Result<()>;
}
