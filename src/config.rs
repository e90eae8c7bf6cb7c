//! Session configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::format::Resolution;
use crate::negotiate::FormatRequest;
use crate::traits::{FourCC, IoStrategy};

/// Everything [`DeviceSession`](crate::session::DeviceSession) needs to open
/// and configure a device.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    device: PathBuf,
    pixel_format: Option<FourCC>,
    resolution: Resolution,
    frame_rate: f32,
    io_strategy: IoStrategy,
    buffer_count: u32,
    select_timeout: Duration,
    select_retries: u32,
    vertical_flip: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            pixel_format: None,
            resolution: Resolution::new(320, 240),
            frame_rate: 30.0,
            io_strategy: IoStrategy::MemoryMap,
            buffer_count: 4,
            select_timeout: Duration::from_secs(2),
            select_retries: 5,
            vertical_flip: false,
        }
    }
}

impl SessionConfig {
    /// Set the device node (e.g. `/dev/video0`).
    #[must_use]
    pub fn with_device<P: Into<PathBuf>>(mut self, device: P) -> Self {
        self.device = device.into();
        self
    }

    /// Request a pixel format; `None` selects one automatically.
    #[must_use]
    pub const fn with_pixel_format(mut self, pixel_format: Option<FourCC>) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    /// Set the requested frame size.
    #[must_use]
    pub const fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    /// Set the requested frames per second.
    #[must_use]
    pub const fn with_frame_rate(mut self, frame_rate: f32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Set the buffering strategy.
    #[must_use]
    pub const fn with_io_strategy(mut self, io_strategy: IoStrategy) -> Self {
        self.io_strategy = io_strategy;
        self
    }

    /// Set the requested queue depth for streaming strategies.
    #[must_use]
    pub const fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Set how long a single wait for a frame may block.
    #[must_use]
    pub const fn with_select_timeout(mut self, select_timeout: Duration) -> Self {
        self.select_timeout = select_timeout;
        self
    }

    /// Set how many timed-out waits end a frame request.
    #[must_use]
    pub const fn with_select_retries(mut self, select_retries: u32) -> Self {
        self.select_retries = select_retries;
        self
    }

    /// Flip converted frames vertically.
    #[must_use]
    pub const fn with_vertical_flip(mut self, vertical_flip: bool) -> Self {
        self.vertical_flip = vertical_flip;
        self
    }

    // Getters

    /// Device node.
    #[must_use]
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Requested pixel format.
    #[must_use]
    pub const fn pixel_format(&self) -> Option<FourCC> {
        self.pixel_format
    }

    /// Requested frame size.
    #[must_use]
    pub const fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Requested frames per second.
    #[must_use]
    pub const fn frame_rate(&self) -> f32 {
        self.frame_rate
    }

    /// Buffering strategy.
    #[must_use]
    pub const fn io_strategy(&self) -> IoStrategy {
        self.io_strategy
    }

    /// Requested queue depth.
    #[must_use]
    pub const fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    /// Per-wait timeout.
    #[must_use]
    pub const fn select_timeout(&self) -> Duration {
        self.select_timeout
    }

    /// Timed-out waits allowed per frame.
    #[must_use]
    pub const fn select_retries(&self) -> u32 {
        self.select_retries
    }

    /// Whether frames are flipped vertically.
    #[must_use]
    pub const fn vertical_flip(&self) -> bool {
        self.vertical_flip
    }

    /// Format negotiation request derived from this configuration.
    #[must_use]
    pub const fn format_request(&self) -> FormatRequest {
        FormatRequest {
            pixel_format: self.pixel_format,
            resolution: self.resolution,
            frame_rate: self.frame_rate,
        }
    }
}
