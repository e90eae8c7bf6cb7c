//! Camgrab: a V4L2 video capture library.
//!
//! A [`DeviceSession`] opens a capture device, negotiates the closest
//! supported pixel format, resolution and frame rate, sets up a buffer queue
//! with one of three I/O strategies and hands out frames converted to RGB or
//! greyscale images.
//!
//! Device access sits behind the [`VideoDevice`] trait, so everything above
//! the kernel interface runs against mock devices in tests.

pub mod buffer;
pub mod capture;
pub mod config;
pub mod controls;
pub mod convert;
pub mod device;
pub mod error;
pub mod format;
pub mod negotiate;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(test)]
mod mock;

pub use config::SessionConfig;
pub use controls::{Control, ControlDescriptor, ControlKind, ControlRegistry};
pub use convert::{ConversionRegistry, Converter, GrayImage, RgbImage};
pub use device::V4L2Device;
pub use error::{CaptureError, ErrorKind, Result};
pub use format::{Format, FormatCatalog, FrameInterval, Resolution};
pub use session::{DeviceSession, Frame, GrayFrame, SessionState};
pub use traits::{DeviceCapabilities, FourCC, FrameMetadata, IoStrategy, VideoDevice};
