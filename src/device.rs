//! V4L2 device implementation using the v4l crate.
//!
//! Probing, formats and controls go through the crate's safe wrappers.
//! The buffer queue is driven with raw ioctls because buffers are owned by
//! [`BufferManager`](crate::buffer::BufferManager), not by a v4l stream.
#![allow(unsafe_code)]

use std::ffi::c_void;
use std::io;
use std::mem;
use std::os::raw::{c_int, c_ulong};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{self, Control, Value};
use v4l::format::description::Flags as DescriptionFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::memory::Memory;
use v4l::parameters::Capabilities as ParameterCapabilities;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, Fraction};

use crate::controls::{ControlDescriptor, ControlKind};
use crate::error::{CaptureError, Result};
use crate::format::{
    Format, FormatDescriptor, FrameInterval, FrameSize, IntervalRange, Resolution, StepwiseInterval,
    StepwiseSize,
};
use crate::traits::{
    BufferDescriptor, DeviceCapabilities, Dequeued, FourCC, FrameMetadata, IoStrategy, QueueSlot,
    Readiness, VideoDevice,
};

const BUF_TYPE: u32 = Type::VideoCapture as u32;

const fn memory(strategy: IoStrategy) -> u32 {
    match strategy {
        IoStrategy::UserPointer => Memory::UserPtr as u32,
        IoStrategy::MemoryMap | IoStrategy::Read => Memory::Mmap as u32,
    }
}

/// A driver buffer mapped into the process.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    index: u32,
}

impl MappedRegion {
    /// Buffer index in the driver queue.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    fn unmap(self) -> io::Result<()> {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once;
        // forgetting the region below keeps Drop from unmapping again.
        let result = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) };
        mem::forget(self);
        result
    }
}

impl AsRef<[u8]> for MappedRegion {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: the mapping stays valid for `len` bytes until unmapped,
        // which consumes the region.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: see `unmap`; only reached when `unmap` was not called.
        if let Err(err) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } {
            warn!(index = self.index, error = %err, "munmap on drop failed");
        }
    }
}

/// Per-index view over an enumeration the v4l crate returns in one go.
///
/// Index 0 refetches, so every walk sees fresh driver state.
#[derive(Debug)]
struct Enumeration<K, T> {
    key: Option<K>,
    items: Vec<T>,
}

impl<K, T> Default for Enumeration<K, T> {
    fn default() -> Self {
        Self {
            key: None,
            items: Vec::new(),
        }
    }
}

impl<K: PartialEq, T: Clone> Enumeration<K, T> {
    fn get<F>(&mut self, key: K, index: u32, fetch: F) -> io::Result<Option<T>>
    where
        F: FnOnce() -> io::Result<Vec<T>>,
    {
        if index == 0 || self.key.as_ref() != Some(&key) {
            self.items = fetch()?;
            self.key = Some(key);
        }
        Ok(usize::try_from(index)
            .ok()
            .and_then(|position| self.items.get(position))
            .cloned())
    }
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Option<Device>,
    capabilities: DeviceCapabilities,
    formats: Enumeration<(), FormatDescriptor>,
    sizes: Enumeration<FourCC, FrameSize>,
    intervals: Enumeration<(FourCC, Resolution), IntervalRange>,
}

impl V4L2Device {
    /// Open a V4L2 device node (e.g. `/dev/video0`).
    pub fn open(path: &Path) -> Result<Self> {
        let device = Device::with_path(path)
            .map_err(|err| CaptureError::DeviceOpenFailed(format!("{}: {err}", path.display())))?;

        let caps = device
            .query_caps()
            .map_err(|err| CaptureError::DeviceOpenFailed(format!("{}: {err}", path.display())))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(v4l::capability::Flags::STREAMING),
            can_read: caps.capabilities.contains(v4l::capability::Flags::READ_WRITE),
        };
        debug!(path = %path.display(), card = %capabilities.card, "opened device");

        Ok(Self {
            device: Some(device),
            capabilities,
            formats: Enumeration::default(),
            sizes: Enumeration::default(),
            intervals: Enumeration::default(),
        })
    }

    fn device(&self) -> io::Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn fd(&self) -> io::Result<c_int> {
        Ok(self.device()?.handle().fd())
    }

    /// Issue `request` with `arg` as its argument.
    fn ioctl<T>(&self, request: v4l2::vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
        let fd = self.fd()?;
        // SAFETY: `arg` is the argument struct `request` expects and lives
        // for the duration of the call.
        unsafe { v4l2::ioctl(fd, request, ptr::from_mut(arg).cast::<c_void>()) }
    }

    fn buffer(index: u32, strategy: IoStrategy) -> v4l2_buffer {
        // SAFETY: v4l2_buffer is a plain C struct; all-zero is a valid value.
        let mut buffer: v4l2_buffer = unsafe { mem::zeroed() };
        buffer.index = index;
        buffer.type_ = BUF_TYPE;
        buffer.memory = memory(strategy);
        buffer
    }

    fn fetch_formats(device: &Device) -> io::Result<Vec<FormatDescriptor>> {
        Ok(device
            .enum_formats()?
            .into_iter()
            .map(|description| FormatDescriptor {
                fourcc: description.fourcc.into(),
                description: description.description,
                compressed: description.flags.contains(DescriptionFlags::COMPRESSED),
            })
            .collect())
    }

    fn fetch_sizes(device: &Device, fourcc: FourCC) -> io::Result<Vec<FrameSize>> {
        Ok(device
            .enum_framesizes(fourcc.into())?
            .into_iter()
            .map(|size| match size.size {
                FrameSizeEnum::Discrete(discrete) => {
                    FrameSize::Discrete(Resolution::new(discrete.width, discrete.height))
                }
                FrameSizeEnum::Stepwise(stepwise) => FrameSize::Stepwise(StepwiseSize {
                    min_width: stepwise.min_width,
                    max_width: stepwise.max_width,
                    step_width: stepwise.step_width,
                    min_height: stepwise.min_height,
                    max_height: stepwise.max_height,
                    step_height: stepwise.step_height,
                }),
            })
            .collect())
    }

    fn fetch_intervals(
        device: &Device,
        fourcc: FourCC,
        resolution: Resolution,
    ) -> io::Result<Vec<IntervalRange>> {
        let fraction = |f: Fraction| FrameInterval::new(f.numerator, f.denominator);
        Ok(device
            .enum_frameintervals(fourcc.into(), resolution.width, resolution.height)?
            .into_iter()
            .map(|interval| match interval.interval {
                FrameIntervalEnum::Discrete(discrete) => IntervalRange::Discrete(fraction(discrete)),
                FrameIntervalEnum::Stepwise(stepwise) => IntervalRange::Stepwise(StepwiseInterval {
                    min: fraction(stepwise.min),
                    max: fraction(stepwise.max),
                    step: fraction(stepwise.step),
                }),
            })
            .collect())
    }
}

fn convert_format(format: &v4l::Format) -> Format {
    Format {
        width: format.width,
        height: format.height,
        fourcc: FourCC::from(format.fourcc),
        stride: format.stride,
        size: format.size,
    }
}

const fn control_kind(typ: control::Type) -> ControlKind {
    match typ {
        control::Type::Integer | control::Type::Integer64 => ControlKind::Integer,
        control::Type::Boolean => ControlKind::Boolean,
        control::Type::Menu | control::Type::IntegerMenu => ControlKind::Menu,
        _ => ControlKind::Other,
    }
}

impl VideoDevice for V4L2Device {
    type Mapping = MappedRegion;

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn enum_format(&mut self, index: u32) -> io::Result<Option<FormatDescriptor>> {
        let device = self.device.as_ref().ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        self.formats.get((), index, || Self::fetch_formats(device))
    }

    fn enum_frame_size(&mut self, fourcc: FourCC, index: u32) -> io::Result<Option<FrameSize>> {
        let device = self.device.as_ref().ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        self.sizes.get(fourcc, index, || Self::fetch_sizes(device, fourcc))
    }

    fn enum_frame_interval(
        &mut self,
        fourcc: FourCC,
        resolution: Resolution,
        index: u32,
    ) -> io::Result<Option<IntervalRange>> {
        let device = self.device.as_ref().ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        self.intervals.get((fourcc, resolution), index, || {
            Self::fetch_intervals(device, fourcc, resolution)
        })
    }

    fn query_controls(&mut self) -> io::Result<Vec<ControlDescriptor>> {
        let device = self.device()?;
        // The v4l crate panics on control types it does not know.
        let descriptions = panic::catch_unwind(AssertUnwindSafe(|| device.query_controls()))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "unsupported control type"))??;

        Ok(descriptions
            .into_iter()
            .map(|description| ControlDescriptor {
                id: description.id,
                kind: control_kind(description.typ),
                disabled: description.flags.contains(control::Flags::DISABLED),
                name: description.name,
                minimum: description.minimum,
                maximum: description.maximum,
                step: description.step,
                default: description.default,
            })
            .collect())
    }

    fn control(&mut self, id: u32) -> io::Result<i64> {
        match self.device()?.control(id)?.value {
            Value::Integer(value) => Ok(value),
            Value::Boolean(value) => Ok(i64::from(value)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control {id:#x} has non-integer value {other:?}"),
            )),
        }
    }

    fn set_control(&mut self, id: u32, value: i64) -> io::Result<()> {
        self.device()?.set_control(Control {
            id,
            value: Value::Integer(value),
        })
    }

    fn format(&mut self) -> io::Result<Format> {
        Ok(convert_format(&Capture::format(self.device()?)?))
    }

    fn set_format(&mut self, fourcc: FourCC, resolution: Resolution) -> io::Result<Format> {
        let device = self.device()?;
        let mut format = Capture::format(device)?;
        format.width = resolution.width;
        format.height = resolution.height;
        format.fourcc = fourcc.into();
        Ok(convert_format(&Capture::set_format(device, &format)?))
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval> {
        let device = self.device()?;
        let mut params = device.params()?;
        if !params.capabilities.contains(ParameterCapabilities::TIME_PER_FRAME) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "device does not support setting the frame interval",
            ));
        }
        params.interval = Fraction::new(interval.numerator, interval.denominator);
        let params = device.set_params(&params)?;
        Ok(FrameInterval::new(params.interval.numerator, params.interval.denominator))
    }

    fn request_buffers(&mut self, strategy: IoStrategy, count: u32) -> io::Result<u32> {
        // SAFETY: plain C struct; all-zero is a valid value.
        let mut request: v4l2_requestbuffers = unsafe { mem::zeroed() };
        request.count = count;
        request.type_ = BUF_TYPE;
        request.memory = memory(strategy);
        self.ioctl(v4l2::vidioc::VIDIOC_REQBUFS, &mut request)?;
        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        let mut buffer = Self::buffer(index, IoStrategy::MemoryMap);
        self.ioctl(v4l2::vidioc::VIDIOC_QUERYBUF, &mut buffer)?;
        Ok(BufferDescriptor {
            index,
            // SAFETY: the driver fills `offset` for memory-mapped buffers.
            offset: unsafe { buffer.m.offset },
            length: buffer.length as usize,
        })
    }

    fn map(&mut self, descriptor: &BufferDescriptor) -> io::Result<MappedRegion> {
        let fd = self.fd()?;
        let offset = libc::off_t::try_from(descriptor.offset)
            .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
        // SAFETY: maps a driver buffer described by VIDIOC_QUERYBUF.
        let ptr = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                descriptor.length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )?
        };
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        Ok(MappedRegion {
            ptr,
            len: descriptor.length,
            index: descriptor.index,
        })
    }

    fn unmap(&mut self, mapping: MappedRegion) -> io::Result<()> {
        mapping.unmap()
    }

    fn queue(&mut self, slot: QueueSlot<'_>) -> io::Result<()> {
        let mut buffer = match slot {
            QueueSlot::Mapped { index } => Self::buffer(index, IoStrategy::MemoryMap),
            QueueSlot::User { index, memory } => {
                let mut buffer = Self::buffer(index, IoStrategy::UserPointer);
                buffer.m.userptr = memory.as_mut_ptr() as c_ulong;
                buffer.length = u32::try_from(memory.len())
                    .map_err(|_| io::Error::from_raw_os_error(libc::EOVERFLOW))?;
                buffer
            }
        };
        self.ioctl(v4l2::vidioc::VIDIOC_QBUF, &mut buffer)
    }

    fn dequeue(&mut self, strategy: IoStrategy) -> io::Result<Dequeued> {
        let mut buffer = Self::buffer(0, strategy);
        self.ioctl(v4l2::vidioc::VIDIOC_DQBUF, &mut buffer)?;

        // V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = buffer.timestamp.tv_sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (buffer.timestamp.tv_usec.max(0) as u32).saturating_mul(1000);

        Ok(Dequeued {
            index: buffer.index,
            metadata: FrameMetadata {
                sequence: buffer.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: buffer.bytesused,
            },
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        let mut typ = BUF_TYPE;
        self.ioctl(v4l2::vidioc::VIDIOC_STREAMON, &mut typ)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        let mut typ = BUF_TYPE;
        self.ioctl(v4l2::vidioc::VIDIOC_STREAMOFF, &mut typ)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        match self.device()?.handle().poll(libc::POLLIN, millis) {
            Ok(0) => Ok(Readiness::TimedOut),
            Ok(_) => Ok(Readiness::Ready),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(Readiness::Interrupted),
            Err(err) => Err(err),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd()?;
        // SAFETY: writes at most `buf.len()` bytes into `buf`.
        let read = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<c_void>(), buf.len()) };
        usize::try_from(read).map_err(|_| io::Error::last_os_error())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.device.take().is_some() {
            debug!(card = %self.capabilities.card, "closed device");
        }
        Ok(())
    }
}
