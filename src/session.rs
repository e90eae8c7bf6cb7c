//! Device session: the capture engine's top-level state machine.
//!
//! ```text
//! Closed -> Opened -> Configured <-> Streaming
//!                        ^             |
//!                        +-- Stopped <-+  (fatal streaming error)
//! ```
//!
//! Opening runs the whole setup sequence (capability check, control and
//! format probing, negotiation, converter selection, buffer allocation) and
//! leaves the session `Configured`. `Opened` only lasts for the duration of
//! that sequence, so [`DeviceSession::state`] never reports it. Closing
//! always runs every teardown step.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::buffer::BufferManager;
use crate::capture::CaptureLoop;
use crate::config::SessionConfig;
use crate::controls::ControlRegistry;
use crate::convert::{ConversionRegistry, Converter, GrayImage, RgbImage};
use crate::device::V4L2Device;
use crate::error::{CaptureError, ErrorKind, Result};
use crate::format::{Format, FormatCatalog, FrameInterval, Resolution};
use crate::negotiate::{Accepted, FormatNegotiator};
use crate::traits::{DeviceCapabilities, FourCC, FrameMetadata, IoStrategy, VideoDevice};

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device handle.
    Closed,
    /// Device handle open, not yet configured.
    ///
    /// Transient: passed through inside [`DeviceSession::with_device`] and
    /// never observable on a constructed session.
    Opened,
    /// Format negotiated and buffers allocated.
    Configured,
    /// Frames are being captured.
    Streaming,
    /// Streaming ended by a fatal error.
    Stopped,
}

/// A converted frame.
#[derive(Debug, Clone)]
pub struct Frame<I = RgbImage> {
    /// Converted image.
    pub image: I,
    /// Sequence, timestamp and payload size of the raw frame.
    pub metadata: FrameMetadata,
}

/// A frame reduced to one luminance channel.
pub type GrayFrame = Frame<GrayImage>;

/// Negotiated setup: format, converter and the buffers sized for it.
struct Setup<M> {
    accepted: Accepted,
    converter: Arc<dyn Converter>,
    buffers: BufferManager<M>,
}

/// Owns one device and everything needed to capture from it.
pub struct DeviceSession<D: VideoDevice> {
    device: D,
    state: SessionState,
    config: SessionConfig,
    registry: ConversionRegistry,
    controls: ControlRegistry,
    catalog: FormatCatalog,
    accepted: Accepted,
    converter: Arc<dyn Converter>,
    buffers: BufferManager<D::Mapping>,
    capture: CaptureLoop,
}

impl DeviceSession<V4L2Device> {
    /// Open the device node named in `config` and configure it.
    pub fn open(config: &SessionConfig, registry: &ConversionRegistry) -> Result<Self> {
        let device = V4L2Device::open(config.device())?;
        Self::with_device(device, config, registry)
    }
}

impl<D: VideoDevice> DeviceSession<D> {
    /// Configure an already opened device.
    ///
    /// Control and format probing are best effort. Negotiation, converter
    /// selection and buffer allocation failures are configuration errors;
    /// the device is closed before they are returned.
    pub fn with_device(mut device: D, config: &SessionConfig, registry: &ConversionRegistry) -> Result<Self> {
        debug!(state = ?SessionState::Opened, device = %config.device().display(), "session opened");
        if let Err(err) = check_capabilities(device.capabilities(), config.io_strategy()) {
            return Err(abort_open(&mut device, err));
        }

        let controls = ControlRegistry::probe(&mut device);
        let catalog = FormatCatalog::probe(&mut device);
        debug!(controls = controls.len(), formats = catalog.formats().len(), "device probed");

        let setup = match configure(&mut device, &catalog, config, registry) {
            Ok(setup) => setup,
            Err(err) => return Err(abort_open(&mut device, err)),
        };

        info!(
            card = %device.capabilities().card,
            fourcc = %setup.accepted.format.fourcc,
            resolution = %setup.accepted.format.resolution(),
            converter = setup.converter.name(),
            buffers = setup.buffers.count(),
            "session configured"
        );
        Ok(Self {
            device,
            state: SessionState::Configured,
            config: config.clone(),
            registry: registry.clone(),
            controls,
            catalog,
            accepted: setup.accepted,
            converter: setup.converter,
            buffers: setup.buffers,
            capture: CaptureLoop::new(config.io_strategy()),
        })
    }

    /// Start capturing. Allowed from `Configured` and `Stopped`.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state("start", &[SessionState::Configured, SessionState::Stopped])?;
        self.capture.start(&mut self.device, &mut self.buffers)?;
        self.state = SessionState::Streaming;
        Ok(())
    }

    /// Wait for, convert and return the next frame.
    ///
    /// Timeouts, interrupted waits and partial frames leave the session
    /// streaming so the caller can simply ask again; fatal errors move it
    /// to `Stopped`.
    pub fn next_frame(&mut self) -> Result<Frame> {
        self.grab(|converter, raw, format, flip| converter.convert(raw, format, flip))
    }

    /// Like [`next_frame`](Self::next_frame), producing a luminance image.
    pub fn next_gray_frame(&mut self) -> Result<GrayFrame> {
        self.grab(|converter, raw, format, flip| converter.convert_gray(raw, format, flip))
    }

    fn grab<I, F>(&mut self, convert: F) -> Result<Frame<I>>
    where
        F: Fn(&dyn Converter, &[u8], &Format, bool) -> Result<I>,
    {
        self.expect_state("next_frame", &[SessionState::Streaming])?;
        let dequeued = self
            .capture
            .wait_frame(
                &mut self.device,
                &mut self.buffers,
                self.config.select_timeout(),
                self.config.select_retries(),
            )
            .map_err(|err| self.note_failure(err))?;

        // Convert before requeueing: the driver may overwrite the buffer
        // as soon as it owns it again.
        let metadata = dequeued.metadata();
        let raw = self.buffers.bytes(dequeued.index()).unwrap_or_default();
        let used = match usize::try_from(metadata.bytes_used) {
            Ok(used) if used > 0 => used.min(raw.len()),
            _ => raw.len(),
        };
        let converted = convert(
            self.converter.as_ref(),
            raw.get(..used).unwrap_or_default(),
            &self.accepted.format,
            self.config.vertical_flip(),
        );

        self.capture
            .requeue(&mut self.device, &mut self.buffers, dequeued)
            .map_err(|err| self.note_failure(err))?;

        match converted {
            Ok(image) => Ok(Frame { image, metadata }),
            Err(err) => {
                warn!(sequence = metadata.sequence, error = %err, "dropping frame");
                Err(err)
            }
        }
    }

    /// Stop capturing. Buffers stay allocated; the session returns to `Configured`.
    pub fn stop(&mut self) -> Result<()> {
        self.expect_state("stop", &[SessionState::Streaming, SessionState::Stopped])?;
        let result = self.capture.stop(&mut self.device, &mut self.buffers);
        self.state = if result.is_ok() {
            SessionState::Configured
        } else {
            SessionState::Stopped
        };
        result
    }

    /// Renegotiate and reallocate with a new configuration.
    ///
    /// Allowed while not streaming. The device node is kept; a different
    /// `device` path in `config` is ignored. On failure the session is left
    /// `Stopped` without buffers and may be reconfigured again.
    pub fn reconfigure(&mut self, config: &SessionConfig) -> Result<()> {
        self.expect_state("reconfigure", &[SessionState::Configured, SessionState::Stopped])?;
        check_capabilities(self.device.capabilities(), config.io_strategy())?;

        self.state = SessionState::Stopped;
        self.buffers.release(&mut self.device)?;
        let setup = configure(&mut self.device, &self.catalog, config, &self.registry)?;

        self.controls.invalidate_all();
        self.accepted = setup.accepted;
        self.converter = setup.converter;
        self.buffers = setup.buffers;
        self.capture = CaptureLoop::new(config.io_strategy());
        self.config = config.clone().with_device(self.config.device());
        self.state = SessionState::Configured;
        info!(
            fourcc = %self.accepted.format.fourcc,
            resolution = %self.accepted.format.resolution(),
            "session reconfigured"
        );
        Ok(())
    }

    /// Close the session, running every teardown step.
    ///
    /// Failures are collected into [`CaptureError::Teardown`]; a failed step
    /// never skips the ones after it.
    pub fn close(mut self) -> Result<()> {
        let errors = self.teardown();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CaptureError::Teardown(errors))
        }
    }

    fn teardown(&mut self) -> Vec<CaptureError> {
        let mut errors = Vec::new();
        if let Err(err) = self.capture.stop(&mut self.device, &mut self.buffers) {
            errors.push(err);
        }
        // Buffers the device refused to give back are only freed after the
        // handle is closed, when the session itself is dropped.
        match self.buffers.release(&mut self.device) {
            Ok(()) => {}
            Err(CaptureError::Release(failures)) => errors.extend(failures),
            Err(err) => errors.push(err),
        }
        if let Err(err) = self.device.close() {
            errors.push(CaptureError::device("close", err));
        }
        self.state = SessionState::Closed;
        info!(failures = errors.len(), "session closed");
        errors
    }

    /// Current value of a device control.
    pub fn control(&mut self, id: u32) -> Result<i64> {
        self.controls.get(&mut self.device, id)
    }

    /// Set a device control; returns the value the device settled on.
    pub fn set_control(&mut self, id: u32, value: i64) -> Result<i64> {
        self.controls.set(&mut self.device, id, value)
    }

    /// Controls found on the device.
    pub const fn controls(&self) -> &ControlRegistry {
        &self.controls
    }

    /// Formats, sizes and intervals the device advertised.
    pub const fn catalog(&self) -> &FormatCatalog {
        &self.catalog
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Configuration the session was set up with.
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Negotiated frame layout.
    pub const fn format(&self) -> &Format {
        &self.accepted.format
    }

    /// Negotiated pixel format.
    pub const fn pixel_format(&self) -> FourCC {
        self.accepted.format.fourcc
    }

    /// Negotiated frame size.
    pub const fn resolution(&self) -> Resolution {
        self.accepted.format.resolution()
    }

    /// Negotiated frame interval, if the device supports setting one.
    pub const fn frame_interval(&self) -> Option<FrameInterval> {
        self.accepted.interval
    }

    /// Negotiated frames per second, if known.
    pub fn frame_rate(&self) -> Option<f64> {
        self.accepted.frame_rate()
    }

    /// Number of live buffers.
    pub fn queue_depth(&self) -> u32 {
        self.buffers.count()
    }

    /// Device capabilities.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.device.capabilities()
    }

    /// Name of the converter in use.
    pub fn converter_name(&self) -> &'static str {
        self.converter.name()
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Record the effect of a capture error on the session state.
    fn note_failure(&mut self, err: CaptureError) -> CaptureError {
        if err.kind() == ErrorKind::Fatal && !self.capture.is_streaming() {
            self.state = SessionState::Stopped;
        }
        err
    }
}

impl<D: VideoDevice> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        for err in self.teardown() {
            warn!(error = %err, "teardown on drop failed");
        }
    }
}

/// Check that the device can capture with `strategy`.
fn check_capabilities(capabilities: &DeviceCapabilities, strategy: IoStrategy) -> Result<()> {
    if !capabilities.can_capture {
        return Err(CaptureError::MissingCapability("video capture"));
    }
    let supported = match strategy {
        IoStrategy::Read => capabilities.can_read,
        IoStrategy::MemoryMap | IoStrategy::UserPointer => capabilities.can_stream,
    };
    if supported {
        Ok(())
    } else {
        Err(CaptureError::StrategyNotSupported(strategy))
    }
}

/// Negotiate a format, pick its converter and allocate buffers for it.
fn configure<D: VideoDevice>(
    device: &mut D,
    catalog: &FormatCatalog,
    config: &SessionConfig,
    registry: &ConversionRegistry,
) -> Result<Setup<D::Mapping>> {
    let accepted = FormatNegotiator::new(catalog).resolve(device, &config.format_request(), |fourcc| {
        registry.supports(fourcc)
    })?;
    let converter = registry
        .lookup(accepted.format.fourcc)
        .ok_or(CaptureError::NoConverter(accepted.format.fourcc))?;

    let frame_size = (accepted.format.size as usize).max(converter.expected_len(&accepted.format));
    let mut buffers = BufferManager::new();
    buffers.allocate(device, config.io_strategy(), config.buffer_count(), frame_size)?;
    Ok(Setup {
        accepted,
        converter,
        buffers,
    })
}

/// Close the device after a failed open and hand back the error.
fn abort_open<D: VideoDevice>(device: &mut D, err: CaptureError) -> CaptureError {
    warn!(error = %err, "session setup failed");
    if let Err(close_err) = device.close() {
        warn!(error = %close_err, "closing device after failed setup");
    }
    err
}
