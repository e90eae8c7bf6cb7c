//! Error taxonomy for capture sessions.

use std::io;

use crate::session::SessionState;
use crate::traits::{FourCC, IoStrategy};

/// Coarse classification of a [`CaptureError`].
///
/// Callers building resilient capture loops branch on this instead of
/// matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal, non-retryable setup failure surfaced by `open()`.
    Configuration,
    /// The wait budget was exhausted without data.
    Timeout,
    /// Interrupted waits that outlasted the retry bound.
    Transient,
    /// A frame shorter than the negotiated layout; the frame is dropped.
    PartialFrame,
    /// Device failure that takes the session out of streaming.
    Fatal,
    /// The caller broke an API contract (wrong state, buffer not requeued).
    Usage,
}

/// Error type for capture operations.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Failed to open the device node.
    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),
    /// The device lacks a capability the session needs.
    #[error("device does not support {0}")]
    MissingCapability(&'static str),
    /// The selected I/O strategy is not available on this device.
    #[error("I/O strategy {0:?} not supported by device")]
    StrategyNotSupported(IoStrategy),
    /// Every attempted (format, resolution) pair was rejected.
    #[error("no acceptable pixel format (tried {tried:?})")]
    NoAcceptableFormat {
        /// Formats that were actually tried against the device.
        tried: Vec<FourCC>,
    },
    /// The driver granted fewer buffers than the minimum viable depth.
    #[error("device granted {granted} buffers, at least {minimum} required")]
    InsufficientBuffers {
        /// Buffers granted by the driver.
        granted: u32,
        /// Minimum viable queue depth.
        minimum: u32,
    },
    /// No converter is registered for the negotiated pixel format.
    #[error("no converter registered for pixel format {0}")]
    NoConverter(FourCC),
    /// The wait primitive timed out on every attempt.
    #[error("no frame after {attempts} wait attempts")]
    Timeout {
        /// Number of timed-out attempts.
        attempts: u32,
    },
    /// The wait primitive kept getting interrupted.
    #[error("wait interrupted {retries} times in a row")]
    Interrupted {
        /// Number of interrupted attempts.
        retries: u32,
    },
    /// The device delivered fewer bytes than the frame layout requires.
    #[error("partial frame: expected {expected} bytes, got {actual}")]
    PartialFrame {
        /// Bytes required by the negotiated layout.
        expected: usize,
        /// Bytes delivered by the device.
        actual: usize,
    },
    /// Compressed payload could not be decoded.
    #[error("corrupt frame: {0}")]
    CorruptFrame(String),
    /// A device primitive failed.
    #[error("{op} failed: {source}")]
    Device {
        /// Name of the failed primitive.
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Unmapping or freeing one buffer failed.
    #[error("releasing buffer {index} failed: {source}")]
    BufferRelease {
        /// Index of the buffer that could not be released.
        index: u32,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
    /// Buffers are still owned by the device and cannot be released.
    #[error("device still owns {queued} buffer(s)")]
    BuffersInUse {
        /// Buffers the device has not handed back.
        queued: u32,
    },
    /// Several release steps failed; all others still ran.
    #[error("buffer release failed for {} buffer(s)", .0.len())]
    Release(Vec<CaptureError>),
    /// Several teardown steps failed; teardown still completed.
    #[error("close finished with {} error(s)", .0.len())]
    Teardown(Vec<CaptureError>),
    /// Operation is not valid in the current session state.
    #[error("{operation} not allowed in state {state:?}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },
    /// A buffer index outside the allocated pool.
    #[error("buffer index {index} out of range (pool of {count})")]
    BufferOutOfRange {
        /// Offending index.
        index: u32,
        /// Number of allocated buffers.
        count: u32,
    },
    /// Enqueue requested for a buffer the device still owns.
    #[error("buffer {0} is already owned by the device")]
    BufferAlreadyQueued(u32),
    /// The device returned a buffer it did not own.
    #[error("device returned buffer {0} which was not queued")]
    BufferNotQueued(u32),
    /// No control with this id was found at probe time.
    #[error("unknown control {0:#010x}")]
    UnknownControl(u32),
    /// A control value outside the range the device advertises.
    #[error("value {value} out of range for control {id:#010x} ({minimum}..={maximum}, step {step})")]
    ControlOutOfRange {
        /// Control id.
        id: u32,
        /// Rejected value.
        value: i64,
        /// Smallest accepted value.
        minimum: i64,
        /// Largest accepted value.
        maximum: i64,
        /// Required increment from `minimum`.
        step: u64,
    },
    /// A previously returned buffer was never requeued.
    #[error("buffer {0} was not requeued before the next wait")]
    BufferNotRequeued(u32),
}

impl CaptureError {
    /// Wrap an I/O error from a named device primitive.
    pub fn device(op: &'static str, source: io::Error) -> Self {
        Self::Device { op, source }
    }

    /// Classify this error according to the capture error taxonomy.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceOpenFailed(_)
            | Self::MissingCapability(_)
            | Self::StrategyNotSupported(_)
            | Self::NoAcceptableFormat { .. }
            | Self::InsufficientBuffers { .. }
            | Self::NoConverter(_) => ErrorKind::Configuration,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Interrupted { .. } => ErrorKind::Transient,
            Self::PartialFrame { .. } | Self::CorruptFrame(_) => ErrorKind::PartialFrame,
            Self::InvalidState { .. }
            | Self::BufferOutOfRange { .. }
            | Self::BufferAlreadyQueued(_)
            | Self::BufferNotRequeued(_)
            | Self::UnknownControl(_)
            | Self::ControlOutOfRange { .. } => ErrorKind::Usage,
            Self::Device { .. }
            | Self::BufferRelease { .. }
            | Self::BuffersInUse { .. }
            | Self::Release(_)
            | Self::Teardown(_)
            | Self::BufferNotQueued(_) => ErrorKind::Fatal,
        }
    }

    /// Whether calling `next_frame()` again may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Transient | ErrorKind::PartialFrame
        )
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
