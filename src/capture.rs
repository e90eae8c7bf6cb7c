//! Streaming control and the bounded wait for the next frame.

use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::buffer::BufferManager;
use crate::error::{CaptureError, Result};
use crate::session::SessionState;
use crate::traits::{FrameMetadata, IoStrategy, Readiness, VideoDevice};

/// A filled buffer handed out by [`CaptureLoop::wait_frame`].
///
/// Must be given back through [`CaptureLoop::requeue`]; the loop refuses
/// to wait again while a buffer is out.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dequeued frame must be requeued"]
pub struct DequeuedFrame {
    index: u32,
    metadata: FrameMetadata,
}

impl DequeuedFrame {
    /// Buffer index holding the frame.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Sequence, timestamp and payload size.
    pub const fn metadata(&self) -> FrameMetadata {
        self.metadata
    }
}

/// Drives streaming for one buffer pool.
#[derive(Debug)]
pub struct CaptureLoop {
    strategy: IoStrategy,
    streaming: bool,
    outstanding: Option<u32>,
    read_sequence: u32,
    started_at: Option<Instant>,
}

impl CaptureLoop {
    /// Create a stopped loop for `strategy`.
    #[must_use]
    pub const fn new(strategy: IoStrategy) -> Self {
        Self {
            strategy,
            streaming: false,
            outstanding: None,
            read_sequence: 0,
            started_at: None,
        }
    }

    /// Whether streaming is on.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Index of the buffer handed out and not yet requeued.
    #[must_use]
    pub const fn outstanding(&self) -> Option<u32> {
        self.outstanding
    }

    /// Queue every buffer and start streaming.
    ///
    /// Buffers the device kept after a failed stop are taken back first.
    /// On failure the loop remains stopped.
    pub fn start<D>(&mut self, device: &mut D, buffers: &mut BufferManager<D::Mapping>) -> Result<()>
    where
        D: VideoDevice,
    {
        if self.streaming {
            return Err(CaptureError::InvalidState {
                operation: "start",
                state: SessionState::Streaming,
            });
        }
        if self.strategy.is_streaming() && buffers.queued_count() > 0 {
            Self::reclaim(device, buffers)?;
        }
        self.outstanding = None;
        self.read_sequence = 0;
        self.started_at = Some(Instant::now());

        if self.strategy.is_streaming() {
            let idle: Vec<u32> = buffers.idle().collect();
            let started = idle
                .into_iter()
                .try_for_each(|index| buffers.enqueue(device, index))
                .and_then(|()| {
                    device
                        .stream_on()
                        .map_err(|err| CaptureError::device("VIDIOC_STREAMON", err))
                });
            if let Err(err) = started {
                error!(error = %err, "failed to start streaming");
                Self::abandon_queue(device, buffers);
                return Err(err);
            }
        }

        self.streaming = true;
        info!(strategy = ?self.strategy, buffers = buffers.count(), "streaming started");
        Ok(())
    }

    /// Wait for the next frame.
    ///
    /// Each wait blocks at most `timeout`. Timed-out waits use up the
    /// `max_retries` attempt budget and end in [`CaptureError::Timeout`].
    /// Interrupted waits are retried without using that budget, but more
    /// than `max_retries` interruptions end in [`CaptureError::Interrupted`].
    /// Any other device error stops streaming.
    pub fn wait_frame<D>(
        &mut self,
        device: &mut D,
        buffers: &mut BufferManager<D::Mapping>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<DequeuedFrame>
    where
        D: VideoDevice,
    {
        if !self.streaming {
            return Err(CaptureError::InvalidState {
                operation: "wait_frame",
                state: SessionState::Configured,
            });
        }
        if let Some(index) = self.outstanding {
            return Err(CaptureError::BufferNotRequeued(index));
        }

        let attempts = max_retries.max(1);
        let mut timeouts = 0;
        let mut interrupts = 0;
        loop {
            let readiness = match device.wait_readable(timeout) {
                Ok(readiness) => readiness,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => Readiness::Interrupted,
                Err(err) => return Err(self.fail(device, buffers, CaptureError::device("select", err))),
            };

            let blocked = match readiness {
                Readiness::Ready => match self.acquire(device, buffers) {
                    Ok(frame) => return Ok(frame),
                    Err(Acquire::Blocked(kind)) => kind,
                    Err(Acquire::Failed(err)) => return Err(self.fail(device, buffers, err)),
                },
                Readiness::TimedOut => io::ErrorKind::WouldBlock,
                Readiness::Interrupted => io::ErrorKind::Interrupted,
            };

            if blocked == io::ErrorKind::Interrupted {
                interrupts += 1;
                debug!(interrupts, "wait interrupted; retrying");
                if interrupts > max_retries {
                    warn!(interrupts, "giving up after repeated interruptions");
                    return Err(CaptureError::Interrupted { retries: interrupts });
                }
            } else {
                timeouts += 1;
                debug!(timeouts, attempts, ?timeout, "no frame within timeout");
                if timeouts >= attempts {
                    return Err(CaptureError::Timeout { attempts: timeouts });
                }
            }
        }
    }

    /// Pull the ready frame out of the device.
    fn acquire<D>(
        &mut self,
        device: &mut D,
        buffers: &mut BufferManager<D::Mapping>,
    ) -> std::result::Result<DequeuedFrame, Acquire>
    where
        D: VideoDevice,
    {
        if self.strategy == IoStrategy::Read {
            let bytes_used = match buffers.read_frame(device) {
                Ok(bytes_used) => bytes_used,
                Err(err) => return Err(Acquire::classify(err, "read")),
            };
            let metadata = FrameMetadata {
                sequence: self.read_sequence,
                timestamp: self.started_at.map(|at| at.elapsed()).unwrap_or_default(),
                bytes_used: u32::try_from(bytes_used).unwrap_or(u32::MAX),
            };
            self.read_sequence = self.read_sequence.wrapping_add(1);
            return Ok(DequeuedFrame { index: 0, metadata });
        }

        match buffers.dequeue(device) {
            Ok(dequeued) => {
                self.outstanding = Some(dequeued.index);
                Ok(DequeuedFrame {
                    index: dequeued.index,
                    metadata: dequeued.metadata,
                })
            }
            Err(CaptureError::Device { op, source }) => Err(Acquire::classify(source, op)),
            Err(err) => Err(Acquire::Failed(err)),
        }
    }

    /// Give a frame's buffer back to the device.
    pub fn requeue<D>(
        &mut self,
        device: &mut D,
        buffers: &mut BufferManager<D::Mapping>,
        frame: DequeuedFrame,
    ) -> Result<()>
    where
        D: VideoDevice,
    {
        if self.strategy == IoStrategy::Read || !self.streaming {
            return Ok(());
        }
        if self.outstanding != Some(frame.index) {
            return Err(CaptureError::BufferNotQueued(frame.index));
        }
        self.outstanding = None;
        if let Err(err) = buffers.enqueue(device, frame.index) {
            return Err(self.fail(device, buffers, err));
        }
        Ok(())
    }

    /// Stop streaming. Buffers stay allocated.
    ///
    /// Queued buffers come back to the process only when `VIDIOC_STREAMOFF`
    /// succeeds. After a failure they stay with the device and `stop` may be
    /// called again.
    pub fn stop<D>(&mut self, device: &mut D, buffers: &mut BufferManager<D::Mapping>) -> Result<()>
    where
        D: VideoDevice,
    {
        if !self.streaming && buffers.queued_count() == 0 {
            return Ok(());
        }
        self.streaming = false;
        self.outstanding = None;

        if self.strategy.is_streaming() {
            Self::reclaim(device, buffers)?;
        }
        info!(strategy = ?self.strategy, "streaming stopped");
        Ok(())
    }

    /// Leave streaming after a fatal error and return the error.
    fn fail<D>(
        &mut self,
        device: &mut D,
        buffers: &mut BufferManager<D::Mapping>,
        err: CaptureError,
    ) -> CaptureError
    where
        D: VideoDevice,
    {
        error!(error = %err, "fatal streaming error; stopping");
        self.streaming = false;
        self.outstanding = None;
        if self.strategy.is_streaming() {
            Self::abandon_queue(device, buffers);
        }
        err
    }

    /// Make the driver drop every queued buffer.
    fn abandon_queue<D>(device: &mut D, buffers: &mut BufferManager<D::Mapping>)
    where
        D: VideoDevice,
    {
        if buffers.queued_count() > 0 {
            if let Err(err) = Self::reclaim(device, buffers) {
                warn!(error = %err, "stream off after failure also failed");
            }
        }
    }

    /// Turn streaming off and take back every buffer the device held.
    fn reclaim<D>(device: &mut D, buffers: &mut BufferManager<D::Mapping>) -> Result<()>
    where
        D: VideoDevice,
    {
        device
            .stream_off()
            .map_err(|err| CaptureError::device("VIDIOC_STREAMOFF", err))?;
        buffers.reclaim_all();
        Ok(())
    }
}

/// Why a ready device did not produce a frame.
enum Acquire {
    /// Spurious wakeup or signal; counts against the wait budget.
    Blocked(io::ErrorKind),
    /// Anything else.
    Failed(CaptureError),
}

impl Acquire {
    fn classify(err: io::Error, op: &'static str) -> Self {
        match err.kind() {
            kind @ (io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Self::Blocked(kind),
            _ => Self::Failed(CaptureError::device(op, err)),
        }
    }
}
