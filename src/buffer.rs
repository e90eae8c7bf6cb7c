//! Frame buffer pool for the three I/O strategies.
//!
//! Ownership per strategy:
//! - read: one process buffer, the kernel never sees it;
//! - memory map: driver buffers mapped into the process, unmapped exactly
//!   once (the device consumes the mapping);
//! - user pointer: process buffers lent to the driver between `enqueue`
//!   and `dequeue`, never freed while lent.
//!
//! Each slot carries an owned-by-device flag flipped only by `enqueue`
//! and `dequeue`.

use std::io;

use tracing::{debug, info, warn};

use crate::error::{CaptureError, Result};
use crate::traits::{Dequeued, IoStrategy, QueueSlot, VideoDevice};

/// Minimum number of buffers for a streaming queue.
pub const MIN_QUEUE_DEPTH: u32 = 2;

/// Alignment and size granularity of user-pointer buffers.
pub const PAGE_SIZE: usize = 4096;

/// Page-aligned process memory lent to the driver.
#[derive(Debug)]
struct UserBuffer {
    backing: Vec<u8>,
    offset: usize,
    length: usize,
}

impl UserBuffer {
    fn new(size: usize) -> Self {
        let length = size.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        let backing = vec![0; length + PAGE_SIZE];
        let offset = match backing.as_ptr().align_offset(PAGE_SIZE) {
            offset if offset < PAGE_SIZE => offset,
            _ => 0,
        };
        Self {
            backing,
            offset,
            length,
        }
    }

    fn as_slice(&self) -> &[u8] {
        self.backing
            .get(self.offset..self.offset + self.length)
            .unwrap_or_default()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.backing
            .get_mut(self.offset..self.offset + self.length)
            .unwrap_or_default()
    }
}

#[derive(Debug)]
enum Storage<M> {
    Read(Vec<u8>),
    Mapped(M),
    User(UserBuffer),
}

#[derive(Debug)]
struct Slot<M> {
    storage: Storage<M>,
    queued: bool,
}

impl<M: AsRef<[u8]>> Slot<M> {
    fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Read(data) => data,
            Storage::Mapped(mapping) => mapping.as_ref(),
            Storage::User(buffer) => buffer.as_slice(),
        }
    }
}

/// Allocates, tracks and releases frame buffers.
#[derive(Debug)]
pub struct BufferManager<M> {
    strategy: Option<IoStrategy>,
    slots: Vec<Slot<M>>,
    frame_size: usize,
}

impl<M: AsRef<[u8]>> Default for BufferManager<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: AsRef<[u8]>> BufferManager<M> {
    /// Create an empty pool.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            strategy: None,
            slots: Vec::new(),
            frame_size: 0,
        }
    }

    /// Allocate buffers for `strategy`.
    ///
    /// `frame_size` is the largest frame the negotiated format produces.
    /// Streaming strategies accept whatever the driver grants as long as it
    /// is at least [`MIN_QUEUE_DEPTH`]. Returns the number of live buffers.
    pub fn allocate<D>(
        &mut self,
        device: &mut D,
        strategy: IoStrategy,
        requested: u32,
        frame_size: usize,
    ) -> Result<u32>
    where
        D: VideoDevice<Mapping = M>,
    {
        self.release(device)?;
        self.frame_size = frame_size;

        if strategy == IoStrategy::Read {
            self.slots.push(Slot {
                storage: Storage::Read(vec![0; frame_size]),
                queued: false,
            });
            self.strategy = Some(strategy);
            info!(?strategy, frame_size, "allocated read buffer");
            return Ok(1);
        }

        let granted = device
            .request_buffers(strategy, requested)
            .map_err(|err| CaptureError::device("VIDIOC_REQBUFS", err))?;
        if granted < MIN_QUEUE_DEPTH {
            if let Err(err) = device.request_buffers(strategy, 0) {
                warn!(error = %err, "failed to free undersized buffer queue");
            }
            return Err(CaptureError::InsufficientBuffers {
                granted,
                minimum: MIN_QUEUE_DEPTH,
            });
        }
        if granted < requested {
            debug!(requested, granted, "driver granted fewer buffers than requested");
        }
        self.strategy = Some(strategy);

        for index in 0..granted {
            let storage = match strategy {
                IoStrategy::MemoryMap => match Self::map(device, index) {
                    Ok(mapping) => Storage::Mapped(mapping),
                    Err(err) => {
                        self.roll_back(device);
                        return Err(err);
                    }
                },
                _ => Storage::User(UserBuffer::new(frame_size)),
            };
            self.slots.push(Slot {
                storage,
                queued: false,
            });
        }

        info!(?strategy, requested, granted, frame_size, "allocated buffers");
        Ok(granted)
    }

    /// Map driver buffer `index` into the process.
    fn map<D>(device: &mut D, index: u32) -> Result<M>
    where
        D: VideoDevice<Mapping = M>,
    {
        let descriptor = device
            .query_buffer(index)
            .map_err(|err| CaptureError::device("VIDIOC_QUERYBUF", err))?;
        device
            .map(&descriptor)
            .map_err(|err| CaptureError::device("mmap", err))
    }

    /// Undo a partially completed mapping, most recent buffer first.
    fn roll_back<D>(&mut self, device: &mut D)
    where
        D: VideoDevice<Mapping = M>,
    {
        while let Some(slot) = self.slots.pop() {
            if let Storage::Mapped(mapping) = slot.storage {
                if let Err(err) = device.unmap(mapping) {
                    warn!(index = self.slots.len(), error = %err, "unmap during rollback failed");
                }
            }
        }
        if let Some(strategy) = self.strategy.take() {
            if let Err(err) = device.request_buffers(strategy, 0) {
                warn!(error = %err, "failed to free buffer queue during rollback");
            }
        }
    }

    /// Release every buffer.
    ///
    /// Idempotent, and safe after a partial allocation. Mapped buffers are
    /// all unmapped even when some unmaps fail; the failures come back
    /// together. Nothing is unmapped or freed while the device still owns a
    /// buffer; the pool is kept and [`CaptureError::BuffersInUse`] returned.
    pub fn release<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: VideoDevice<Mapping = M>,
    {
        let Some(strategy) = self.strategy else {
            return Ok(());
        };
        let queued = self.queued_count();
        if queued > 0 {
            warn!(?strategy, queued, "device still owns buffers; not releasing them");
            return Err(CaptureError::BuffersInUse { queued });
        }

        let mut errors = Vec::new();
        match strategy {
            IoStrategy::Read => self.slots.clear(),
            IoStrategy::MemoryMap => {
                for (index, slot) in (0_u32..).zip(self.slots.drain(..)) {
                    if let Storage::Mapped(mapping) = slot.storage {
                        if let Err(source) = device.unmap(mapping) {
                            warn!(index, error = %source, "unmap failed");
                            errors.push(CaptureError::BufferRelease { index, source });
                        }
                    }
                }
                if let Err(err) = device.request_buffers(strategy, 0) {
                    errors.push(CaptureError::device("VIDIOC_REQBUFS", err));
                }
            }
            IoStrategy::UserPointer => {
                if let Err(err) = device.request_buffers(strategy, 0) {
                    errors.push(CaptureError::device("VIDIOC_REQBUFS", err));
                }
                self.slots.clear();
            }
        }

        self.strategy = None;
        debug!(?strategy, failures = errors.len(), "released buffers");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CaptureError::Release(errors))
        }
    }

    /// Hand buffer `index` to the device for filling.
    pub fn enqueue<D>(&mut self, device: &mut D, index: u32) -> Result<()>
    where
        D: VideoDevice<Mapping = M>,
    {
        let count = self.count();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|position| self.slots.get_mut(position))
            .ok_or(CaptureError::BufferOutOfRange { index, count })?;
        if slot.queued {
            return Err(CaptureError::BufferAlreadyQueued(index));
        }

        let queue_slot = match &mut slot.storage {
            Storage::Read(_) => return Err(CaptureError::StrategyNotSupported(IoStrategy::Read)),
            Storage::Mapped(_) => QueueSlot::Mapped { index },
            Storage::User(buffer) => QueueSlot::User {
                index,
                memory: buffer.as_mut_slice(),
            },
        };
        device
            .queue(queue_slot)
            .map_err(|err| CaptureError::device("VIDIOC_QBUF", err))?;
        slot.queued = true;
        Ok(())
    }

    /// Reclaim a filled buffer from the device.
    ///
    /// Buffers may come back in any order; the index is checked against the
    /// pool and the buffer must have been queued.
    pub fn dequeue<D>(&mut self, device: &mut D) -> Result<Dequeued>
    where
        D: VideoDevice<Mapping = M>,
    {
        let strategy = match self.strategy {
            Some(strategy) if strategy.is_streaming() => strategy,
            Some(strategy) => return Err(CaptureError::StrategyNotSupported(strategy)),
            None => return Err(CaptureError::BufferOutOfRange { index: 0, count: 0 }),
        };
        let dequeued = device
            .dequeue(strategy)
            .map_err(|err| CaptureError::device("VIDIOC_DQBUF", err))?;

        let count = self.count();
        let index = dequeued.index;
        let slot = usize::try_from(index)
            .ok()
            .and_then(|position| self.slots.get_mut(position))
            .ok_or(CaptureError::BufferOutOfRange { index, count })?;
        if !slot.queued {
            return Err(CaptureError::BufferNotQueued(index));
        }
        slot.queued = false;
        Ok(dequeued)
    }

    /// Read one frame into the read-strategy buffer.
    pub fn read_frame<D>(&mut self, device: &mut D) -> io::Result<usize>
    where
        D: VideoDevice<Mapping = M>,
    {
        match self.slots.first_mut().map(|slot| &mut slot.storage) {
            Some(Storage::Read(data)) => device.read(data),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "read requires the read I/O strategy",
            )),
        }
    }

    /// Mark every buffer as returned; the device gives them all back on
    /// stream-off.
    pub fn reclaim_all(&mut self) {
        for slot in &mut self.slots {
            slot.queued = false;
        }
    }

    /// Contents of buffer `index`.
    #[must_use]
    pub fn bytes(&self, index: u32) -> Option<&[u8]> {
        let position = usize::try_from(index).ok()?;
        self.slots.get(position).map(Slot::bytes)
    }

    /// Number of live buffers.
    #[must_use]
    pub fn count(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    /// Number of buffers currently owned by the device.
    #[must_use]
    pub fn queued_count(&self) -> u32 {
        let queued = self.slots.iter().filter(|slot| slot.queued).count();
        u32::try_from(queued).unwrap_or(u32::MAX)
    }

    /// Indices of buffers currently owned by the process.
    pub fn idle(&self) -> impl Iterator<Item = u32> + '_ {
        (0_u32..)
            .zip(&self.slots)
            .filter(|(_, slot)| !slot.queued)
            .map(|(index, _)| index)
    }

    /// Whether buffer `index` is owned by the device.
    #[must_use]
    pub fn is_queued(&self, index: u32) -> bool {
        usize::try_from(index)
            .ok()
            .and_then(|position| self.slots.get(position))
            .is_some_and(|slot| slot.queued)
    }

    /// Strategy of the current allocation.
    #[must_use]
    pub const fn strategy(&self) -> Option<IoStrategy> {
        self.strategy
    }

    /// Size of the largest frame the buffers were sized for.
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.frame_size
    }
}
