//! Bounded SPSC byte-frame ring over a shared-memory file.
//!
//! The follower creates its ring; the leader opens it lazily and produces
//! frames into it. Exactly one producer and one consumer, in separate
//! processes, coordinate through two monotonic cursors in the mapped
//! header: the producer publishes with a Release store of `tail`, the
//! consumer with a Release store of `head`, and each reads the other's
//! cursor with Acquire. Neither side ever blocks.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use thiserror::Error;

const MAGIC: u64 = u64::from_le_bytes(*b"CPLRING1");
const HEADER_LEN: usize = 64;
const OFF_MAGIC: usize = 0;
const OFF_CAPACITY: usize = 8;
const OFF_HEAD: usize = 16;
const OFF_TAIL: usize = 24;

/// Per-message framing overhead inside the ring (LE u32 length).
const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a channel ring (bad magic)")]
    BadMagic,

    #[error("ring file is {got} bytes, header declares {expected}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("ring capacity must be at least {min} bytes")]
    CapacityTooSmall { min: usize },
}

/// One end of a bounded SPSC ring.
///
/// The struct itself does not enforce which end you are: the leader only
/// calls [`Channel::put`], the follower only [`Channel::pop`].
pub struct Channel {
    map: MmapMut,
    capacity: usize,
}

impl Channel {
    /// Create a fresh ring file with `capacity` data bytes.
    ///
    /// This is the consumer side's job; an existing file is truncated.
    pub fn create(path: &Path, capacity: usize) -> Result<Channel, ChannelError> {
        if capacity < LEN_PREFIX + 1 {
            return Err(ChannelError::CapacityTooSmall {
                min: LEN_PREFIX + 1,
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((HEADER_LEN + capacity) as u64)?;
        // SAFETY: the mapping is private to this ring protocol; all shared
        // mutation goes through the cursor atomics below.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC.to_le_bytes());
        map[OFF_CAPACITY..OFF_CAPACITY + 8].copy_from_slice(&(capacity as u64).to_le_bytes());
        map[OFF_HEAD..OFF_TAIL + 8].fill(0);
        Ok(Channel { map, capacity })
    }

    /// Open an existing ring file, validating its header.
    pub fn open(path: &Path) -> Result<Channel, ChannelError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < HEADER_LEN {
            return Err(ChannelError::BadMagic);
        }
        // SAFETY: as in `create`.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let magic = u64::from_le_bytes(map[OFF_MAGIC..OFF_MAGIC + 8].try_into().expect("8 bytes"));
        if magic != MAGIC {
            return Err(ChannelError::BadMagic);
        }
        let capacity =
            u64::from_le_bytes(map[OFF_CAPACITY..OFF_CAPACITY + 8].try_into().expect("8 bytes"))
                as usize;
        if len != HEADER_LEN + capacity {
            return Err(ChannelError::SizeMismatch {
                expected: HEADER_LEN + capacity,
                got: len,
            });
        }
        Ok(Channel { map, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether a frame of `len` bytes can ever fit, even in an empty ring.
    pub fn fits(&self, len: usize) -> bool {
        LEN_PREFIX + len <= self.capacity
    }

    /// Produce one frame. Returns `false` on backpressure (no space this
    /// instant); the frame is not partially written.
    pub fn put(&mut self, frame: &[u8]) -> bool {
        let need = (LEN_PREFIX + frame.len()) as u64;
        let tail = self.cursor(OFF_TAIL).load(Ordering::Relaxed);
        let head = self.cursor(OFF_HEAD).load(Ordering::Acquire);
        let free = self.capacity as u64 - (tail - head);
        if need > free {
            return false;
        }
        self.write_wrapped(tail, &(frame.len() as u32).to_le_bytes());
        self.write_wrapped(tail + LEN_PREFIX as u64, frame);
        self.cursor(OFF_TAIL).store(tail + need, Ordering::Release);
        true
    }

    /// Consume one frame, if any.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let head = self.cursor(OFF_HEAD).load(Ordering::Relaxed);
        let tail = self.cursor(OFF_TAIL).load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        self.read_wrapped(head, &mut len_bytes);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut frame = vec![0u8; len];
        self.read_wrapped(head + LEN_PREFIX as u64, &mut frame);
        self.cursor(OFF_HEAD)
            .store(head + (LEN_PREFIX + len) as u64, Ordering::Release);
        Some(frame)
    }

    fn cursor(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: offset is a fixed 8-aligned header slot inside the
        // mapping, and both processes touch it only through this atomic
        // view.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }

    fn write_wrapped(&mut self, cursor: u64, bytes: &[u8]) {
        let start = (cursor % self.capacity as u64) as usize;
        let first = bytes.len().min(self.capacity - start);
        let data = &mut self.map[HEADER_LEN..];
        data[start..start + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            data[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
    }

    fn read_wrapped(&self, cursor: u64, bytes: &mut [u8]) {
        let start = (cursor % self.capacity as u64) as usize;
        let first = bytes.len().min(self.capacity - start);
        let data = &self.map[HEADER_LEN..];
        bytes[..first].copy_from_slice(&data[start..start + first]);
        let total = bytes.len();
        if first < total {
            bytes[first..].copy_from_slice(&data[..total - first]);
        }
    }
}
