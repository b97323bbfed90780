//! Backing storage for channel regions.
//!
//! A backing region is the single root of ownership for one channel: the
//! channel header lives at offset 0 and the slot region follows it. Every
//! endpoint of a channel holds its own handle to the same bytes.
//!
//! Two variants exist: [`ShmRegion`] maps a named POSIX shared-memory object
//! so endpoints in different processes see the same bytes, and [`HeapRegion`]
//! hands endpoints in one process a pointer into a process-global buffer.

mod heap_region;
mod shm_region;

pub use heap_region::HeapRegion;
pub(crate) use heap_region::AlignedBuf;
pub use shm_region::ShmRegion;

use crate::channel::ChannelKind;
use crate::error::PikaResult;

/// A backing region of either kind, viewed uniformly by the channel layer.
#[derive(Debug)]
pub(crate) enum Region {
    Shm(ShmRegion),
    Heap(HeapRegion),
}

impl Region {
    /// Create or attach to the region backing the named channel.
    pub(crate) fn open(
        name: &str,
        kind: ChannelKind,
        size: usize,
        align: usize,
    ) -> PikaResult<Self> {
        match kind {
            ChannelKind::InterProcess => Ok(Region::Shm(ShmRegion::open(name, size, align)?)),
            ChannelKind::InterThread => Ok(Region::Heap(HeapRegion::open(name, size, align)?)),
        }
    }

    /// Attach to an already existing region at its registered size.
    pub(crate) fn open_existing(name: &str, kind: ChannelKind, align: usize) -> PikaResult<Self> {
        match kind {
            ChannelKind::InterProcess => Ok(Region::Shm(ShmRegion::open_existing(name, align)?)),
            ChannelKind::InterThread => Ok(Region::Heap(HeapRegion::open_existing(name)?)),
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        match self {
            Region::Shm(region) => region.as_ptr(),
            Region::Heap(region) => region.as_ptr(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Region::Shm(region) => region.len(),
            Region::Heap(region) => region.len(),
        }
    }
}
