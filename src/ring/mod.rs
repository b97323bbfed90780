//! Bounded ring-buffer engines over raw bytes.
//!
//! Both engines live *inside* the channel header in the backing region and
//! carry no absolute pointers: the slot region is addressed as an offset
//! from the region base, and every operation receives the caller's mapped
//! base pointer. The mapped base differs between processes; the offset does
//! not.
//!
//! [`LockedRing`] is the general engine: any number of producers and
//! consumers, blocking waits, timeouts, zero-copy slot access.
//! [`LockFreeRing`] trades generality for latency: exactly one producer and
//! one consumer, atomic indices, busy-waiting.

mod lock_free;
mod locked;

pub use lock_free::LockFreeRing;
pub use locked::{LockedRing, ReadSlot, WriteSlot};

use std::ops::Deref;
use std::time::{Duration, Instant};

use crate::error::{PikaError, PikaResult};

/// How long an operation may wait for its predicate.
///
/// `Val(Duration::ZERO)` polls: the operation fails with a timeout error
/// immediately unless it can complete without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait forever.
    Infinite,
    /// Wait at most this long.
    Val(Duration),
}

impl Timeout {
    /// Monotonic deadline for spin loops. `None` means never expire — both
    /// for `Infinite` and for durations too large to represent.
    pub(crate) fn spin_deadline(self) -> Option<Instant> {
        match self {
            Timeout::Infinite => None,
            Timeout::Val(duration) => Instant::now().checked_add(duration),
        }
    }
}

pub(crate) fn deadline_expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

/// Geometry of a ring: fixed at initialization, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Number of records the queue holds.
    pub queue_length: u64,
    /// Size of one record in bytes.
    pub record_size: u64,
    /// Alignment of one record; a power of two.
    pub record_alignment: u64,
    /// Byte offset of slot 0 from the region base.
    pub slots_offset: u64,
}

impl RingGeometry {
    pub(crate) fn validate(&self) -> PikaResult<()> {
        if self.queue_length == 0 {
            return Err(PikaError::ring_buffer(
                "queue length must be greater than zero".to_string(),
            ));
        }
        if self.record_size == 0 {
            return Err(PikaError::ring_buffer(
                "record size must be greater than zero".to_string(),
            ));
        }
        if !self.record_alignment.is_power_of_two() {
            return Err(PikaError::ring_buffer(format!(
                "record alignment {} is not a power of two",
                self.record_alignment
            )));
        }
        Ok(())
    }

    /// Check the caller-supplied base against this geometry.
    pub(crate) fn validate_base(&self, base: *mut u8) -> PikaResult<()> {
        if base.is_null() {
            return Err(PikaError::ring_buffer(
                "backing region pointer is null".to_string(),
            ));
        }
        if !((base as usize as u64).wrapping_add(self.slots_offset))
            .is_multiple_of(self.record_alignment)
        {
            return Err(PikaError::ring_buffer(format!(
                "slot region is not aligned to {} bytes",
                self.record_alignment
            )));
        }
        Ok(())
    }
}

/// Cache-line padded wrapper preventing false sharing between the producer-
/// and consumer-owned ring indices. 128-byte alignment covers adjacent-line
/// prefetching.
#[repr(C, align(128))]
pub(crate) struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.value
    }
}
