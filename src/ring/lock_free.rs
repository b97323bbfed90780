//! Lock-free SPSC ring engine.
//!
//! Exactly one producer and one consumer. Each index has a single writer:
//! the producer owns `tail`, the consumer owns `head`, so plain stores
//! suffice — no CAS. The ring holds `queue_length + 1` slots; the one
//! sentinel slot distinguishes full from empty without a shared count.
//!
//! Correctness rests on the acquire-load of the peer's index happening
//! before the payload copy, and the release-store of the own index happening
//! after it. Waits are busy-waits with a spin hint, bounded by the timeout;
//! the OS thread is never suspended.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{PikaError, PikaResult};
use crate::ring::{deadline_expired, CachePadded, RingGeometry, Timeout};

/// The lock-free engine. Lives inside the channel header; payload addressing
/// is relative to a caller-supplied base pointer, as with the locked engine.
#[repr(C)]
pub struct LockFreeRing {
    /// Next slot to read; written only by the consumer.
    head: CachePadded<AtomicU64>,
    /// Next slot to write; written only by the producer.
    tail: CachePadded<AtomicU64>,
    internal_queue_length: u64,
    record_size: u64,
    record_alignment: u64,
    slots_offset: u64,
}

impl LockFreeRing {
    /// Initialize the engine in place over a zeroed region.
    ///
    /// # Safety
    ///
    /// Same contract as [`crate::ring::LockedRing::init`], with
    /// `queue_length + 1` slots in the region.
    pub unsafe fn init(this: *mut Self, base: *mut u8, geometry: RingGeometry) -> PikaResult<()> {
        geometry.validate()?;
        geometry.validate_base(base)?;

        ptr::addr_of_mut!((*this).head).write(CachePadded::new(AtomicU64::new(0)));
        ptr::addr_of_mut!((*this).tail).write(CachePadded::new(AtomicU64::new(0)));
        ptr::addr_of_mut!((*this).internal_queue_length).write(geometry.queue_length + 1);
        ptr::addr_of_mut!((*this).record_size).write(geometry.record_size);
        ptr::addr_of_mut!((*this).record_alignment).write(geometry.record_alignment);
        ptr::addr_of_mut!((*this).slots_offset).write(geometry.slots_offset);
        Ok(())
    }

    /// Capacity as requested at initialization (the sentinel slot excluded).
    pub fn queue_length(&self) -> u64 {
        self.internal_queue_length - 1
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    pub fn record_alignment(&self) -> u64 {
        self.record_alignment
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    fn slot_ptr(&self, base: NonNull<u8>, index: u64) -> *mut u8 {
        assert!(index < self.internal_queue_length, "slot index out of range");
        // SAFETY: index is in range and the region covers every slot, per
        // the init contract.
        unsafe {
            base.as_ptr()
                .add((self.slots_offset + index * self.record_size) as usize)
        }
    }

    /// Copy one record into the queue. Busy-waits while full; a timed-out
    /// put leaves the queue unchanged. Producer-only.
    pub fn put(&self, base: NonNull<u8>, src: &[u8], timeout: Timeout) -> PikaResult<()> {
        debug_assert_eq!(src.len() as u64, self.record_size);
        let deadline = timeout.spin_deadline();

        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.internal_queue_length;
        while next == self.head.load(Ordering::Acquire) {
            if deadline_expired(deadline) {
                return Err(PikaError::timeout("ring buffer full".to_string()));
            }
            std::hint::spin_loop();
        }

        // SAFETY: slot `tail` is outside the consumer's readable range until
        // the release-store below publishes it; the copy happens-after the
        // acquire-load that proved the slot free.
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.slot_ptr(base, tail),
                self.record_size as usize,
            )
        };
        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    /// Copy the oldest record out of the queue. Busy-waits while empty; a
    /// timed-out get leaves the queue unchanged. Consumer-only.
    pub fn get(&self, base: NonNull<u8>, dst: &mut [u8], timeout: Timeout) -> PikaResult<()> {
        debug_assert_eq!(dst.len() as u64, self.record_size);
        let deadline = timeout.spin_deadline();

        let head = self.head.load(Ordering::Relaxed);
        while head == self.tail.load(Ordering::Acquire) {
            if deadline_expired(deadline) {
                return Err(PikaError::timeout("ring buffer empty".to_string()));
            }
            std::hint::spin_loop();
        }

        // SAFETY: the acquire-load above synchronized with the producer's
        // release-store, so slot `head` holds a fully written record.
        unsafe {
            ptr::copy_nonoverlapping(
                self.slot_ptr(base, head),
                dst.as_mut_ptr(),
                self.record_size as usize,
            )
        };
        self.head
            .store((head + 1) % self.internal_queue_length, Ordering::Release);
        Ok(())
    }

    /// Zero-copy slot access is a locked-engine feature.
    pub fn acquire_front(&self) -> PikaResult<()> {
        Err(PikaError::ring_buffer(
            "zero-copy slot access is not supported by the lock-free engine".to_string(),
        ))
    }

    /// Zero-copy slot access is a locked-engine feature.
    pub fn acquire_back(&self) -> PikaResult<()> {
        Err(PikaError::ring_buffer(
            "zero-copy slot access is not supported by the lock-free engine".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AlignedBuf;
    use std::mem::MaybeUninit;
    use std::time::Duration;

    struct TestRing {
        ring: Box<LockFreeRing>,
        slots: AlignedBuf,
    }

    impl TestRing {
        fn new(queue_length: u64, record_size: u64) -> Self {
            let geometry = RingGeometry {
                queue_length,
                record_size,
                record_alignment: record_size.next_power_of_two(),
                slots_offset: 0,
            };
            let slots = AlignedBuf::zeroed(
                ((queue_length + 1) * record_size) as usize,
                geometry.record_alignment as usize,
            )
            .unwrap();
            let mut ring = Box::new(MaybeUninit::<LockFreeRing>::zeroed());
            // SAFETY: the box provides writable memory for the engine; the
            // slot buffer covers queue_length + 1 slots.
            let ring = unsafe {
                LockFreeRing::init(ring.as_mut_ptr(), slots.as_ptr(), geometry).unwrap();
                Box::from_raw(Box::into_raw(ring) as *mut LockFreeRing)
            };
            Self { ring, slots }
        }

        fn base(&self) -> NonNull<u8> {
            NonNull::new(self.slots.as_ptr()).unwrap()
        }

        fn put(&self, value: u64, timeout: Timeout) -> PikaResult<()> {
            self.ring.put(self.base(), &value.to_ne_bytes(), timeout)
        }

        fn get(&self, timeout: Timeout) -> PikaResult<u64> {
            let mut bytes = [0u8; 8];
            self.ring.get(self.base(), &mut bytes, timeout)?;
            Ok(u64::from_ne_bytes(bytes))
        }
    }

    #[test]
    fn fifo_roundtrip() {
        let ring = TestRing::new(4, 8);
        for value in 10..14u64 {
            ring.put(value, Timeout::Infinite).unwrap();
        }
        for value in 10..14u64 {
            assert_eq!(ring.get(Timeout::Infinite).unwrap(), value);
        }
        assert!(ring.ring.is_empty());
    }

    #[test]
    fn holds_exactly_queue_length_records() {
        let ring = TestRing::new(4, 8);
        for value in 0..4u64 {
            ring.put(value, Timeout::Val(Duration::ZERO)).unwrap();
        }
        // The sentinel slot never stores a record.
        let err = ring.put(4, Timeout::Val(Duration::ZERO)).unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[test]
    fn empty_get_times_out() {
        let ring = TestRing::new(2, 8);
        let err = ring.get(Timeout::Val(Duration::from_millis(5))).unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[test]
    fn single_slot_queue_alternates() {
        let ring = TestRing::new(1, 8);
        for value in 0..8u64 {
            ring.put(value, Timeout::Val(Duration::ZERO)).unwrap();
            assert!(ring.put(value, Timeout::Val(Duration::ZERO)).is_err());
            assert_eq!(ring.get(Timeout::Val(Duration::ZERO)).unwrap(), value);
        }
    }

    #[test]
    fn cross_thread_stream_arrives_in_order() {
        const COUNT: u64 = 1000;
        let ring = TestRing::new(4, 8);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for value in 0..COUNT {
                    ring.put(value, Timeout::Infinite).unwrap();
                }
            });
            for value in 0..COUNT {
                assert_eq!(
                    ring.get(Timeout::Val(Duration::from_secs(5))).unwrap(),
                    value
                );
            }
        });
    }

    #[test]
    fn zero_copy_is_unsupported() {
        let ring = TestRing::new(2, 8);
        assert!(matches!(
            ring.ring.acquire_front().unwrap_err(),
            PikaError::RingBuffer(_)
        ));
        assert!(matches!(
            ring.ring.acquire_back().unwrap_err(),
            PikaError::RingBuffer(_)
        ));
    }
}
