//! Coarse-locked MPMC ring engine.
//!
//! One mutex protects the indices, the count, and all payload accesses; two
//! condition variables carry the not-full / not-empty transitions. A finite
//! timeout bounds the whole operation: the same absolute deadline limits the
//! mutex acquisition and the predicate wait.
//!
//! The zero-copy path hands out slot guards that keep the mutex held while
//! the caller reads or writes the slot in place. Releasing a slot advances
//! the index, unlocks, and then signals the peer condition variable —
//! unlock strictly precedes signal on every path that advances an index.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};

use crate::error::{PikaError, PikaResult};
use crate::ring::{RingGeometry, Timeout};
use crate::sync::{deadline_after, MutexGuard, SharedCondvar, SharedMutex};

/// Index state, mutated only with the mutex held.
#[repr(C)]
struct RingState {
    write_index: u64,
    read_index: u64,
    count: u64,
}

/// The locked engine. Lives inside the channel header in the backing region;
/// all payload addressing is relative to a caller-supplied base pointer.
#[repr(C)]
pub struct LockedRing {
    mutex: SharedMutex,
    not_empty: SharedCondvar,
    not_full: SharedCondvar,
    state: UnsafeCell<RingState>,
    queue_length: u64,
    record_size: u64,
    record_alignment: u64,
    slots_offset: u64,
}

// SAFETY: `state` is only touched with `mutex` held; the geometry fields are
// immutable after init.
unsafe impl Send for LockedRing {}
unsafe impl Sync for LockedRing {}

impl std::fmt::Debug for LockedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedRing")
            .field("queue_length", &self.queue_length)
            .field("record_size", &self.record_size)
            .field("record_alignment", &self.record_alignment)
            .field("slots_offset", &self.slots_offset)
            .finish_non_exhaustive()
    }
}

impl LockedRing {
    /// Initialize the engine in place over a zeroed region.
    ///
    /// `this` points into the backing region; `base` is the region start and
    /// is only used to validate the slot geometry. The caller holds the
    /// channel's named token, so nothing else can observe the engine before
    /// this returns.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory large enough for `LockedRing`,
    /// inside a region of at least `geometry.slots_offset +
    /// geometry.queue_length * geometry.record_size` bytes starting at
    /// `base`.
    pub unsafe fn init(
        this: *mut Self,
        base: *mut u8,
        geometry: RingGeometry,
        process_shared: bool,
    ) -> PikaResult<()> {
        geometry.validate()?;
        geometry.validate_base(base)?;

        ptr::addr_of_mut!((*this).mutex).write(SharedMutex::new_uninit());
        ptr::addr_of_mut!((*this).not_empty).write(SharedCondvar::new_uninit());
        ptr::addr_of_mut!((*this).not_full).write(SharedCondvar::new_uninit());
        ptr::addr_of_mut!((*this).state).write(UnsafeCell::new(RingState {
            write_index: 0,
            read_index: 0,
            count: 0,
        }));
        ptr::addr_of_mut!((*this).queue_length).write(geometry.queue_length);
        ptr::addr_of_mut!((*this).record_size).write(geometry.record_size);
        ptr::addr_of_mut!((*this).record_alignment).write(geometry.record_alignment);
        ptr::addr_of_mut!((*this).slots_offset).write(geometry.slots_offset);

        (*this).mutex.init(process_shared)?;
        (*this)
            .not_empty
            .init(process_shared)
            .map_err(|err| PikaError::sync_primitive(format!("{} (not_empty)", err)))?;
        (*this)
            .not_full
            .init(process_shared)
            .map_err(|err| PikaError::sync_primitive(format!("{} (not_full)", err)))?;
        Ok(())
    }

    pub fn queue_length(&self) -> u64 {
        self.queue_length
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    pub fn record_alignment(&self) -> u64 {
        self.record_alignment
    }

    /// Number of queued records right now. Takes the mutex.
    pub fn count(&self) -> PikaResult<u64> {
        let guard = self.mutex.lock()?;
        // SAFETY: mutex held.
        let count = unsafe { (*self.state.get()).count };
        drop(guard);
        Ok(count)
    }

    fn slot_ptr(&self, base: NonNull<u8>, index: u64) -> NonNull<u8> {
        assert!(index < self.queue_length, "slot index out of range");
        // SAFETY: index is in range and the region covers every slot, per
        // the init contract.
        unsafe {
            NonNull::new_unchecked(
                base.as_ptr()
                    .add((self.slots_offset + index * self.record_size) as usize),
            )
        }
    }

    /// Lock and wait on `condvar` until `ready` reports the predicate
    /// satisfied, honoring the timeout for both steps.
    fn lock_when<F>(
        &self,
        timeout: Timeout,
        condvar: &SharedCondvar,
        mut ready: F,
    ) -> PikaResult<MutexGuard<'_>>
    where
        F: FnMut(&RingState) -> bool,
    {
        // SAFETY (both closures below): the state cell is only read while
        // the mutex is held, which the wait guarantees.
        match timeout {
            Timeout::Infinite => {
                let mut guard = self.mutex.lock()?;
                let state = self.state.get();
                condvar.wait_while(&mut guard, || unsafe { !ready(&*state) })?;
                Ok(guard)
            }
            Timeout::Val(duration) => {
                let deadline = deadline_after(duration);
                let mut guard = self.mutex.lock_deadline(&deadline)?;
                let state = self.state.get();
                let timed_out =
                    condvar.wait_while_until(&mut guard, || unsafe { !ready(&*state) }, &deadline)?;
                if timed_out {
                    // Guard drops here: the queue is left unchanged.
                    return Err(PikaError::timeout(
                        "ring buffer wait timed out".to_string(),
                    ));
                }
                Ok(guard)
            }
        }
    }

    /// Borrow the next write slot. The returned guard holds the engine mutex;
    /// the not-full predicate is satisfied on return. The write index does
    /// not advance until [`LockedRing::release_front`].
    pub fn acquire_front(&self, base: NonNull<u8>, timeout: Timeout) -> PikaResult<WriteSlot<'_>> {
        let guard = self.lock_when(timeout, &self.not_full, |state| {
            state.count < self.queue_length
        })?;
        // SAFETY: mutex held by `guard`.
        let write_index = unsafe { (*self.state.get()).write_index };
        let ptr = self.slot_ptr(base, write_index);
        Ok(WriteSlot {
            ring: self,
            guard,
            ptr,
        })
    }

    /// Publish a slot obtained from [`LockedRing::acquire_front`]: advance
    /// the write index, release the mutex, signal not-empty.
    ///
    /// `ptr` must be the pointer the slot handed out. On mismatch the index
    /// does not advance and the mutex is released (the slot is abandoned);
    /// the error is a ring-buffer error, not a timeout.
    pub fn release_front(&self, slot: WriteSlot<'_>, ptr: *mut u8) -> PikaResult<()> {
        assert!(!ptr.is_null(), "null pointer released to ring buffer");
        if ptr != slot.ptr.as_ptr() {
            // Dropping `slot` unlocks without advancing the index.
            return Err(PikaError::ring_buffer(
                "released pointer does not match the acquired write slot".to_string(),
            ));
        }
        let WriteSlot { guard, .. } = slot;
        {
            // SAFETY: mutex held by `guard`.
            let state = unsafe { &mut *self.state.get() };
            state.write_index = (state.write_index + 1) % self.queue_length;
            state.count += 1;
            debug_assert!(state.count <= self.queue_length);
        }
        drop(guard);
        self.not_empty.signal();
        Ok(())
    }

    /// Borrow the next read slot; counterpart of
    /// [`LockedRing::acquire_front`] with the not-empty predicate.
    pub fn acquire_back(&self, base: NonNull<u8>, timeout: Timeout) -> PikaResult<ReadSlot<'_>> {
        let guard = self.lock_when(timeout, &self.not_empty, |state| state.count > 0)?;
        // SAFETY: mutex held by `guard`.
        let read_index = unsafe { (*self.state.get()).read_index };
        let ptr = self.slot_ptr(base, read_index);
        Ok(ReadSlot {
            ring: self,
            guard,
            ptr,
        })
    }

    /// Consume a slot obtained from [`LockedRing::acquire_back`]: advance
    /// the read index, release the mutex, signal not-full. Same pointer
    /// contract as [`LockedRing::release_front`].
    pub fn release_back(&self, slot: ReadSlot<'_>, ptr: *const u8) -> PikaResult<()> {
        assert!(!ptr.is_null(), "null pointer released to ring buffer");
        if ptr != slot.ptr.as_ptr() as *const u8 {
            return Err(PikaError::ring_buffer(
                "released pointer does not match the acquired read slot".to_string(),
            ));
        }
        let ReadSlot { guard, .. } = slot;
        {
            // SAFETY: mutex held by `guard`.
            let state = unsafe { &mut *self.state.get() };
            state.read_index = (state.read_index + 1) % self.queue_length;
            debug_assert!(state.count > 0);
            state.count -= 1;
        }
        drop(guard);
        self.not_full.signal();
        Ok(())
    }

    /// Copy one record into the queue, blocking until a slot frees up or the
    /// timeout expires. A timed-out put leaves the queue unchanged.
    pub fn put(&self, base: NonNull<u8>, src: &[u8], timeout: Timeout) -> PikaResult<()> {
        debug_assert_eq!(src.len() as u64, self.record_size);
        let slot = self.acquire_front(base, timeout)?;
        let ptr = slot.as_mut_ptr();
        // SAFETY: the slot guard holds the mutex and the slot spans
        // record_size bytes inside the region.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr, self.record_size as usize) };
        self.release_front(slot, ptr)
    }

    /// Copy the oldest record out of the queue, blocking until one arrives
    /// or the timeout expires. A timed-out get leaves the queue unchanged.
    pub fn get(&self, base: NonNull<u8>, dst: &mut [u8], timeout: Timeout) -> PikaResult<()> {
        debug_assert_eq!(dst.len() as u64, self.record_size);
        let slot = self.acquire_back(base, timeout)?;
        let ptr = slot.as_ptr();
        // SAFETY: as in `put`.
        unsafe { ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), self.record_size as usize) };
        self.release_back(slot, ptr)
    }
}

/// A borrowed write slot. Holds the engine mutex; dropping it without
/// releasing abandons the slot (unlock, no index advance, no signal).
#[derive(Debug)]
pub struct WriteSlot<'a> {
    ring: &'a LockedRing,
    guard: MutexGuard<'a>,
    ptr: NonNull<u8>,
}

impl WriteSlot<'_> {
    /// Writable pointer to the slot's [`WriteSlot::len`] bytes.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Slot size in bytes (the engine's record size).
    pub fn len(&self) -> usize {
        self.ring.record_size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A borrowed read slot; see [`WriteSlot`].
#[derive(Debug)]
pub struct ReadSlot<'a> {
    ring: &'a LockedRing,
    guard: MutexGuard<'a>,
    ptr: NonNull<u8>,
}

impl ReadSlot<'_> {
    /// Readable pointer to the slot's [`ReadSlot::len`] bytes.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Slot size in bytes (the engine's record size).
    pub fn len(&self) -> usize {
        self.ring.record_size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
