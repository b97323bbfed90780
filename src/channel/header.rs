//! Channel header, region layout, and the create-time rendezvous.
//!
//! The header sits at offset 0 of the backing region and is the only thing
//! every endpoint agrees on before synchronization exists: a `registered`
//! flag that transitions false→true exactly once, two role counters, the
//! engine selector, and the engine state itself. Exactly one endpoint —
//! whichever wins the named token first — constructs the header in place;
//! everyone else validates its parameters against their own request.

use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::channel::{ChannelKind, ChannelParameters};
use crate::error::{PikaError, PikaResult};
use crate::memory::{Region, ShmRegion};
use crate::ring::{deadline_expired, LockFreeRing, LockedRing, RingGeometry, Timeout};
use crate::sync::NamedToken;

/// Size and alignment of the record type carried by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub size: u64,
    pub align: u64,
}

impl RecordLayout {
    pub fn of<T>() -> Self {
        Self {
            size: std::mem::size_of::<T>() as u64,
            align: std::mem::align_of::<T>() as u64,
        }
    }
}

/// Which side of the channel an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

/// Storage for whichever engine the channel registered.
///
/// A union rather than an enum keeps the header plain bytes with one layout
/// in every process of one build; `spsc_mode` is the tag.
#[repr(C)]
union EngineSlot {
    locked: ManuallyDrop<LockedRing>,
    lock_free: ManuallyDrop<LockFreeRing>,
}

/// A borrowed view of the registered engine.
pub(crate) enum Engine<'a> {
    Locked(&'a LockedRing),
    LockFree(&'a LockFreeRing),
}

/// The channel header at offset 0 of the backing region.
#[repr(C)]
pub(crate) struct ChannelHeader {
    registered: AtomicBool,
    spsc_mode: AtomicBool,
    producer_count: AtomicU64,
    consumer_count: AtomicU64,
    engine: EngineSlot,
}

/// Smallest multiple of `align` that is ≥ `value`.
fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Byte offset of slot 0: the first `record_alignment`-aligned offset past
/// the header.
pub(crate) fn slots_offset(record_align: u64) -> u64 {
    align_up(std::mem::size_of::<ChannelHeader>() as u64, record_align)
}

/// Total backing-region size for the given channel geometry. The lock-free
/// engine carries one extra sentinel slot.
pub(crate) fn region_size(params: &ChannelParameters, layout: RecordLayout) -> PikaResult<u64> {
    let slot_count = if params.single_producer_single_consumer {
        params.queue_size.saturating_add(1)
    } else {
        params.queue_size
    };
    slot_count
        .checked_mul(layout.size)
        .and_then(|slots| slots_offset(layout.align).checked_add(slots))
        .ok_or_else(|| {
            PikaError::channel(format!(
                "channel '{}' geometry overflows: {} slots of {} bytes",
                params.name, slot_count, layout.size
            ))
        })
}

impl ChannelHeader {
    /// Construct the header in place over a zeroed region and mark it
    /// registered. Runs under the channel's named token.
    ///
    /// # Safety
    ///
    /// `this` must point to the start of a writable region of at least
    /// [`region_size`] bytes, aligned for `ChannelHeader`, that no other
    /// endpoint is accessing (the token guarantees this).
    unsafe fn init_in_place(
        this: *mut Self,
        base: *mut u8,
        params: &ChannelParameters,
        layout: RecordLayout,
    ) -> PikaResult<()> {
        let geometry = RingGeometry {
            queue_length: params.queue_size,
            record_size: layout.size,
            record_alignment: layout.align,
            slots_offset: slots_offset(layout.align),
        };

        ptr::addr_of_mut!((*this).registered).write(AtomicBool::new(false));
        ptr::addr_of_mut!((*this).spsc_mode)
            .write(AtomicBool::new(params.single_producer_single_consumer));
        ptr::addr_of_mut!((*this).producer_count).write(AtomicU64::new(0));
        ptr::addr_of_mut!((*this).consumer_count).write(AtomicU64::new(0));

        let process_shared = params.kind == ChannelKind::InterProcess;
        if params.single_producer_single_consumer {
            let engine = ptr::addr_of_mut!((*this).engine.lock_free) as *mut LockFreeRing;
            LockFreeRing::init(engine, base, geometry)?;
        } else {
            let engine = ptr::addr_of_mut!((*this).engine.locked) as *mut LockedRing;
            LockedRing::init(engine, base, geometry, process_shared)?;
        }

        // Publish last: endpoints that lost the token race read the flag
        // with Acquire before touching anything else.
        (*this).registered.store(true, Ordering::SeqCst);
        log::debug!(
            "registered channel '{}' ({} engine, queue {}, record {}B/{}B align)",
            params.name,
            if params.single_producer_single_consumer {
                "lock-free"
            } else {
                "locked"
            },
            params.queue_size,
            layout.size,
            layout.align,
        );
        Ok(())
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// The registered engine. Panics if the header was never registered —
    /// reaching an engine operation on an unregistered header is a bug, not
    /// a recoverable condition.
    pub(crate) fn engine(&self) -> Engine<'_> {
        assert!(
            self.is_registered(),
            "channel header used before registration"
        );
        if self.spsc_mode.load(Ordering::SeqCst) {
            // SAFETY: spsc_mode tags which union member was initialized;
            // the tag is immutable once registered.
            Engine::LockFree(unsafe { &self.engine.lock_free })
        } else {
            // SAFETY: as above.
            Engine::Locked(unsafe { &self.engine.locked })
        }
    }

    /// Check an attaching endpoint's request against the registered
    /// parameters.
    fn validate(&self, params: &ChannelParameters, layout: RecordLayout) -> PikaResult<()> {
        let spsc = self.spsc_mode.load(Ordering::SeqCst);
        if spsc != params.single_producer_single_consumer {
            return Err(PikaError::channel(format!(
                "channel '{}' is registered with single_producer_single_consumer = {}; requested {}",
                params.name, spsc, params.single_producer_single_consumer
            )));
        }
        let (queue_length, record_size, record_alignment) = match self.engine() {
            Engine::Locked(ring) => (
                ring.queue_length(),
                ring.record_size(),
                ring.record_alignment(),
            ),
            Engine::LockFree(ring) => (
                ring.queue_length(),
                ring.record_size(),
                ring.record_alignment(),
            ),
        };
        if queue_length != params.queue_size {
            return Err(PikaError::channel(format!(
                "existing channel '{}' has queue length {}; requested {}",
                params.name, queue_length, params.queue_size
            )));
        }
        if record_size != layout.size {
            return Err(PikaError::channel(format!(
                "existing channel '{}' carries {}-byte records; requested {}",
                params.name, record_size, layout.size
            )));
        }
        if record_alignment != layout.align {
            return Err(PikaError::channel(format!(
                "existing channel '{}' has record alignment {}; requested {}",
                params.name, record_alignment, layout.align
            )));
        }
        Ok(())
    }

    fn counter(&self, role: Role) -> &AtomicU64 {
        match role {
            Role::Producer => &self.producer_count,
            Role::Consumer => &self.consumer_count,
        }
    }

    /// Register a live endpoint. Runs under the named token. SPSC channels
    /// admit at most one live endpoint per role — the lock-free engine's
    /// single-writer index protocol is unsound otherwise.
    fn register_endpoint(&self, role: Role, name: &str) -> PikaResult<()> {
        if self.spsc_mode.load(Ordering::SeqCst) && self.counter(role).load(Ordering::SeqCst) > 0 {
            return Err(PikaError::channel(format!(
                "single-producer single-consumer channel '{}' already has a live {}",
                name, role
            )));
        }
        self.counter(role).fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Deregister a live endpoint; returns true when no endpoint of either
    /// role remains.
    fn deregister_endpoint(&self, role: Role) -> bool {
        let remaining_own = self.counter(role).fetch_sub(1, Ordering::SeqCst) - 1;
        let peer = match role {
            Role::Producer => self.consumer_count.load(Ordering::SeqCst),
            Role::Consumer => self.producer_count.load(Ordering::SeqCst),
        };
        remaining_own == 0 && peer == 0
    }

    fn peer_count(&self, role: Role) -> u64 {
        match role {
            Role::Producer => self.consumer_count.load(Ordering::SeqCst),
            Role::Consumer => self.producer_count.load(Ordering::SeqCst),
        }
    }

    /// Tear down the registered engine's synchronization primitives. The
    /// lock-free engine carries none; the locked engine destroys its mutex
    /// and both condition variables.
    ///
    /// # Safety
    ///
    /// Only the last endpoint of the channel may call this (both role
    /// counters at zero), and nothing may touch the header afterwards.
    unsafe fn destroy_engine(&mut self) {
        if !self.is_registered() {
            return;
        }
        if !self.spsc_mode.load(Ordering::SeqCst) {
            // Runs the Drop impls of the engine's mutex and condvars
            // (pthread destroy) in place.
            ManuallyDrop::drop(&mut self.engine.locked);
        }
        self.registered.store(false, Ordering::SeqCst);
    }
}

/// One live endpoint's connection to a channel: its own region handle plus
/// its role. The typed facade wraps this.
#[derive(Debug)]
pub(crate) struct ChannelState {
    region: Region,
    name: String,
    kind: ChannelKind,
    role: Role,
}

impl ChannelState {
    /// The create-time rendezvous (all of it under the named token):
    /// open the backing region, initialize or validate the header, and
    /// register the endpoint's role.
    pub(crate) fn create(
        params: &ChannelParameters,
        layout: RecordLayout,
        role: Role,
    ) -> PikaResult<Self> {
        params.validate()?;

        let token = NamedToken::acquire(&params.name, params.kind)?;

        let size = region_size(params, layout)? as usize;
        let align = std::mem::align_of::<ChannelHeader>().max(layout.align as usize);
        let region = match Region::open(&params.name, params.kind, size, align) {
            Ok(region) => region,
            Err(open_err) => {
                // A size disagreement with a live channel is really a
                // parameter mismatch; inspect the registered header to
                // report the precise difference.
                if let Some(err) = Self::diagnose_mismatch(params, layout) {
                    return Err(err);
                }
                return Err(open_err);
            }
        };

        let base = region.as_ptr();
        if !(base as usize).is_multiple_of(std::mem::align_of::<ChannelHeader>()) {
            return Err(PikaError::ring_buffer(format!(
                "backing region for '{}' is not aligned for the channel header",
                params.name
            )));
        }

        // SAFETY: the region is at least region_size bytes and aligned
        // (checked above); the header is only interpreted once those checks
        // pass.
        let header = unsafe { &*(base as *const ChannelHeader) };
        if header.is_registered() {
            header.validate(params, layout)?;
        } else {
            // SAFETY: token held — no other endpoint can be between its own
            // registered-check and init.
            unsafe {
                ChannelHeader::init_in_place(base as *mut ChannelHeader, base, params, layout)?
            };
        }
        header.register_endpoint(role, &params.name)?;

        drop(token);

        Ok(Self {
            region,
            name: params.name.clone(),
            kind: params.kind,
            role,
        })
    }

    /// Re-open an existing region at its registered size and run parameter
    /// validation against its header. Returns the channel-level mismatch if
    /// there is one, `None` if the region cannot explain the failure.
    /// Called with the named token held.
    fn diagnose_mismatch(params: &ChannelParameters, layout: RecordLayout) -> Option<PikaError> {
        let header_align = std::mem::align_of::<ChannelHeader>();
        let existing = Region::open_existing(&params.name, params.kind, header_align).ok()?;
        if existing.len() < std::mem::size_of::<ChannelHeader>()
            || !(existing.as_ptr() as usize).is_multiple_of(header_align)
        {
            return None;
        }
        // SAFETY: size and alignment checked above; the region stays mapped
        // for the duration of the borrow.
        let header = unsafe { &*(existing.as_ptr() as *const ChannelHeader) };
        if !header.is_registered() {
            return None;
        }
        header.validate(params, layout).err()
    }

    pub(crate) fn header(&self) -> &ChannelHeader {
        // SAFETY: create validated size and alignment; the header outlives
        // the region handle held by self.
        unsafe { &*(self.region.as_ptr() as *const ChannelHeader) }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        // SAFETY: a successfully opened region has a non-null base.
        unsafe { NonNull::new_unchecked(self.region.as_ptr()) }
    }

    /// Wait until an endpoint of the opposite role exists.
    pub(crate) fn connect(&self, timeout: Timeout) -> PikaResult<()> {
        let deadline = timeout.spin_deadline();
        while self.header().peer_count(self.role) == 0 {
            if deadline_expired(deadline) {
                return Err(PikaError::timeout(format!(
                    "no peer endpoint appeared on channel '{}'",
                    self.name
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Whether an endpoint of the opposite role is currently live.
    pub(crate) fn is_connected(&self) -> bool {
        self.header().peer_count(self.role) > 0
    }

    pub(crate) fn send_bytes(&self, src: &[u8], timeout: Timeout) -> PikaResult<()> {
        match self.header().engine() {
            Engine::Locked(ring) => ring.put(self.base(), src, timeout),
            Engine::LockFree(ring) => ring.put(self.base(), src, timeout),
        }
    }

    pub(crate) fn recv_bytes(&self, dst: &mut [u8], timeout: Timeout) -> PikaResult<()> {
        match self.header().engine() {
            Engine::Locked(ring) => ring.get(self.base(), dst, timeout),
            Engine::LockFree(ring) => ring.get(self.base(), dst, timeout),
        }
    }

    /// The locked engine, for zero-copy slot access. Lock-free channels
    /// surface their standard unsupported error.
    pub(crate) fn locked_engine(&self) -> PikaResult<&LockedRing> {
        match self.header().engine() {
            Engine::Locked(ring) => Ok(ring),
            Engine::LockFree(ring) => {
                ring.acquire_front()?;
                unreachable!("lock-free engine never grants zero-copy slots")
            }
        }
    }
}

impl Drop for ChannelState {
    fn drop(&mut self) {
        let last = self.header().deregister_endpoint(self.role);
        if last && self.kind == ChannelKind::InterProcess {
            // Last endpoint out destroys the engine's primitives and
            // reclaims the OS name. In-process channels keep their header
            // alive for the process lifetime, so only the shared variant
            // tears down here.
            // SAFETY: both counters reached zero and the region is about to
            // be unlinked; no endpoint can reach this header again.
            unsafe { (*(self.region.as_ptr() as *mut ChannelHeader)).destroy_engine() };
            // Peers that raced us to zero may have unlinked already; that
            // is fine.
            if let Err(err) = ShmRegion::unlink(&self.name) {
                log::warn!("failed to unlink channel '{}': {}", self.name, err);
            }
        }
    }
}
