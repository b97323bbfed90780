//! Typed producer and consumer endpoints.
//!
//! The transport moves raw bytes; these wrappers pin a record type to a
//! channel and hand its byte representation to the engine. A record must be
//! a fixed-size, self-contained byte pattern — it is read back in a foreign
//! address space, so it can carry no pointers, references, or heap-owning
//! content. The [`Record`] bound makes that contract static.

use std::cell::Cell;
use std::marker::PhantomData;

use bytemuck::{Pod, Zeroable};

use crate::channel::{ChannelParameters, ChannelState, RecordLayout, Role};
use crate::error::PikaResult;
use crate::ring::{LockedRing, ReadSlot, Timeout, WriteSlot};

/// Marker for types that can travel through a channel.
///
/// Satisfied by any [`bytemuck::Pod`] type: `#[repr(C)]`, `Copy`, no
/// padding surprises, valid for every bit pattern — which is exactly what
/// a record read from another address space has to be.
pub trait Record: Pod + Send + Sync + 'static {}

impl<T: Pod + Send + Sync + 'static> Record for T {}

/// The sending endpoint of a channel.
///
/// A producer may move between threads but is used from one thread at a
/// time; create one producer per sending thread instead of sharing.
#[derive(Debug)]
pub struct Producer<T: Record> {
    state: ChannelState,
    // Cell suppresses Sync while leaving Send intact.
    _single_thread: PhantomData<Cell<()>>,
    _record: PhantomData<fn(T)>,
}

impl<T: Record> Producer<T> {
    /// Create a producer endpoint, initializing the channel if this is the
    /// first endpoint of the name.
    pub fn create(params: &ChannelParameters) -> PikaResult<Self> {
        let state = ChannelState::create(params, RecordLayout::of::<T>(), Role::Producer)?;
        Ok(Self {
            state,
            _single_thread: PhantomData,
            _record: PhantomData,
        })
    }

    /// Queue one record, blocking until a slot frees up or the timeout
    /// expires. A timed-out send leaves the queue unchanged and may be
    /// retried.
    pub fn send(&self, record: &T, timeout: Timeout) -> PikaResult<()> {
        self.state.send_bytes(bytemuck::bytes_of(record), timeout)
    }

    /// Borrow the next free slot and write the record in place instead of
    /// copying through [`Producer::send`].
    ///
    /// The sample holds the queue lock: write, then [`ProducerSample::commit`]
    /// promptly. Dropping an uncommitted sample abandons the slot — the queue
    /// is left as if the loan never happened. Locked-engine channels only;
    /// lock-free channels return a ring-buffer error.
    pub fn loan(&self, timeout: Timeout) -> PikaResult<ProducerSample<'_, T>> {
        let ring = self.state.locked_engine()?;
        let slot = ring.acquire_front(self.state.base(), timeout)?;
        Ok(ProducerSample {
            ring,
            slot,
            _record: PhantomData,
        })
    }

    /// Wait until at least one consumer exists.
    pub fn connect(&self, timeout: Timeout) -> PikaResult<()> {
        self.state.connect(timeout)
    }

    /// Whether at least one consumer is currently live.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

/// A loaned write slot with a typed view; see [`Producer::loan`].
#[derive(Debug)]
pub struct ProducerSample<'a, T: Record> {
    ring: &'a LockedRing,
    slot: WriteSlot<'a>,
    _record: PhantomData<fn(T)>,
}

impl<T: Record> ProducerSample<'_, T> {
    /// Write the record directly into the loaned slot.
    pub fn write(&mut self, record: T) {
        debug_assert_eq!(std::mem::size_of::<T>(), self.slot.len());
        // SAFETY: the slot spans `size_of::<T>()` bytes on `align_of::<T>()`
        // (the channel registered this record layout) and the queue lock is
        // held for the lifetime of the sample.
        unsafe { std::ptr::write(self.slot.as_mut_ptr() as *mut T, record) };
    }

    /// Publish the slot to consumers and release the queue lock.
    pub fn commit(self) -> PikaResult<()> {
        let ptr = self.slot.as_mut_ptr();
        self.ring.release_front(self.slot, ptr)
    }
}

/// The receiving endpoint of a channel. Same threading contract as
/// [`Producer`].
#[derive(Debug)]
pub struct Consumer<T: Record> {
    state: ChannelState,
    _single_thread: PhantomData<Cell<()>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Consumer<T> {
    /// Create a consumer endpoint, initializing the channel if this is the
    /// first endpoint of the name.
    pub fn create(params: &ChannelParameters) -> PikaResult<Self> {
        let state = ChannelState::create(params, RecordLayout::of::<T>(), Role::Consumer)?;
        Ok(Self {
            state,
            _single_thread: PhantomData,
            _record: PhantomData,
        })
    }

    /// Take the oldest queued record, blocking until one arrives or the
    /// timeout expires.
    ///
    /// An infinite receive blocks until a record arrives even if every
    /// producer has dropped in the meantime; use a finite timeout together
    /// with [`Consumer::is_connected`] to observe peer loss.
    pub fn receive(&self, timeout: Timeout) -> PikaResult<T> {
        let mut record = <T as Zeroable>::zeroed();
        self.state
            .recv_bytes(bytemuck::bytes_of_mut(&mut record), timeout)?;
        Ok(record)
    }

    /// Borrow the oldest queued record in place instead of copying it out.
    ///
    /// The sample holds the queue lock: read through
    /// [`ConsumerSample::get_ref`], then [`ConsumerSample::release`]
    /// promptly. Dropping an unreleased sample puts the record back — the
    /// next receive sees it again. Locked-engine channels only.
    pub fn loan_next(&self, timeout: Timeout) -> PikaResult<ConsumerSample<'_, T>> {
        let ring = self.state.locked_engine()?;
        let slot = ring.acquire_back(self.state.base(), timeout)?;
        Ok(ConsumerSample {
            ring,
            slot,
            _record: PhantomData,
        })
    }

    /// Wait until at least one producer exists.
    pub fn connect(&self, timeout: Timeout) -> PikaResult<()> {
        self.state.connect(timeout)
    }

    /// Whether at least one producer is currently live.
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}

/// A loaned read slot with a typed view; see [`Consumer::loan_next`].
#[derive(Debug)]
pub struct ConsumerSample<'a, T: Record> {
    ring: &'a LockedRing,
    slot: ReadSlot<'a>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> ConsumerSample<'_, T> {
    /// Read the record where it sits in the queue.
    pub fn get_ref(&self) -> &T {
        debug_assert_eq!(std::mem::size_of::<T>(), self.slot.len());
        // SAFETY: the slot holds a complete record of the channel's
        // registered layout; the queue lock is held for the lifetime of the
        // sample, and T is valid for any bit pattern.
        unsafe { &*(self.slot.as_ptr() as *const T) }
    }

    /// Consume the record and release the queue lock.
    pub fn release(self) -> PikaResult<()> {
        let ptr = self.slot.as_ptr();
        self.ring.release_back(self.slot, ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;
    use std::time::Duration;

    fn unique_name(prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Telemetry {
        sequence: u64,
        reading: f32,
        _pad: [u8; 4],
    }

    #[test]
    fn typed_roundtrip_preserves_bytes() {
        let name = unique_name("typed_roundtrip");
        let params = ChannelParameters::new(&name, 4, ChannelKind::InterThread);

        let producer = Producer::<Telemetry>::create(&params).unwrap();
        let consumer = Consumer::<Telemetry>::create(&params).unwrap();

        let sent = Telemetry {
            sequence: 42,
            reading: 3.125,
            _pad: [0; 4],
        };
        producer.send(&sent, Timeout::Infinite).unwrap();
        let received = consumer.receive(Timeout::Infinite).unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn connect_sees_the_peer_appear_and_vanish() {
        let name = unique_name("typed_connect");
        let params = ChannelParameters::new(&name, 2, ChannelKind::InterThread);

        let consumer = Consumer::<u64>::create(&params).unwrap();
        assert!(!consumer.is_connected());
        {
            let producer = Producer::<u64>::create(&params).unwrap();
            consumer.connect(Timeout::Infinite).unwrap();
            producer.connect(Timeout::Infinite).unwrap();
            assert!(consumer.is_connected());
        }
        assert!(!consumer.is_connected());
    }

    #[test]
    fn loaned_slots_roundtrip_without_copies() {
        let name = unique_name("typed_loan");
        let params = ChannelParameters::new(&name, 2, ChannelKind::InterThread);
        let producer = Producer::<u64>::create(&params).unwrap();
        let consumer = Consumer::<u64>::create(&params).unwrap();

        let mut sample = producer.loan(Timeout::Infinite).unwrap();
        sample.write(0xDEAD_BEEF);
        sample.commit().unwrap();

        let sample = consumer.loan_next(Timeout::Infinite).unwrap();
        assert_eq!(*sample.get_ref(), 0xDEAD_BEEF);
        sample.release().unwrap();

        // Fully consumed.
        assert!(consumer
            .receive(Timeout::Val(Duration::from_millis(5)))
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn abandoned_loans_leave_the_queue_unchanged() {
        let name = unique_name("typed_loan_abandon");
        let params = ChannelParameters::new(&name, 1, ChannelKind::InterThread);
        let producer = Producer::<u64>::create(&params).unwrap();
        let consumer = Consumer::<u64>::create(&params).unwrap();

        // Abandoned write loan publishes nothing.
        drop(producer.loan(Timeout::Infinite).unwrap());
        assert!(consumer
            .receive(Timeout::Val(Duration::ZERO))
            .unwrap_err()
            .is_timeout());

        // Abandoned read loan puts the record back.
        producer.send(&9, Timeout::Infinite).unwrap();
        drop(consumer.loan_next(Timeout::Infinite).unwrap());
        assert_eq!(consumer.receive(Timeout::Infinite).unwrap(), 9);
    }

    #[test]
    fn lock_free_channels_refuse_loans() {
        let name = unique_name("typed_loan_spsc");
        let params = ChannelParameters::new(&name, 2, ChannelKind::InterThread)
            .single_producer_single_consumer();
        let producer = Producer::<u64>::create(&params).unwrap();
        let consumer = Consumer::<u64>::create(&params).unwrap();

        assert!(matches!(
            producer.loan(Timeout::Infinite).unwrap_err(),
            crate::error::PikaError::RingBuffer(_)
        ));
        assert!(matches!(
            consumer.loan_next(Timeout::Infinite).unwrap_err(),
            crate::error::PikaError::RingBuffer(_)
        ));
    }

    #[test]
    fn empty_receive_times_out() {
        let name = unique_name("typed_timeout");
        let params = ChannelParameters::new(&name, 2, ChannelKind::InterThread);
        let consumer = Consumer::<u64>::create(&params).unwrap();
        let err = consumer
            .receive(Timeout::Val(Duration::from_millis(5)))
            .unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }
}
