//! Loom-based exhaustive concurrency tests for the lock-free ring algorithm.
//!
//! Loom explores every interleaving of the modeled threads, verifying the
//! Relaxed/Acquire/Release protocol of the SPSC engine under every execution
//! order. The ring here is a simplified mirror of
//! `pika::ring::LockFreeRing` — same sentinel-slot capacity, same index
//! arithmetic, same orderings — built on loom's atomics instead of the
//! production pointer plumbing.
//!
//! Keep capacities and message counts tiny: loom's state space grows
//! exponentially.

use loom::cell::UnsafeCell;
use loom::sync::atomic::{AtomicU64, Ordering};
use loom::sync::Arc;

/// Minimal sentinel-slot SPSC ring: `queue_length + 1` slots, producer owns
/// `tail`, consumer owns `head`, empty ⇔ head == tail, full ⇔
/// (tail + 1) % capacity == head.
struct ModelRing {
    head: AtomicU64,
    tail: AtomicU64,
    capacity: u64,
    slots: Vec<UnsafeCell<u64>>,
}

unsafe impl Send for ModelRing {}
unsafe impl Sync for ModelRing {}

impl ModelRing {
    fn new(queue_length: u64) -> Self {
        let capacity = queue_length + 1;
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            capacity,
            slots: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    /// Producer-only. Mirrors `LockFreeRing::put` minus the busy-wait.
    fn try_put(&self, value: u64) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % self.capacity;
        if next == self.head.load(Ordering::Acquire) {
            return false;
        }
        // SAFETY: slot `tail` is invisible to the consumer until the
        // release-store below.
        self.slots[tail as usize].with_mut(|slot| unsafe { *slot = value });
        self.tail.store(next, Ordering::Release);
        true
    }

    /// Consumer-only. Mirrors `LockFreeRing::get` minus the busy-wait.
    fn try_get(&self) -> Option<u64> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the acquire-load synchronized with the producer's
        // release-store, so the slot holds a complete value.
        let value = self.slots[head as usize].with(|slot| unsafe { *slot });
        self.head.store((head + 1) % self.capacity, Ordering::Release);
        Some(value)
    }
}

#[test]
fn loom_put_is_visible_to_get() {
    // A value stored by the producer is seen intact by the consumer in
    // every interleaving.
    loom::model(|| {
        let ring = Arc::new(ModelRing::new(2));
        let producer_ring = ring.clone();

        let producer = loom::thread::spawn(move || {
            assert!(producer_ring.try_put(42));
        });

        let early = ring.try_get();
        producer.join().unwrap();

        match early {
            Some(value) => assert_eq!(value, 42),
            None => assert_eq!(ring.try_get(), Some(42)),
        }
    });
}

#[test]
fn loom_fifo_order_holds() {
    loom::model(|| {
        let ring = Arc::new(ModelRing::new(2));
        let producer_ring = ring.clone();

        let producer = loom::thread::spawn(move || {
            assert!(producer_ring.try_put(1));
            assert!(producer_ring.try_put(2));
        });

        // The consumer may observe a prefix of the stream at any point,
        // but never out of order.
        let mut received = Vec::new();
        for _ in 0..2 {
            if let Some(value) = ring.try_get() {
                received.push(value);
            }
        }
        producer.join().unwrap();
        while let Some(value) = ring.try_get() {
            received.push(value);
        }

        assert_eq!(received, vec![1, 2]);
    });
}

#[test]
fn loom_sentinel_slot_bounds_the_queue() {
    // queue_length = 1: one record fits, the second put fails until the
    // consumer drains, in every interleaving.
    loom::model(|| {
        let ring = Arc::new(ModelRing::new(1));
        assert!(ring.try_put(7));
        assert!(!ring.try_put(8), "sentinel slot must never hold a record");

        let consumer_ring = ring.clone();
        let consumer = loom::thread::spawn(move || consumer_ring.try_get());

        // Concurrent put: succeeds only if the consumer already drained.
        let put_won = ring.try_put(9);
        let consumed = consumer.join().unwrap();

        assert_eq!(consumed, Some(7));
        if put_won {
            assert_eq!(ring.try_get(), Some(9));
        } else {
            assert_eq!(ring.try_get(), None);
        }
    });
}

#[test]
fn loom_concurrent_stream_loses_nothing() {
    loom::model(|| {
        let ring = Arc::new(ModelRing::new(1));
        let producer_ring = ring.clone();

        let producer = loom::thread::spawn(move || {
            let mut sent = 0;
            for value in 1..=2u64 {
                if producer_ring.try_put(value) {
                    sent += 1;
                } else {
                    break;
                }
            }
            sent
        });

        let mut received = Vec::new();
        if let Some(value) = ring.try_get() {
            received.push(value);
        }
        let sent = producer.join().unwrap();
        while let Some(value) = ring.try_get() {
            received.push(value);
        }

        // Everything sent arrives, in order, exactly once.
        let expected: Vec<u64> = (1..=sent).collect();
        assert_eq!(received, expected);
    });
}
