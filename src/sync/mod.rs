//! Synchronization primitives for the transport core.
//!
//! [`SharedMutex`] and [`SharedCondvar`] are process-shared-capable and are
//! placed *inside* the backing region, so every endpoint of a channel
//! operates on the same primitive bits regardless of which process it lives
//! in. [`NamedToken`] serializes one-time channel setup across all endpoints
//! of a name.

mod condvar;
mod mutex;
mod semaphore;

pub use condvar::SharedCondvar;
pub use mutex::{MutexGuard, SharedMutex};
pub(crate) use semaphore::NamedToken;

use std::time::Duration;

/// Convert a relative timeout into an absolute `CLOCK_REALTIME` deadline,
/// the form `pthread_mutex_timedlock` and `pthread_cond_timedwait` expect.
pub(crate) fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid timespec out-parameter; CLOCK_REALTIME is
    // always available.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };

    const NANOS_PER_SEC: i64 = 1_000_000_000;
    // Clamp absurd durations instead of overflowing time_t.
    let secs = timeout.as_secs().min(i64::MAX as u64 / 4) as i64;
    let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec + secs as libc::time_t + (nanos / NANOS_PER_SEC) as libc::time_t,
        tv_nsec: (nanos % NANOS_PER_SEC) as _,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_in_the_future() {
        let before = deadline_after(Duration::ZERO);
        let after = deadline_after(Duration::from_secs(5));
        assert!(after.tv_sec >= before.tv_sec + 4);
        assert!(after.tv_nsec < 1_000_000_000);
    }
}
