//! A mutex that can coordinate threads of one process or several.
//!
//! The pthread mutex bits live behind an `UnsafeCell` so the structure can
//! be placed in shared memory and initialized in place. Initialization must
//! happen exactly once per channel, under the channel's named token, before
//! any other endpoint can reach the structure.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{pthread_error, PikaError, PikaResult};
use crate::sync::deadline_after;

/// A process-shared-capable mutex, usable in place inside a backing region.
#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
    initialized: AtomicBool,
}

// SAFETY: the pthread mutex itself provides the mutual exclusion; the
// `initialized` flag is atomic.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// A not-yet-initialized mutex. `init` must run before first use; until
    /// then every operation fails with a sync-primitive error.
    pub(crate) fn new_uninit() -> Self {
        SharedMutex {
            // SAFETY: zeroed bytes are a placeholder only; `init` constructs
            // the real pthread state before the mutex can be locked.
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            initialized: AtomicBool::new(false),
        }
    }

    /// Initialize the mutex in place.
    ///
    /// With `process_shared` the mutex coordinates endpoints mapping the
    /// same region from different processes. The caller must hold the
    /// channel's named token so no other endpoint observes a half-built
    /// primitive.
    pub fn init(&self, process_shared: bool) -> PikaResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr is a valid out-pointer; the attribute object is
        // destroyed on every path after init succeeds.
        unsafe {
            let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
            if rc != 0 {
                return Err(pthread_error("pthread_mutexattr_init", rc));
            }
            if process_shared {
                let rc = libc::pthread_mutexattr_setpshared(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                if rc != 0 {
                    libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
                    return Err(pthread_error("pthread_mutexattr_setpshared", rc));
                }
            }
            let rc = libc::pthread_mutex_init(self.inner.get(), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return Err(pthread_error("pthread_mutex_init", rc));
            }
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_initialized(&self) -> PikaResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(PikaError::sync_primitive(
                "mutex used before initialization".to_string(),
            ));
        }
        Ok(())
    }

    /// Acquire the mutex, blocking indefinitely.
    pub fn lock(&self) -> PikaResult<MutexGuard<'_>> {
        self.ensure_initialized()?;
        // SAFETY: inner was initialized by `init`.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if rc != 0 {
            return Err(pthread_error("pthread_mutex_lock", rc));
        }
        Ok(MutexGuard { mutex: self })
    }

    /// Acquire the mutex or give up at the absolute deadline.
    ///
    /// Expiry surfaces as [`PikaError::Timeout`], distinct from every other
    /// failure and retryable.
    pub fn lock_deadline(&self, deadline: &libc::timespec) -> PikaResult<MutexGuard<'_>> {
        self.ensure_initialized()?;
        // SAFETY: inner was initialized by `init`; deadline is a valid
        // timespec.
        let rc = unsafe { libc::pthread_mutex_timedlock(self.inner.get(), deadline) };
        if rc == libc::ETIMEDOUT {
            return Err(PikaError::timeout(
                "mutex acquisition timed out".to_string(),
            ));
        }
        if rc != 0 {
            return Err(pthread_error("pthread_mutex_timedlock", rc));
        }
        Ok(MutexGuard { mutex: self })
    }

    /// Acquire the mutex or give up after `timeout`.
    pub fn lock_timed(&self, timeout: Duration) -> PikaResult<MutexGuard<'_>> {
        self.lock_deadline(&deadline_after(timeout))
    }

    fn unlock(&self) -> PikaResult<()> {
        // SAFETY: only reachable through a guard, which proves the mutex is
        // initialized and held by this thread.
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if rc != 0 {
            return Err(pthread_error("pthread_mutex_unlock", rc));
        }
        Ok(())
    }
}

impl Drop for SharedMutex {
    fn drop(&mut self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            // SAFETY: inner was initialized by `init`; drop runs with
            // exclusive access, so no thread holds or waits on the mutex.
            let rc = unsafe { libc::pthread_mutex_destroy(self.inner.get()) };
            if rc != 0 {
                log::warn!(
                    "pthread_mutex_destroy failed: {}",
                    std::io::Error::from_raw_os_error(rc)
                );
            }
        }
    }
}

/// A held mutex. Dropping the guard releases the lock.
pub struct MutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl std::fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").finish_non_exhaustive()
    }
}

impl MutexGuard<'_> {
    /// Raw pthread handle for condition-variable waits.
    pub(crate) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.inner.get()
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.mutex.unlock() {
            log::warn!("mutex unlock failed on guard drop: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn new_mutex(process_shared: bool) -> Box<SharedMutex> {
        // Boxed so the pthread state never moves after init.
        let mutex = Box::new(SharedMutex::new_uninit());
        mutex.init(process_shared).expect("mutex init");
        mutex
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let mutex = new_mutex(false);
        let guard = mutex.lock().unwrap();
        drop(guard);
        // Re-acquirable after the guard released it.
        let _again = mutex.lock().unwrap();
    }

    #[test]
    fn uninitialized_mutex_is_rejected() {
        let mutex = SharedMutex::new_uninit();
        assert!(matches!(
            mutex.lock().unwrap_err(),
            PikaError::SyncPrimitive(_)
        ));
    }

    #[test]
    fn timed_lock_times_out_while_contended() {
        let mutex = new_mutex(false);
        let visitors = AtomicU32::new(0);

        std::thread::scope(|scope| {
            let guard = mutex.lock().unwrap();
            scope.spawn(|| {
                let err = mutex.lock_timed(Duration::from_millis(20)).unwrap_err();
                assert!(err.is_timeout(), "{err}");
                visitors.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(80));
            drop(guard);
        });
        assert_eq!(visitors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_timeout_succeeds_on_a_free_mutex() {
        let mutex = new_mutex(false);
        let guard = mutex.lock_timed(Duration::ZERO).expect("uncontended");
        drop(guard);
    }
}
