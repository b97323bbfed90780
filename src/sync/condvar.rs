//! A condition variable that can coordinate threads of one or more processes.
//!
//! Waits always take a predicate: spurious wakeups are expected and handled
//! by re-checking. Only single-waiter wakeup (`signal`) is provided — the
//! ring engine wakes exactly one peer per slot transition.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{pthread_error, PikaError, PikaResult};
use crate::sync::MutexGuard;

/// A process-shared-capable condition variable, usable in place inside a
/// backing region.
#[repr(C)]
pub struct SharedCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
    initialized: AtomicBool,
}

// SAFETY: all waits happen with the associated mutex held; signalling is
// thread-safe by POSIX contract.
unsafe impl Send for SharedCondvar {}
unsafe impl Sync for SharedCondvar {}

impl SharedCondvar {
    /// A not-yet-initialized condition variable; see [`SharedCondvar::init`].
    pub(crate) fn new_uninit() -> Self {
        SharedCondvar {
            // SAFETY: placeholder bytes; `init` constructs the real pthread
            // state before any wait or signal.
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            initialized: AtomicBool::new(false),
        }
    }

    /// Initialize the condition variable in place. Same one-time,
    /// token-protected contract as [`crate::sync::SharedMutex::init`].
    pub fn init(&self, process_shared: bool) -> PikaResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        // SAFETY: attr is a valid out-pointer; destroyed on every path after
        // a successful init.
        unsafe {
            let rc = libc::pthread_condattr_init(attr.as_mut_ptr());
            if rc != 0 {
                return Err(pthread_error("pthread_condattr_init", rc));
            }
            if process_shared {
                let rc = libc::pthread_condattr_setpshared(
                    attr.as_mut_ptr(),
                    libc::PTHREAD_PROCESS_SHARED,
                );
                if rc != 0 {
                    libc::pthread_condattr_destroy(attr.as_mut_ptr());
                    return Err(pthread_error("pthread_condattr_setpshared", rc));
                }
            }
            let rc = libc::pthread_cond_init(self.inner.get(), attr.as_ptr());
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return Err(pthread_error("pthread_cond_init", rc));
            }
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn ensure_initialized(&self) -> PikaResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(PikaError::sync_primitive(
                "condition variable used before initialization".to_string(),
            ));
        }
        Ok(())
    }

    /// Block while `condition` holds. The guard's mutex is released during
    /// the wait and held again whenever `condition` runs.
    pub fn wait_while<F>(&self, guard: &mut MutexGuard<'_>, mut condition: F) -> PikaResult<()>
    where
        F: FnMut() -> bool,
    {
        self.ensure_initialized()?;
        while condition() {
            // SAFETY: guard proves the mutex is held by this thread; both
            // primitives were initialized in place.
            let rc = unsafe { libc::pthread_cond_wait(self.inner.get(), guard.raw()) };
            if rc != 0 {
                return Err(pthread_error("pthread_cond_wait", rc));
            }
        }
        Ok(())
    }

    /// Block while `condition` holds, up to the absolute deadline.
    ///
    /// Returns `Ok(true)` when the deadline passed with the condition still
    /// holding; the caller converts that into a timeout error. The mutex is
    /// held again on return either way.
    pub fn wait_while_until<F>(
        &self,
        guard: &mut MutexGuard<'_>,
        mut condition: F,
        deadline: &libc::timespec,
    ) -> PikaResult<bool>
    where
        F: FnMut() -> bool,
    {
        self.ensure_initialized()?;
        while condition() {
            // SAFETY: as in `wait_while`; deadline is a valid timespec.
            let rc = unsafe { libc::pthread_cond_timedwait(self.inner.get(), guard.raw(), deadline) };
            if rc == libc::ETIMEDOUT {
                return Ok(condition());
            }
            if rc != 0 {
                return Err(pthread_error("pthread_cond_timedwait", rc));
            }
        }
        Ok(false)
    }

    /// Wake one waiter, if any. Failures here cannot be surfaced to a caller
    /// usefully, so they are logged.
    pub fn signal(&self) {
        // SAFETY: initialized checked by callers holding the engine; a
        // signal on an initialized condvar is always safe.
        let rc = unsafe { libc::pthread_cond_signal(self.inner.get()) };
        if rc != 0 {
            log::warn!(
                "pthread_cond_signal failed: {}",
                std::io::Error::from_raw_os_error(rc)
            );
        }
    }
}

impl Drop for SharedCondvar {
    fn drop(&mut self) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            // SAFETY: inner was initialized by `init`; drop runs with
            // exclusive access, so no thread is waiting on the condvar.
            let rc = unsafe { libc::pthread_cond_destroy(self.inner.get()) };
            if rc != 0 {
                log::warn!(
                    "pthread_cond_destroy failed: {}",
                    std::io::Error::from_raw_os_error(rc)
                );
            }
        }
    }
}
