//! Named mutual-exclusion tokens.
//!
//! Channel setup — header initialization, parameter validation, endpoint
//! registration — is serialized across every endpoint of a channel name by
//! a host-global binary token. Inter-process channels use a POSIX named
//! semaphore with an initial value of 1; inter-thread channels use a
//! process-global registry of binary tokens. The two families derive their
//! token names with different role suffixes so they can never collide.

use std::ffi::CString;
use std::sync::Arc;

use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};

use crate::channel::ChannelKind;
use crate::error::{PikaError, PikaResult};

lazy_static! {
    static ref LOCAL_TOKENS: DashMap<String, Arc<LocalToken>> = DashMap::new();
}

/// Host-global binary token keyed by channel name.
pub(crate) struct NamedToken;

impl NamedToken {
    /// Acquire the setup token for `channel_name`, blocking until it is
    /// free. The returned guard releases on drop.
    pub(crate) fn acquire(channel_name: &str, kind: ChannelKind) -> PikaResult<TokenGuard> {
        match kind {
            ChannelKind::InterProcess => {
                let token_name = format!("{}_inter_process", channel_name);
                let sem = PosixSemaphore::open(&token_name, 1)?;
                sem.wait()?;
                Ok(TokenGuard {
                    inner: TokenInner::Posix(sem),
                })
            }
            ChannelKind::InterThread => {
                let token_name = format!("{}_inter_thread", channel_name);
                // Clone out of the registry before blocking so the map shard
                // is not held across the wait.
                let token = {
                    let entry = LOCAL_TOKENS
                        .entry(token_name)
                        .or_insert_with(|| Arc::new(LocalToken::new()));
                    Arc::clone(entry.value())
                };
                token.acquire();
                Ok(TokenGuard {
                    inner: TokenInner::Local(token),
                })
            }
        }
    }
}

/// A held setup token. Dropping it releases the token.
pub(crate) struct TokenGuard {
    inner: TokenInner,
}

enum TokenInner {
    Posix(PosixSemaphore),
    Local(Arc<LocalToken>),
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        match &self.inner {
            TokenInner::Posix(sem) => {
                if let Err(err) = sem.post() {
                    log::warn!("failed to release named token: {}", err);
                }
            }
            TokenInner::Local(token) => token.release(),
        }
    }
}

/// A POSIX named semaphore used as a binary token.
struct PosixSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// SAFETY: sem_t handles from sem_open are process-wide; POSIX semaphore
// operations are thread-safe.
unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl PosixSemaphore {
    fn open(name: &str, initial_value: u32) -> PikaResult<Self> {
        if !name.starts_with('/') {
            return Err(PikaError::sync_primitive(format!(
                "semaphore name '{}' must begin with \"/\"",
                name
            )));
        }
        let c_name = CString::new(name).map_err(|_| {
            PikaError::sync_primitive(format!("semaphore name '{}' contains a null byte", name))
        })?;
        // SAFETY: c_name is a valid null-terminated CString; mode and value
        // are passed with the types sem_open's varargs expect.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT,
                libc::S_IRUSR | libc::S_IWUSR,
                initial_value,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(PikaError::sync_primitive(format!(
                "sem_open({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    fn wait(&self) -> PikaResult<()> {
        // SAFETY: self.sem is a live handle from sem_open.
        if unsafe { libc::sem_wait(self.sem) } != 0 {
            return Err(PikaError::sync_primitive(format!(
                "sem_wait({}) failed: {}",
                self.name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn post(&self) -> PikaResult<()> {
        // SAFETY: self.sem is a live handle from sem_open.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(PikaError::sync_primitive(format!(
                "sem_post({}) failed: {}",
                self.name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for PosixSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem is a live handle from sem_open; close releases
        // this process's reference, the named object itself persists.
        if unsafe { libc::sem_close(self.sem) } != 0 {
            log::warn!(
                "sem_close({}) failed: {}",
                self.name,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Binary token for endpoints sharing one process.
struct LocalToken {
    busy: Mutex<bool>,
    available: Condvar,
}

impl LocalToken {
    fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.available.wait(&mut busy);
        }
        *busy = true;
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn unique_name(prefix: &str) -> String {
        format!(
            "/{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    fn exercise_mutual_exclusion(kind: ChannelKind, name: &str) {
        let in_critical = AtomicU64::new(0);
        let entries = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        let guard = NamedToken::acquire(name, kind).unwrap();
                        assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(Duration::from_micros(50));
                        in_critical.fetch_sub(1, Ordering::SeqCst);
                        entries.fetch_add(1, Ordering::SeqCst);
                        drop(guard);
                    }
                });
            }
        });
        assert_eq!(entries.load(Ordering::SeqCst), 80);
    }

    #[test]
    fn local_token_is_mutually_exclusive() {
        let name = unique_name("pika_token_local");
        exercise_mutual_exclusion(ChannelKind::InterThread, &name);
    }

    #[test]
    fn posix_token_is_mutually_exclusive() {
        let name = unique_name("pika_token_posix");
        exercise_mutual_exclusion(ChannelKind::InterProcess, &name);
        // Best-effort namespace cleanup for the named semaphore.
        let token_name = CString::new(format!("{}_inter_process", name)).unwrap();
        // SAFETY: valid CString; ENOENT is irrelevant here.
        unsafe { libc::sem_unlink(token_name.as_ptr()) };
    }

    #[test]
    fn token_families_do_not_collide() {
        let name = unique_name("pika_token_families");
        let process_guard = NamedToken::acquire(&name, ChannelKind::InterProcess).unwrap();
        // The inter-thread token of the same channel name is independent.
        let thread_guard = NamedToken::acquire(&name, ChannelKind::InterThread).unwrap();
        drop(thread_guard);
        drop(process_guard);
        let token_name = CString::new(format!("{}_inter_process", name)).unwrap();
        // SAFETY: valid CString.
        unsafe { libc::sem_unlink(token_name.as_ptr()) };
    }
}
