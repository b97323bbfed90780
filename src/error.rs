//! Unified error handling for Pika.
//!
//! Every fallible operation in the crate returns [`PikaResult`]. Failures are
//! values, never recovered internally; [`PikaError::Timeout`] is the one kind
//! callers are expected to retry.

use thiserror::Error;

/// Main error type for Pika operations.
#[derive(Debug, Error)]
pub enum PikaError {
    /// Creating, sizing, or mapping the backing region failed, or the channel
    /// name does not satisfy the backing store's constraints.
    #[error("backing storage error: {0}")]
    BackingStorage(String),

    /// A mutex, condition variable, or named token failed to initialize or
    /// operate.
    #[error("synchronization primitive error: {0}")]
    SyncPrimitive(String),

    /// The ring engine was handed an unusable region, or a zero-copy slot
    /// operation was misused.
    #[error("ring buffer error: {0}")]
    RingBuffer(String),

    /// A timed wait elapsed before its predicate was satisfied. Retryable;
    /// the queue is left unchanged.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Channel-level misuse: parameter mismatch against an existing channel,
    /// or a role constraint violation.
    #[error("channel error: {0}")]
    Channel(String),

    /// Catch-all for unexpected OS failures.
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Convenience type alias for Results using PikaError.
pub type PikaResult<T> = std::result::Result<T, PikaError>;

impl PikaError {
    /// Create a backing storage error.
    pub fn backing_storage<S: Into<String>>(msg: S) -> Self {
        PikaError::BackingStorage(msg.into())
    }

    /// Create a synchronization primitive error.
    pub fn sync_primitive<S: Into<String>>(msg: S) -> Self {
        PikaError::SyncPrimitive(msg.into())
    }

    /// Create a ring buffer error.
    pub fn ring_buffer<S: Into<String>>(msg: S) -> Self {
        PikaError::RingBuffer(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        PikaError::Timeout(msg.into())
    }

    /// Create a channel error.
    pub fn channel<S: Into<String>>(msg: S) -> Self {
        PikaError::Channel(msg.into())
    }

    /// Whether this error is a timeout. Timed-out operations leave the queue
    /// unchanged and may simply be retried.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PikaError::Timeout(_))
    }
}

/// Render a non-zero pthread return code as an error of the given kind.
///
/// pthread functions report failures through their return value rather than
/// `errno`, so `last_os_error` would read stale state here.
pub(crate) fn pthread_error(what: &str, return_code: i32) -> PikaError {
    PikaError::sync_primitive(format!(
        "{} failed: {}",
        what,
        std::io::Error::from_raw_os_error(return_code)
    ))
}
