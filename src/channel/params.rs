//! Channel parameters and validation.

use serde::{Deserialize, Serialize};

use crate::error::{PikaError, PikaResult};

/// Where the endpoints of a channel live relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Endpoints may be in different processes; the backing region is a
    /// named POSIX shared-memory object.
    InterProcess,
    /// Endpoints share one process; the backing region is a process-global
    /// heap buffer.
    InterThread,
}

/// Everything needed to create or attach to a channel.
///
/// Every endpoint of a channel must pass identical parameters; the first
/// endpoint fixes them and later endpoints are validated against the
/// registered header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParameters {
    /// Channel name. Inter-process channels must use a `/`-prefixed name
    /// valid for the host's shared-memory namespace; inter-thread channels
    /// accept any non-empty string.
    pub name: String,
    /// Number of record slots in the queue; must be greater than zero.
    pub queue_size: u64,
    /// Inter-process or inter-thread.
    pub kind: ChannelKind,
    /// Select the lock-free engine. Restricts the channel to exactly one
    /// live producer and one live consumer.
    #[serde(default)]
    pub single_producer_single_consumer: bool,
}

impl ChannelParameters {
    /// Parameters for a locked (MPMC) channel.
    pub fn new(name: impl Into<String>, queue_size: u64, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            queue_size,
            kind,
            single_producer_single_consumer: false,
        }
    }

    /// Switch the channel to the lock-free SPSC engine.
    pub fn single_producer_single_consumer(mut self) -> Self {
        self.single_producer_single_consumer = true;
        self
    }

    pub fn validate(&self) -> PikaResult<()> {
        if self.name.is_empty() {
            return Err(PikaError::channel(
                "channel name must not be empty".to_string(),
            ));
        }
        if self.kind == ChannelKind::InterProcess && !self.name.starts_with('/') {
            return Err(PikaError::channel(format!(
                "inter-process channel name '{}' must begin with \"/\"",
                self.name
            )));
        }
        if self.queue_size == 0 {
            return Err(PikaError::channel(
                "queue size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_parameters_pass() {
        let params = ChannelParameters::new("/good", 4, ChannelKind::InterProcess);
        assert!(params.validate().is_ok());

        let params =
            ChannelParameters::new("no_slash_needed", 1, ChannelKind::InterThread)
                .single_producer_single_consumer();
        assert!(params.validate().is_ok());
    }

    #[test]
    fn inter_process_requires_leading_slash() {
        let params = ChannelParameters::new("bare", 4, ChannelKind::InterProcess);
        assert!(matches!(
            params.validate().unwrap_err(),
            PikaError::Channel(_)
        ));
    }

    #[test]
    fn zero_queue_size_rejected() {
        let params = ChannelParameters::new("/zero", 0, ChannelKind::InterProcess);
        assert!(params.validate().is_err());
    }

    #[test]
    fn parameters_roundtrip_through_serde() {
        let params = ChannelParameters::new("/wire", 8, ChannelKind::InterProcess)
            .single_producer_single_consumer();
        let json = serde_json::to_string(&params).unwrap();
        let back: ChannelParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(params, back);
    }
}
