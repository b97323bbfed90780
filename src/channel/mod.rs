//! Channels: rendezvous, header, and typed endpoints.
//!
//! A channel is a named, bounded queue of fixed-size records. Endpoints
//! rendezvous purely through the channel name: the first one to arrive
//! initializes the shared header, later ones validate their parameters
//! against it, and producer/consumer counters let each side discover the
//! other.

mod endpoint;
mod header;
mod params;

pub use endpoint::{Consumer, ConsumerSample, Producer, ProducerSample, Record};
pub use params::{ChannelKind, ChannelParameters};

pub(crate) use header::{ChannelState, RecordLayout, Role};
