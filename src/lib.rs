//! # Pika
//!
//! Typed message passing over shared-memory ring buffers, between threads
//! of one process or between processes on one host.
//!
//! A channel is a named, bounded queue of fixed-size records. All endpoint
//! coordination happens through a single backing region that every endpoint
//! maps: a header with the rendezvous state, followed by the record slots.
//! Two ring engines sit on top of that region:
//!
//! - **Locked** (the default): any number of producers and consumers,
//!   blocking sends and receives with timeouts, zero-copy slot access.
//! - **Lock-free**: exactly one producer and one consumer, atomic indices,
//!   busy-waiting — for latency-critical one-to-one streams.
//!
//! A record is delivered to exactly one consumer; records from one producer
//! arrive in the order they were sent. Nothing survives a crash and nothing
//! leaves the host: this is transport, not storage.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pika::{ChannelKind, ChannelParameters, Consumer, Producer, Timeout};
//!
//! # fn main() -> pika::PikaResult<()> {
//! let params = ChannelParameters::new("/sensor", 16, ChannelKind::InterProcess);
//!
//! // In the producing process:
//! let producer = Producer::<u64>::create(&params)?;
//! producer.connect(Timeout::Infinite)?;
//! producer.send(&42, Timeout::Infinite)?;
//!
//! // In the consuming process:
//! let consumer = Consumer::<u64>::create(&params)?;
//! consumer.connect(Timeout::Infinite)?;
//! let value = consumer.receive(Timeout::Infinite)?;
//! # Ok(())
//! # }
//! ```
//!
//! Records must be [`bytemuck::Pod`]: fixed-size, self-contained byte
//! patterns with no pointers — they are read back in a foreign address
//! space.
//!
//! This crate targets Unix hosts; the inter-process transport is built on
//! POSIX shared memory and process-shared pthread primitives.

pub mod channel;
pub mod error;
pub mod memory;
pub mod ring;
pub mod sync;

pub use channel::{
    ChannelKind, ChannelParameters, Consumer, ConsumerSample, Producer, ProducerSample, Record,
};
pub use error::{PikaError, PikaResult};
pub use ring::Timeout;

// Re-export bytemuck so downstream record types can derive Pod/Zeroable
// against the same version.
pub use bytemuck;
