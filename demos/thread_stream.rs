//! Inter-thread channel demo
//!
//! A producer thread streams simulated sensor readings to a consumer thread
//! through a bounded channel of four slots.
//!
//! Run with:
//! ```bash
//! cargo run --example thread_stream
//! ```

use std::thread;
use std::time::Duration;

use pika::{ChannelKind, ChannelParameters, Consumer, PikaResult, Producer, Timeout};

#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Reading {
    sequence: u64,
    value: f64,
}

const READINGS: u64 = 50;

fn main() -> PikaResult<()> {
    let params = ChannelParameters::new("demo.sensor", 4, ChannelKind::InterThread);

    let producer = Producer::<Reading>::create(&params)?;
    let consumer = Consumer::<Reading>::create(&params)?;

    let sender = thread::spawn(move || -> PikaResult<()> {
        producer.connect(Timeout::Infinite)?;
        for sequence in 0..READINGS {
            let reading = Reading {
                sequence,
                value: (sequence as f64 * 0.1).sin() * 100.0,
            };
            producer.send(&reading, Timeout::Infinite)?;
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    });

    consumer.connect(Timeout::Infinite)?;
    for _ in 0..READINGS {
        let reading = consumer.receive(Timeout::Val(Duration::from_secs(5)))?;
        println!("[consumer] #{:03} value={:+8.3}", reading.sequence, reading.value);
    }

    sender.join().expect("producer thread panicked")?;
    println!("received all {} readings", READINGS);
    Ok(())
}
