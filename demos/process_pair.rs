//! Inter-process channel demo
//!
//! Run the two halves in separate terminals (either order — each side waits
//! for its peer):
//! ```bash
//! cargo run --example process_pair -- produce
//! cargo run --example process_pair -- consume
//! ```

use std::time::Duration;

use pika::{ChannelKind, ChannelParameters, Consumer, PikaResult, Producer, Timeout};

const COUNT: u64 = 100;

fn params() -> ChannelParameters {
    ChannelParameters::new("/pika_demo_pair", 8, ChannelKind::InterProcess)
}

fn produce() -> PikaResult<()> {
    let producer = Producer::<u64>::create(&params())?;
    println!("waiting for a consumer...");
    producer.connect(Timeout::Infinite)?;
    for value in 0..COUNT {
        producer.send(&value, Timeout::Infinite)?;
    }
    println!("sent {} records", COUNT);
    Ok(())
}

fn consume() -> PikaResult<()> {
    let consumer = Consumer::<u64>::create(&params())?;
    println!("waiting for a producer...");
    consumer.connect(Timeout::Infinite)?;
    for expected in 0..COUNT {
        let value = consumer.receive(Timeout::Val(Duration::from_secs(10)))?;
        assert_eq!(value, expected, "records must arrive in order");
    }
    println!("received {} records in order", COUNT);
    Ok(())
}

fn main() -> PikaResult<()> {
    match std::env::args().nth(1).as_deref() {
        Some("produce") => produce(),
        Some("consume") => consume(),
        _ => {
            eprintln!("usage: process_pair <produce|consume>");
            std::process::exit(2);
        }
    }
}
