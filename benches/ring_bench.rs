//! Throughput benchmarks for the two ring engines.
//!
//! Each iteration performs one send and one receive on an otherwise empty
//! channel, so the numbers reflect per-record engine overhead rather than
//! queueing behavior.
//!
//! Run with: `cargo bench --bench ring_bench`

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pika::{ChannelKind, ChannelParameters, Consumer, Producer, Timeout};

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Payload {
    sequence: u64,
    data: [u8; 56],
}

fn unique_name(prefix: &str) -> String {
    format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

fn bench_locked_roundtrip(c: &mut Criterion) {
    let params = ChannelParameters::new(unique_name("bench_locked"), 16, ChannelKind::InterThread);
    let producer = Producer::<Payload>::create(&params).unwrap();
    let consumer = Consumer::<Payload>::create(&params).unwrap();

    let mut sequence = 0u64;
    c.bench_function("locked_send_recv", |b| {
        b.iter(|| {
            sequence += 1;
            let record = Payload {
                sequence,
                data: [0; 56],
            };
            producer.send(black_box(&record), Timeout::Infinite).unwrap();
            black_box(consumer.receive(Timeout::Infinite).unwrap());
        })
    });
}

fn bench_locked_zero_copy(c: &mut Criterion) {
    let params = ChannelParameters::new(unique_name("bench_loan"), 16, ChannelKind::InterThread);
    let producer = Producer::<Payload>::create(&params).unwrap();
    let consumer = Consumer::<Payload>::create(&params).unwrap();

    let mut sequence = 0u64;
    c.bench_function("locked_loan_roundtrip", |b| {
        b.iter(|| {
            sequence += 1;
            let mut sample = producer.loan(Timeout::Infinite).unwrap();
            sample.write(Payload {
                sequence,
                data: [0; 56],
            });
            sample.commit().unwrap();

            let sample = consumer.loan_next(Timeout::Infinite).unwrap();
            black_box(sample.get_ref().sequence);
            sample.release().unwrap();
        })
    });
}

fn bench_lock_free_roundtrip(c: &mut Criterion) {
    let params = ChannelParameters::new(unique_name("bench_spsc"), 16, ChannelKind::InterThread)
        .single_producer_single_consumer();
    let producer = Producer::<Payload>::create(&params).unwrap();
    let consumer = Consumer::<Payload>::create(&params).unwrap();

    let mut sequence = 0u64;
    c.bench_function("lock_free_send_recv", |b| {
        b.iter(|| {
            sequence += 1;
            let record = Payload {
                sequence,
                data: [0; 56],
            };
            producer.send(black_box(&record), Timeout::Infinite).unwrap();
            black_box(consumer.receive(Timeout::Infinite).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_locked_roundtrip,
    bench_locked_zero_copy,
    bench_lock_free_roundtrip
);
criterion_main!(benches);
