//! Throughput of the two primitives every other crate builds on:
//! `ByteBuffer`'s append/compact cycle (the shape `Connection::write`
//! drives it through) and `EventQueue`'s produce/consume path (the
//! shape the timer worker drives it through).

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use gwcore::{ByteBuffer, EventQueue};
use std::sync::Arc;
use std::thread;

fn bench_append_and_delete_prefix(c: &mut Criterion) {
    c.bench_function("buffer_append_1kb_then_delete_prefix", |b| {
        b.iter_batched(
            ByteBuffer::new,
            |mut buf| {
                buf.append(&[0u8; 1024]);
                buf.delete_prefix(512);
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_find_byte(c: &mut Criterion) {
    let mut buf = ByteBuffer::new();
    buf.append(&vec![b'x'; 4096]);
    buf.append(b"\n");

    c.bench_function("buffer_find_byte_4kb_scan", |b| {
        b.iter(|| buf.find_byte(b'\n', 0));
    });
}

fn bench_produce_consume_roundtrip(c: &mut Criterion) {
    let queue: Arc<EventQueue<u32>> = Arc::new(EventQueue::new());

    c.bench_function("queue_produce_consume_roundtrip", |b| {
        b.iter(|| {
            queue.produce(1);
            queue.consume()
        });
    });
}

fn bench_cross_thread_handoff(c: &mut Criterion) {
    c.bench_function("queue_cross_thread_handoff", |b| {
        b.iter_batched(
            || Arc::new(EventQueue::<u32>::new()),
            |queue| {
                let consumer = {
                    let queue = queue.clone();
                    thread::spawn(move || queue.consume())
                };
                queue.produce(7);
                consumer.join().unwrap()
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_append_and_delete_prefix,
    bench_find_byte,
    bench_produce_consume_roundtrip,
    bench_cross_thread_handoff
);
criterion_main!(benches);
