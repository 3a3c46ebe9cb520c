//! Throughput of `Connection`'s buffered write-drain and framed-read
//! paths, driven over a `UnixStream::pair()` the same way the crate's
//! own socket-pair tests exercise them.

use std::os::unix::io::IntoRawFd;
use std::os::unix::net::UnixStream;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use gwconn::Connection;

const PAYLOAD: &[u8] = &[0u8; 256];

fn pair() -> (std::sync::Arc<Connection>, std::sync::Arc<Connection>) {
    let (a, b) = UnixStream::pair().unwrap();
    let a = Connection::wrap_fd(a.into_raw_fd()).unwrap();
    let b = Connection::wrap_fd(b.into_raw_fd()).unwrap();
    (a, b)
}

fn bench_write_drains_immediately(c: &mut Criterion) {
    c.bench_function("connection_write_256b_drains_immediately", |b| {
        b.iter_batched(
            pair,
            |(a, _b)| {
                a.write(PAYLOAD);
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_write_then_read_fixed_roundtrip(c: &mut Criterion) {
    c.bench_function("connection_write_then_read_fixed_256b_roundtrip", |b| {
        b.iter_batched(
            pair,
            |(a, b)| {
                a.write(PAYLOAD);
                let mut got = b.read_fixed(PAYLOAD.len());
                while got.is_none() {
                    got = b.read_fixed(PAYLOAD.len());
                }
                got
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_write_drains_immediately,
    bench_write_then_read_fixed_roundtrip
);
criterion_main!(benches);
