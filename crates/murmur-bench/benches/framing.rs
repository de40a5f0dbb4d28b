//! Frame encoding benchmarks for murmur.
//!
//! These benchmarks measure JSON and SSE framing of stream events.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use murmur_bench::message_event;
use murmur_protocol::codec;

const BODY_SIZES: [usize; 3] = [16, 512, 5000];

/// Benchmark JSON event encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in BODY_SIZES {
        let event = message_event(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("json", size), &event, |b, event| {
            b.iter(|| codec::encode(black_box(event)))
        });
        group.bench_with_input(BenchmarkId::new("sse", size), &event, |b, event| {
            b.iter(|| codec::encode_sse(black_box(event)))
        });
    }

    group.finish();
}

/// Benchmark event decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for size in BODY_SIZES {
        let event = message_event(size);

        let json = codec::encode(&event).unwrap();
        group.throughput(Throughput::Bytes(json.len() as u64));
        group.bench_with_input(BenchmarkId::new("json", size), &json, |b, json| {
            b.iter(|| codec::decode(black_box(json)))
        });

        let sse = codec::encode_sse(&event).unwrap();
        group.throughput(Throughput::Bytes(sse.len() as u64));
        group.bench_with_input(BenchmarkId::new("sse", size), &sse, |b, sse| {
            b.iter(|| {
                let mut buf = BytesMut::from(&sse[..]);
                codec::decode_sse_from(black_box(&mut buf))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
