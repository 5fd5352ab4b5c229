//! Throughput benchmarks for the hot paths exercised on every loop
//! iteration: buffer growth, endpoint parsing, and timer scheduling.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use netreactor::buffer::Buffer;
use netreactor::sockets::parse_endpoint;
use netreactor::timer::TimerRegistry;
use std::time::{Duration, Instant};

fn benchmark_buffer_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_append");
    for &size in &[64usize, 1024, 16 * 1024] {
        let payload = vec![0xABu8; size];
        group.bench_with_input(BenchmarkId::new("append", size), &size, |b, _| {
            b.iter(|| {
                let mut buf = Buffer::new();
                buf.append(black_box(&payload));
                black_box(buf.len());
            });
        });
    }
    group.finish();
}

fn benchmark_buffer_skip_and_reinit(c: &mut Criterion) {
    c.bench_function("buffer_skip_full_then_refill", |b| {
        b.iter(|| {
            let mut buf = Buffer::new();
            buf.append(&[0u8; 4096]);
            buf.skip(4096);
            buf.append(black_box(&[1u8; 4096]));
            black_box(buf.len());
        });
    });
}

fn benchmark_endpoint_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("endpoint_parsing");
    let endpoints = [
        "tcp://127.0.0.1:9000",
        "tls://[2001:db8::1]:9000",
        "example.com:443",
    ];
    for endpoint in endpoints {
        group.bench_with_input(BenchmarkId::new("parse", endpoint), &endpoint, |b, &endpoint| {
            b.iter(|| black_box(parse_endpoint(black_box(endpoint)).unwrap()));
        });
    }
    group.finish();
}

fn benchmark_timer_registry(c: &mut Criterion) {
    c.bench_function("timer_registry_schedule_and_fire", |b| {
        b.iter(|| {
            let mut registry = TimerRegistry::new();
            let now = Instant::now();
            for i in 0..1000u64 {
                registry.schedule(i + 1, now + Duration::from_micros(i), None, Box::new(|| {}));
            }
            registry.fire_expired(black_box(now + Duration::from_secs(1)));
            black_box(registry.is_empty());
        });
    });
}

criterion_group!(
    core_operations,
    benchmark_buffer_append,
    benchmark_buffer_skip_and_reinit,
    benchmark_endpoint_parsing,
    benchmark_timer_registry,
);
criterion_main!(core_operations);
