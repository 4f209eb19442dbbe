// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Hot-path benchmarks for the shared-memory transport primitives.
//
// Run with:
//   cargo bench --bench ring
//
// Groups:
//   ring_push_pop   — header ring publish + consume, one word per op
//   arena_cycle     — copy-slot reserve + copy-in + copy-out + release
//
// The arena group runs at three payload sizes:
//   small  — 64 bytes
//   medium — 1024 bytes
//   large  — 4096 bytes (one full slot)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use libnal::sm::copy_buf::CopyBuf;
use libnal::sm::ring::SmRing;

const SIZES: &[(&str, usize)] = &[("small_64", 64), ("medium_1024", 1024), ("large_4096", 4096)];

fn unique_name(tag: &str) -> String {
    format!("nal-bench-{}-{}", std::process::id(), tag)
}

fn bench_ring(c: &mut Criterion) {
    let ring = SmRing::create(&unique_name("ring")).unwrap();
    let mut group = c.benchmark_group("ring_push_pop");
    group.throughput(Throughput::Elements(1));
    group.bench_function("push_pop", |b| {
        b.iter(|| {
            assert!(ring.push(black_box(0x1234_5678_9abc_def1)));
            black_box(ring.pop().unwrap())
        });
    });
    group.finish();
}

fn bench_arena(c: &mut Criterion) {
    let arena = CopyBuf::create(&unique_name("arena")).unwrap();
    let mut group = c.benchmark_group("arena_cycle");

    for &(label, size) in SIZES {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let slot = arena.reserve_and_copy(&payload).unwrap();
                black_box(arena.copy_out_and_release(slot, sz))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ring, bench_arena);
criterion_main!(benches);
