//! Aggregation benchmarks.
//!
//! Tracks canonicalization, tree construction and proof checking across
//! window sizes so daily batches stay cheap as event volume grows.

use std::hint::black_box;

use anchorage_core::{Digest, EventId};
use anchorage_merkle::{aggregate, canonicalize, compute_root};
use anchorage_testing::fixtures;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use uuid::Uuid;

const SIZES: [u32; 4] = [16, 1_024, 16_384, 131_072];

fn pairs(count: u32) -> Vec<(EventId, Digest)> {
    fixtures::digests(count)
        .into_iter()
        .rev()
        .zip(0u128..)
        .map(|(hash, n)| (EventId(Uuid::from_u128(n)), hash))
        .collect()
}

fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize");

    for size in SIZES {
        let input = pairs(size);
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| black_box(canonicalize(input.iter().copied())));
        });
    }

    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate");
    group.sample_size(20);

    for size in SIZES {
        let leaves = fixtures::digests(size);
        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &leaves, |b, leaves| {
            b.iter(|| black_box(aggregate(leaves).map(|aggregation| aggregation.root())));
        });
    }

    group.finish();
}

fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify");

    for size in SIZES {
        let leaves = fixtures::digests(size);
        let Ok(aggregation) = aggregate(&leaves) else {
            continue;
        };
        let index = leaves.len() / 2;
        let leaf = leaves[index];
        let path = aggregation.proof(index).unwrap_or_default().to_vec();

        group.bench_with_input(BenchmarkId::from_parameter(size), &path, |b, path| {
            b.iter(|| black_box(compute_root(&leaf, path)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_canonicalize, bench_aggregate, bench_verify);
criterion_main!(benches);
