//! 백로그 압축 비용 측정
//!
//! 읽기 사이클마다 두 번(체인 전, 체인 후) 일어나는 복사의 크기별 비용

use std::hint::black_box;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sockloop::buffer::{compact, default_generator};

fn bench_compact(c: &mut Criterion) {
    let generator = default_generator();
    let mut group = c.benchmark_group("compact");

    for &backlog_len in &[0usize, 1024, 32 * 1024] {
        let backlog = Bytes::from(vec![0xABu8; backlog_len]);
        let fresh = vec![0xCDu8; 16 * 1024];

        group.throughput(Throughput::Bytes((backlog_len + fresh.len()) as u64));
        group.bench_with_input(
            BenchmarkId::new("merge", backlog_len),
            &backlog,
            |b, backlog| {
                b.iter(|| black_box(compact(Some(backlog), Some(&fresh[..]), &*generator)));
            },
        );
    }

    let backlog = Bytes::from(vec![0xABu8; 32 * 1024]);
    group.bench_function("remainder_only", |b| {
        b.iter(|| black_box(compact(Some(&backlog), None, &*generator)));
    });
    group.bench_function("empty", |b| {
        b.iter(|| black_box(compact(None, None, &*generator)));
    });

    group.finish();
}

criterion_group!(benches, bench_compact);
criterion_main!(benches);
