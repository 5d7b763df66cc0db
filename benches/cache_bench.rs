//! Benchmarks for the ShadowKV cache subsystem: landmark building, outlier
//! scoring, and top-k chunk retrieval, the three operations run once per
//! layer-head at prefill (the first two) or once per decode step (the
//! third) and thus the ones most worth tracking for regressions.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;

use shadowkv::cache::landmark::{build_landmarks, chunk_ranges, split_local_tail};
use shadowkv::cache::outlier::select_outliers;
use shadowkv::cache::retrieval::{affinity_scores, reduce_group_max, softmax_rows, top_k_chunk_ids};

const HEAD_DIM: usize = 128;
const CHUNK_SIZE: usize = 8;

fn synthetic_keys(n: usize, head_dim: usize) -> Array2<f32> {
    let mut keys = Array2::<f32>::zeros((n, head_dim));
    for pos in 0..n {
        for d in 0..head_dim {
            keys[[pos, d]] = ((pos as f32 + 1.0) * 0.013 + (d as f32 + 1.0) * 0.007).sin();
        }
    }
    keys
}

fn bench_landmark_building(c: &mut Criterion) {
    let n = CHUNK_SIZE * 4096;
    let keys = synthetic_keys(n, HEAD_DIM);
    let chunks = chunk_ranges(n, CHUNK_SIZE);
    let (candidate, _tail) = split_local_tail(&chunks, 4);

    c.bench_function("build_landmarks_4096_chunks", |b| {
        b.iter(|| {
            let landmarks = build_landmarks(keys.view(), black_box(candidate));
            black_box(landmarks);
        })
    });
}

fn bench_outlier_scoring(c: &mut Criterion) {
    let n = CHUNK_SIZE * 4096;
    let keys = synthetic_keys(n, HEAD_DIM);
    let chunks = chunk_ranges(n, CHUNK_SIZE);
    let (candidate, _tail) = split_local_tail(&chunks, 4);
    let landmarks = build_landmarks(keys.view(), candidate);

    c.bench_function("select_outliers_48_from_4096", |b| {
        b.iter(|| {
            let outliers = select_outliers(keys.view(), black_box(candidate), landmarks.view(), 48);
            black_box(outliers);
        })
    });
}

fn bench_top_k_retrieval(c: &mut Criterion) {
    let n_chunks = 4096;
    let n_query_heads = 4;
    let query = synthetic_keys(n_query_heads, HEAD_DIM);
    let landmarks = synthetic_keys(n_chunks, HEAD_DIM);

    c.bench_function("top_k_retrieval_256_from_4096", |b| {
        b.iter(|| {
            let mut affinity = affinity_scores(query.view(), landmarks.view());
            softmax_rows(&mut affinity);
            let reduced = reduce_group_max(affinity.view());
            let selected = top_k_chunk_ids(&reduced, black_box(256));
            black_box(selected);
        })
    });
}

criterion_group!(
    benches,
    bench_landmark_building,
    bench_outlier_scoring,
    bench_top_k_retrieval,
);
criterion_main!(benches);
