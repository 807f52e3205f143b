//! Benchmarks for isolation-forest scoring.
//!
//! Uses synthetic feature windows (no store, no RPC) for reproducible timing.
//! Run with: `cargo bench --package tokenwatch-analysis`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokenwatch_analysis::IsolationForest;

/// A window of `n` feature rows: clustered amounts with a few bursts.
fn sample_window(n: usize) -> Vec<[f64; 2]> {
    (0..n)
        .map(|i| {
            let z = ((i * 37 + 13) % 100) as f64 / 50.0 - 1.0;
            let gap = if i % 97 == 0 { 400.0 } else { (i % 5) as f64 };
            [z, gap]
        })
        .collect()
}

/// Benchmark: fit and score a full 1000-row window, as one scoring pass does.
fn bench_fit_predict_1000(c: &mut Criterion) {
    let window = sample_window(1000);
    let forest = IsolationForest::default();
    c.bench_function("fit_predict_1000_rows", |b| {
        b.iter(|| forest.fit_predict(black_box(&window)))
    });
}

/// Benchmark: minimum window size.
fn bench_fit_predict_10(c: &mut Criterion) {
    let window = sample_window(10);
    let forest = IsolationForest::default();
    c.bench_function("fit_predict_10_rows", |b| {
        b.iter(|| forest.fit_predict(black_box(&window)))
    });
}

criterion_group!(benches, bench_fit_predict_1000, bench_fit_predict_10);
criterion_main!(benches);
