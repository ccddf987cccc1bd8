use criterion::{criterion_group, criterion_main, Criterion};
use crackle_core::decompose;

fn bench_decompose(c: &mut Criterion) {
    let caps: Vec<u64> = (1..=64).map(|i| i * 256).collect();
    c.bench_function("decompose(62^8, 64 ranks)", |b| {
        b.iter(|| decompose(218_340_105_584_896, &caps, 62 * 32))
    });
}

criterion_group!(benches, bench_decompose);
criterion_main!(benches);
