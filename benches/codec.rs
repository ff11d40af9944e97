//! Benchmarks for block compression and decompression

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hfa_rs::codec::{compress, decompress};
use hfa_rs::PixelType;
use rand::{Rng, SeedableRng};

const PIXELS: usize = 64 * 64;

/// Blocks ranging from constant to noisy
fn sample_blocks() -> Vec<(&'static str, Vec<u8>)> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let constant = vec![100u8; PIXELS];
    let banded: Vec<u8> = (0..PIXELS).map(|i| (i / 256) as u8).collect();
    let narrow: Vec<u8> = (0..PIXELS).map(|_| rng.gen_range(40..48)).collect();
    let noisy: Vec<u8> = (0..PIXELS).map(|_| rng.gen()).collect();
    vec![
        ("constant", constant),
        ("banded", banded),
        ("narrow", narrow),
        ("noisy", noisy),
    ]
}

fn bench_compress(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_compress");
    group.throughput(Throughput::Bytes(PIXELS as u64));

    for (name, block) in sample_blocks() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &block, |b, block| {
            b.iter(|| compress(black_box(block), PixelType::U8, PIXELS));
        });
    }

    group.finish();
}

fn bench_decompress(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_decompress");
    group.throughput(Throughput::Bytes(PIXELS as u64));

    for (name, block) in sample_blocks() {
        let Some(packed) = compress(&block, PixelType::U8, PIXELS) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(name), &packed, |b, packed| {
            b.iter(|| decompress(black_box(packed), PixelType::U8, PIXELS).unwrap());
        });
    }

    group.finish();
}

fn bench_wide_pixels(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec_f32");
    let block: Vec<u8> = (0..PIXELS).flat_map(|i| ((i % 64) as f32).to_le_bytes()).collect();
    group.throughput(Throughput::Bytes(block.len() as u64));

    group.bench_function("compress", |b| {
        b.iter(|| compress(black_box(&block), PixelType::F32, PIXELS));
    });
    if let Some(packed) = compress(&block, PixelType::F32, PIXELS) {
        group.bench_function("decompress", |b| {
            b.iter(|| decompress(black_box(&packed), PixelType::F32, PIXELS).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compress, bench_decompress, bench_wide_pixels);
criterion_main!(benches);
