use criterion::{criterion_group, criterion_main, Criterion};
use texcomp::{Bc7EncodingPlan, Options, PixelBlockU8, LANE_WIDTH};

fn test_batch() -> [PixelBlockU8; LANE_WIDTH] {
    let mut batch = [PixelBlockU8 { pixels: [[0; 4]; 16] }; LANE_WIDTH];
    for (i, block) in batch.iter_mut().enumerate() {
        for (px, pixel) in block.pixels.iter_mut().enumerate() {
            *pixel = [
                (px * 16 + i) as u8,
                (255 - px * 13) as u8,
                (px * 7 + i * 3) as u8,
                255,
            ];
        }
    }
    batch
}

fn bc7_quality(c: &mut Criterion, quality: u32) {
    let batch = test_batch();
    let options = Options::default();
    let plan = Bc7EncodingPlan::from_quality(quality);

    c.bench_function(&format!("bc7 quality {quality}"), |b| {
        b.iter(|| {
            let mut outputs = [[0u8; 16]; LANE_WIDTH];
            texcomp::encode_bc7(&mut outputs, &batch, &options, &plan);
            outputs
        })
    });
}

fn etc2(c: &mut Criterion) {
    let batch = test_batch();
    let options = Options::default();
    let mut scratch = texcomp::Etc2Scratch::new();

    c.bench_function("etc2", |b| {
        b.iter(|| {
            let mut outputs = [[0u8; 8]; LANE_WIDTH];
            texcomp::encode_etc2(&mut outputs, &batch, &options, &mut scratch);
            outputs
        })
    });
}

fn bc6h(c: &mut Criterion) {
    let batch = test_batch();
    let mut hdr = [texcomp::PixelBlockF16 { pixels: [[0; 4]; 16] }; LANE_WIDTH];
    for (dst, src) in hdr.iter_mut().zip(batch.iter()) {
        for (px, pixel) in src.pixels.iter().enumerate() {
            for ch in 0..4 {
                dst.pixels[px][ch] =
                    half::f16::from_f32(pixel[ch] as f32 / 255.0).to_bits();
            }
        }
    }
    let options = Options::default();

    c.bench_function("bc6h unsigned", |b| {
        b.iter(|| {
            let mut outputs = [[0u8; 16]; LANE_WIDTH];
            texcomp::encode_bc6h(&mut outputs, &hdr, &options, false);
            outputs
        })
    });
}

fn benches(c: &mut Criterion) {
    bc7_quality(c, 10);
    bc7_quality(c, 50);
    etc2(c);
    bc6h(c);
}

criterion_group!(benchmarks, benches);
criterion_main!(benchmarks);
