use brook_core::dsp::{
    add_deltas, mel_bank, padded_fft_length, power_spectrum_2d, splice_feats, srfft_2d,
    window_function, WindowKind,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;

fn frames(n: usize, dim: usize) -> Array2<f32> {
    Array2::from_shape_fn((n, dim), |(t, i)| ((t * dim + i) as f32 * 0.013).sin())
}

fn bench_fft_power(c: &mut Criterion) {
    let batch = frames(32, 400);
    c.bench_function("srfft_power_32x400", |b| {
        b.iter(|| {
            let (_, packed) = srfft_2d(black_box(&batch));
            power_spectrum_2d(&packed)
        })
    });
}

fn bench_mel_projection(c: &mut Criterion) {
    let fft_len = padded_fft_length(400);
    let bank = mel_bank(23, 16000, fft_len, 20, 0).unwrap();
    let power = frames(32, fft_len / 2 + 1).mapv(f32::abs);
    c.bench_function("mel_projection_32", |b| {
        b.iter(|| black_box(&power).dot(&bank))
    });
}

fn bench_window(c: &mut Criterion) {
    c.bench_function("povey_window_400", |b| {
        b.iter(|| window_function(black_box(400), WindowKind::Povey, 0.42))
    });
}

fn bench_context_transforms(c: &mut Criterion) {
    let feats = frames(100, 13);
    c.bench_function("deltas_splice_100x13", |b| {
        b.iter(|| {
            let with_deltas = add_deltas(black_box(&feats), 2, 2);
            splice_feats(&with_deltas, 3, 3)
        })
    });
}

criterion_group!(
    benches,
    bench_fft_power,
    bench_mel_projection,
    bench_window,
    bench_context_transforms
);
criterion_main!(benches);
