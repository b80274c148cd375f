//! Real FFT and power spectrum.
//!
//! Frames are zero-padded to the next power of two and transformed with the
//! complex planner. The result keeps the split-radix packing convention the
//! decoding engine expects: `fftLen/2` rows of (real, imag), where row 0
//! packs the DC and Nyquist bins as `((dc+nyq)/2, (dc-nyq)/2)`. The power
//! spectrum unfolds that row back into explicit DC and Nyquist energies,
//! yielding `fftLen/2 + 1` values per frame.

use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};
use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

/// Smallest power of two >= `points`.
pub fn padded_fft_length(points: usize) -> usize {
    debug_assert!(points >= 2);
    let mut fft_len = 1usize;
    while fft_len < points {
        fft_len <<= 1;
    }
    fft_len
}

fn transform_frame(frame: ArrayView1<f32>, fft_len: usize, out: &mut Array2<f32>, row0: usize) {
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(fft_len);

    let mut buffer: Vec<Complex32> = frame
        .iter()
        .map(|&x| Complex32::new(x, 0.0))
        .collect();
    buffer.resize(fft_len, Complex32::new(0.0, 0.0));
    fft.process(&mut buffer);

    let half = fft_len / 2;
    let dc = buffer[0].re;
    let nyquist = buffer[half].re;
    out[[row0, 0]] = 0.5 * (dc + nyquist);
    out[[row0, 1]] = 0.5 * (dc - nyquist);
    for k in 1..half {
        out[[row0 + k, 0]] = buffer[k].re;
        out[[row0 + k, 1]] = buffer[k].im;
    }
}

/// Real FFT of one frame. Returns the FFT length and an `(fftLen/2, 2)`
/// array of packed (real, imag) pairs.
pub fn srfft_1d(waveform: &Array1<f32>) -> (usize, Array2<f32>) {
    let fft_len = padded_fft_length(waveform.len());
    let mut out = Array2::zeros((fft_len / 2, 2));
    transform_frame(waveform.view(), fft_len, &mut out, 0);
    (fft_len, out)
}

/// Batch real FFT. Returns the FFT length and a `(frames, fftLen/2, 2)`
/// array.
pub fn srfft_2d(frames: &Array2<f32>) -> (usize, Array3<f32>) {
    let fft_len = padded_fft_length(frames.ncols());
    let half = fft_len / 2;
    let mut out = Array3::zeros((frames.nrows(), half, 2));
    for (i, frame) in frames.outer_iter().enumerate() {
        let mut flat = Array2::zeros((half, 2));
        transform_frame(frame, fft_len, &mut flat, 0);
        out.index_axis_mut(Axis(0), i).assign(&flat);
    }
    (fft_len, out)
}

/// Magnitude-squared spectrum of one packed FFT frame: `fftLen/2 + 1`
/// values with the DC and Nyquist energies unfolded from row 0.
pub fn power_spectrum_1d(fft_frame: &Array2<f32>) -> Array1<f32> {
    let half = fft_frame.nrows();
    let zeroth = fft_frame[[0, 0]] + fft_frame[[0, 1]];
    let n2th = fft_frame[[0, 0]] - fft_frame[[0, 1]];
    let mut out = Array1::zeros(half + 1);
    out[0] = zeroth * zeroth;
    for k in 1..half {
        out[k] = fft_frame[[k, 0]] * fft_frame[[k, 0]] + fft_frame[[k, 1]] * fft_frame[[k, 1]];
    }
    out[half] = n2th * n2th;
    out
}

/// Batch form of [`power_spectrum_1d`].
pub fn power_spectrum_2d(fft_frames: &Array3<f32>) -> Array2<f32> {
    let frames = fft_frames.shape()[0];
    let half = fft_frames.shape()[1];
    let mut out = Array2::zeros((frames, half + 1));
    for (i, frame) in fft_frames.outer_iter().enumerate() {
        let zeroth = frame[[0, 0]] + frame[[0, 1]];
        let n2th = frame[[0, 0]] - frame[[0, 1]];
        out[[i, 0]] = zeroth * zeroth;
        for k in 1..half {
            out[[i, k]] = frame[[k, 0]] * frame[[k, 0]] + frame[[k, 1]] * frame[[k, 1]];
        }
        out[[i, half]] = n2th * n2th;
    }
    out
}
