//! Waveform-domain kernels: pre-emphasis, dither, DC removal, windowing,
//! log-energy.

use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::errors::{FeatureError, Result};

/// Pre-emphasize a frame: `y[i] = x[i] - coeff * x[i-1]`, with the first
/// sample emphasized against itself.
pub fn pre_emphasize_1d(waveform: &Array1<f32>, coeff: f32) -> Array1<f32> {
    debug_assert!((0.0..1.0).contains(&coeff));
    let mut out = Array1::zeros(waveform.len());
    if waveform.is_empty() {
        return out;
    }
    out[0] = waveform[0] - coeff * waveform[0];
    for i in 1..waveform.len() {
        out[i] = waveform[i] - coeff * waveform[i - 1];
    }
    out
}

/// Batch form of [`pre_emphasize_1d`].
pub fn pre_emphasize_2d(frames: &Array2<f32>, coeff: f32) -> Array2<f32> {
    debug_assert!((0.0..1.0).contains(&coeff));
    let mut out = Array2::zeros(frames.raw_dim());
    for (row, mut dst) in frames.outer_iter().zip(out.outer_iter_mut()) {
        if row.is_empty() {
            continue;
        }
        dst[0] = row[0] - coeff * row[0];
        for i in 1..row.len() {
            dst[i] = row[i] - coeff * row[i - 1];
        }
    }
    out
}

/// Add `factor`-scaled Gaussian noise to a frame. The caller owns the RNG so
/// dithering stays deterministic under a configured seed.
pub fn dither_1d<R: Rng>(waveform: &Array1<f32>, factor: f32, rng: &mut R) -> Array1<f32> {
    waveform.mapv(|x| x + factor * rng.sample::<f32, _>(StandardNormal))
}

/// Batch form of [`dither_1d`].
pub fn dither_2d<R: Rng>(frames: &Array2<f32>, factor: f32, rng: &mut R) -> Array2<f32> {
    frames.mapv(|x| x + factor * rng.sample::<f32, _>(StandardNormal))
}

/// Subtract the frame mean.
pub fn remove_dc_offset_1d(waveform: &Array1<f32>) -> Array1<f32> {
    let mean = waveform.mean().unwrap_or(0.0);
    waveform.mapv(|x| x - mean)
}

/// Subtract the per-frame mean.
pub fn remove_dc_offset_2d(frames: &Array2<f32>) -> Array2<f32> {
    let mut out = frames.clone();
    for mut row in out.outer_iter_mut() {
        let mean = row.mean().unwrap_or(0.0);
        row.mapv_inplace(|x| x - mean);
    }
    out
}

/// Window families applied before the FFT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Hanning,
    Sine,
    Hamming,
    Povey,
    Rectangular,
    Blackman,
}

impl std::str::FromStr for WindowKind {
    type Err = crate::errors::BrookError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hanning" => Ok(WindowKind::Hanning),
            "sine" => Ok(WindowKind::Sine),
            "hamming" => Ok(WindowKind::Hamming),
            "povey" => Ok(WindowKind::Povey),
            "rectangular" => Ok(WindowKind::Rectangular),
            "blackman" => Ok(WindowKind::Blackman),
            other => Err(FeatureError::UnknownWindow {
                name: other.to_string(),
            }
            .into()),
        }
    }
}

/// Build a window of `size` points. `blackman_coeff` is only consulted for
/// the Blackman family.
pub fn window_function(size: usize, kind: WindowKind, blackman_coeff: f32) -> Array1<f32> {
    let mut window = Array1::zeros(size);
    let a = std::f32::consts::TAU / (size as f32 - 1.0);
    for (i, w) in window.iter_mut().enumerate() {
        let x = a * i as f32;
        *w = match kind {
            WindowKind::Hanning => 0.5 - 0.5 * x.cos(),
            WindowKind::Sine => (0.5 * x).sin(),
            WindowKind::Hamming => 0.54 - 0.46 * x.cos(),
            WindowKind::Povey => (0.5 - 0.5 * x.cos()).powf(0.85),
            WindowKind::Rectangular => 1.0,
            WindowKind::Blackman => {
                blackman_coeff - 0.5 * x.cos() + (0.5 - blackman_coeff) * (2.0 * x).cos()
            }
        };
    }
    window
}

/// `log(max(sum(x^2), floor))` of one frame.
pub fn log_energy_1d(waveform: &Array1<f32>, floor: f32) -> f32 {
    let energy: f32 = waveform.iter().map(|x| x * x).sum();
    energy.max(floor).ln()
}

/// Batch form of [`log_energy_1d`].
pub fn log_energy_2d(frames: &Array2<f32>, floor: f32) -> Array1<f32> {
    frames.map_axis(Axis(1), |row| {
        let energy: f32 = row.iter().map(|x| x * x).sum();
        energy.max(floor).ln()
    })
}

/// Raise every value below `floor` up to it, in place.
pub fn apply_floor(values: &mut Array2<f32>, floor: f32) {
    values.mapv_inplace(|x| x.max(floor));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EPSILON;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_pre_emphasis_boundary() {
        let wave = arr1(&[2.0f32, 4.0, 8.0]);
        let out = pre_emphasize_1d(&wave, 0.97);
        assert_abs_diff_eq!(out[0], 2.0 * (1.0 - 0.97), epsilon = 1e-7);
        assert_abs_diff_eq!(out[1], 4.0 - 0.97 * 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pre_emphasis_batch_matches_single() {
        let wave = arr1(&[1.0f32, -2.0, 3.0, -4.0]);
        let single = pre_emphasize_1d(&wave, 0.95);
        let batch = pre_emphasize_2d(&wave.clone().insert_axis(ndarray::Axis(0)), 0.95);
        for i in 0..wave.len() {
            assert_abs_diff_eq!(single[i], batch[[0, i]], epsilon = 1e-7);
        }
    }

    #[test]
    fn test_dither_is_deterministic_under_seed() {
        let wave = arr1(&[0.0f32; 64]);
        let mut rng1 = ChaCha8Rng::seed_from_u64(7);
        let mut rng2 = ChaCha8Rng::seed_from_u64(7);
        let a = dither_1d(&wave, 1.0, &mut rng1);
        let b = dither_1d(&wave, 1.0, &mut rng2);
        assert_eq!(a, b);
        assert!(a.iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_dc_removal_zeroes_mean() {
        let wave = arr1(&[1.0f32, 2.0, 3.0, 4.0]);
        let out = remove_dc_offset_1d(&wave);
        assert_abs_diff_eq!(out.sum(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_povey_window_endpoints() {
        let window = window_function(400, WindowKind::Povey, 0.42);
        assert_abs_diff_eq!(window[0], 0.0, epsilon = 1e-7);
        assert!(window[200] > 0.99);
    }

    #[test]
    fn test_rectangular_window_is_flat() {
        let window = window_function(16, WindowKind::Rectangular, 0.42);
        assert!(window.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn test_log_energy_floor() {
        let silent = arr1(&[0.0f32; 400]);
        assert_abs_diff_eq!(log_energy_1d(&silent, EPSILON), EPSILON.ln(), epsilon = 1e-5);
    }
}
