//! Mel filter bank, DCT matrix and cepstral lifter.

use ndarray::{Array1, Array2};

use crate::errors::{ConfigError, Result};

/// Hz -> mel.
pub fn mel_scale(freq: f32) -> f32 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

/// mel -> Hz.
pub fn inverse_mel_scale(mel_freq: f32) -> f32 {
    700.0 * ((mel_freq / 1127.0).exp() - 1.0)
}

/// Triangular mel filters as a dense `(fftLen/2 + 1, numBins)` matrix, ready
/// to right-multiply a power spectrum.
///
/// `high_freq <= 0` means Nyquist + `high_freq`.
pub fn mel_bank(
    num_bins: usize,
    rate: u32,
    fft_len: usize,
    low_freq: i32,
    high_freq: i32,
) -> Result<Array2<f32>> {
    if num_bins < 3 {
        return Err(ConfigError::InvalidOption {
            option: "num_bins",
            reason: format!("need at least 3 filters, got {num_bins}"),
        }
        .into());
    }
    if !fft_len.is_power_of_two() {
        return Err(ConfigError::InvalidOption {
            option: "fft_len",
            reason: format!("{fft_len} is not a power of two"),
        }
        .into());
    }
    if low_freq < 0 {
        return Err(ConfigError::InvalidOption {
            option: "low_freq",
            reason: format!("must be non-negative, got {low_freq}"),
        }
        .into());
    }
    let nyquist = rate as f32 / 2.0;
    let high_freq = if high_freq <= 0 {
        nyquist + high_freq as f32
    } else {
        high_freq as f32
    };
    if high_freq <= low_freq as f32 || high_freq > nyquist {
        return Err(ConfigError::InvalidOption {
            option: "high_freq",
            reason: format!("({low_freq}, {high_freq}) is not a valid band below {nyquist} Hz"),
        }
        .into());
    }

    let num_fft_bins = fft_len / 2;
    let fft_bin_width = rate as f32 / fft_len as f32;
    let mel_low = mel_scale(low_freq as f32);
    let mel_high = mel_scale(high_freq);
    let mel_delta = (mel_high - mel_low) / (num_bins as f32 + 1.0);

    let mut bank = Array2::zeros((num_fft_bins + 1, num_bins));
    for bin in 0..num_bins {
        let left_mel = mel_low + bin as f32 * mel_delta;
        let center_mel = mel_low + (bin as f32 + 1.0) * mel_delta;
        let right_mel = mel_low + (bin as f32 + 2.0) * mel_delta;
        for i in 0..num_fft_bins {
            let mel = mel_scale(fft_bin_width * i as f32);
            if mel > left_mel && mel < right_mel {
                bank[[i, bin]] = if mel <= center_mel {
                    (mel - left_mel) / (center_mel - left_mel)
                } else {
                    (right_mel - mel) / (right_mel - center_mel)
                };
            }
        }
    }
    Ok(bank)
}

/// Orthonormal type-II DCT matrix of shape `(num_bins, num_ceps)`.
pub fn dct_matrix(num_ceps: usize, num_bins: usize) -> Array2<f32> {
    debug_assert!(num_ceps > 0 && num_bins > 0);
    let mut dct = Array2::zeros((num_bins, num_ceps));
    let first = (1.0 / num_bins as f32).sqrt();
    let normalizer = (2.0 / num_bins as f32).sqrt();
    for j in 0..num_bins {
        dct[[j, 0]] = first;
    }
    for i in 1..num_ceps {
        for j in 0..num_bins {
            dct[[j, i]] =
                normalizer * (std::f32::consts::PI / num_bins as f32 * (j as f32 + 0.5) * i as f32).cos();
        }
    }
    dct
}

/// Cepstral lifter coefficients: `1 + 0.5 * factor * sin(pi * i / factor)`.
pub fn lifter_coeffs(dim: usize, factor: f32) -> Array1<f32> {
    debug_assert!(factor > 0.0);
    Array1::from_iter(
        (0..dim).map(|i| 1.0 + 0.5 * factor * (std::f32::consts::PI * i as f32 / factor).sin()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mel_scale_round_trip() {
        for freq in [20.0, 440.0, 4000.0, 7800.0] {
            assert_abs_diff_eq!(inverse_mel_scale(mel_scale(freq)), freq, epsilon = 0.5);
        }
    }

    #[test]
    fn test_mel_bank_partition_of_unity() {
        let bank = mel_bank(23, 16000, 512, 20, 0).unwrap();
        // Inside the shared support of two adjacent filters the weights sum
        // to one.
        let mut checked = 0;
        for i in 1..bank.nrows() - 1 {
            let row = bank.row(i);
            let active: Vec<f32> = row.iter().copied().filter(|&w| w > 0.0).collect();
            if active.len() == 2 {
                assert_abs_diff_eq!(active[0] + active[1], 1.0, epsilon = 1e-4);
                checked += 1;
            }
        }
        assert!(checked > 50, "too few interior bins checked: {checked}");
    }

    #[test]
    fn test_mel_bank_rejects_inverted_band() {
        assert!(mel_bank(23, 16000, 512, 4000, 100).is_err());
    }

    #[test]
    fn test_dct_columns_are_orthonormal() {
        let dct = dct_matrix(13, 23);
        for i in 0..13 {
            for j in 0..13 {
                let dot: f32 = dct.column(i).dot(&dct.column(j));
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(dot, expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_lifter_starts_at_one() {
        let coeffs = lifter_coeffs(13, 22.0);
        assert_abs_diff_eq!(coeffs[0], 1.0, epsilon = 1e-6);
        assert!(coeffs.iter().skip(1).all(|&c| c > 1.0));
    }
}
