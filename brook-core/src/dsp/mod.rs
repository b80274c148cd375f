//! Numerical kernels for the feature pipeline.
//!
//! Every kernel is a pure function on ndarray inputs with a 1-d form and a
//! 2-d batch form; all arithmetic is single precision and every logarithm is
//! floored at [`crate::config::EPSILON`].

pub mod fft;
pub mod kernels;
pub mod mel;
pub mod transform;

pub use fft::{padded_fft_length, power_spectrum_1d, power_spectrum_2d, srfft_1d, srfft_2d};
pub use kernels::{
    apply_floor, dither_1d, dither_2d, log_energy_1d, log_energy_2d, pre_emphasize_1d,
    pre_emphasize_2d, remove_dc_offset_1d, remove_dc_offset_2d, window_function, WindowKind,
};
pub use mel::{dct_matrix, inverse_mel_scale, lifter_coeffs, mel_bank, mel_scale};
pub use transform::{add_deltas, splice_feats};
