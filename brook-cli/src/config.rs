//! TOML configuration for the command-line front end.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use brook_core::config::RuntimeConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderSection {
    pub chunk_size: usize,
    pub simulate: bool,
}

impl Default for ReaderSection {
    fn default() -> Self {
        Self {
            chunk_size: 480,
            simulate: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSection {
    pub width: usize,
    pub shift: usize,
    pub batch_size: usize,
}

impl Default for FrameSection {
    fn default() -> Self {
        Self {
            width: 400,
            shift: 160,
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MfccSection {
    pub num_bins: usize,
    pub num_ceps: usize,
    pub low_freq: i32,
    pub high_freq: i32,
    pub cepstral_lifter: f32,
    pub use_energy: bool,
    pub dither: f32,
    pub dither_seed: u64,
    pub preemph_coeff: f32,
    pub remove_dc: bool,
    pub window: String,
}

impl Default for MfccSection {
    fn default() -> Self {
        Self {
            num_bins: 23,
            num_ceps: 13,
            low_freq: 20,
            high_freq: 0,
            cepstral_lifter: 22.0,
            use_energy: true,
            dither: 0.0,
            dither_seed: 0,
            preemph_coeff: 0.97,
            remove_dc: true,
            window: "povey".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSection {
    pub batch_size: usize,
    pub delta: usize,
    pub delta_window: usize,
    pub splice_left: usize,
    pub splice_right: usize,
    pub lda: Option<PathBuf>,
    /// Sliding CMVN window; 0 disables CMVN.
    pub cmvn_width: usize,
    pub cmvn_std: bool,
    pub global_stats: Option<PathBuf>,
}

impl Default for ProcessorSection {
    fn default() -> Self {
        Self {
            batch_size: 32,
            delta: 2,
            delta_window: 2,
            splice_left: 0,
            splice_right: 0,
            lda: None,
            cmvn_width: 600,
            cmvn_std: false,
            global_stats: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorSection {
    pub left_context: usize,
    pub right_context: usize,
    pub apply_softmax: bool,
    pub apply_log: bool,
}

impl Default for EstimatorSection {
    fn default() -> Self {
        Self {
            left_context: 0,
            right_context: 0,
            apply_softmax: false,
            apply_log: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderSection {
    pub cmd_root: PathBuf,
    pub symbol_table: PathBuf,
    pub tmodel: PathBuf,
    pub graph: PathBuf,
    pub word_boundary: Option<PathBuf>,
    pub silence_phones: String,
    pub frame_shift_sec: f64,
    pub n_bests: usize,
    pub beam: f64,
    pub max_active: usize,
    pub min_active: usize,
    pub lattice_beam: f64,
    pub prune_interval: usize,
    pub acoustic_scale: f32,
    pub lm_scale: f64,
    pub allow_partial: bool,
    pub max_batch_size: usize,
    pub pdf_dim: Option<usize>,
}

impl Default for DecoderSection {
    fn default() -> Self {
        Self {
            cmd_root: PathBuf::new(),
            symbol_table: PathBuf::new(),
            tmodel: PathBuf::new(),
            graph: PathBuf::new(),
            word_boundary: None,
            silence_phones: "1".to_string(),
            frame_shift_sec: 0.01,
            n_bests: 10,
            beam: 16.0,
            max_active: 7000,
            min_active: 200,
            lattice_beam: 10.0,
            prune_interval: 25,
            acoustic_scale: 0.1,
            lm_scale: 1.0,
            allow_partial: false,
            max_batch_size: 100,
            pdf_dim: None,
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub wave_file: Option<PathBuf>,
    pub runtime: RuntimeConfig,
    pub reader: ReaderSection,
    pub frame: FrameSection,
    pub mfcc: MfccSection,
    pub processor: ProcessorSection,
    pub estimator: EstimatorSection,
    pub decoder: DecoderSection,
}

impl CliConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading config {}", path.display()))?;
        toml::from_str(&content)
            .wrap_err_with(|| format!("parsing config {}", path.display()))
    }
}
