//! Frame-batch feature extractors.
//!
//! Every extractor shares one driver: frames are collected from the input
//! queue into a batch, the batch is handed to a pure extract function, and
//! the result is emitted as one matrix packet. Batches at or above
//! `min_parallel_size` are halved and the two halves computed on parallel
//! rayon threads.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ndarray::{concatenate, s, Array1, Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::warn;

use crate::component::{Action, InputArity, Node, StageCore, StageContext, Worker};
use crate::config::{RuntimeConfig, EPSILON};
use crate::dsp::{
    dct_matrix, dither_2d, lifter_coeffs, log_energy_2d, mel_bank, padded_fft_length,
    power_spectrum_2d, pre_emphasize_2d, remove_dc_offset_2d, srfft_2d, window_function,
    WindowKind,
};
use crate::errors::{ConfigError, FeatureError, GraphError, Result};
use crate::packet::{Packet, Payload};

/// Pure batch-to-features function: frames in, named feature matrices out.
pub type ExtractFn = dyn Fn(&Array2<f32>) -> Result<Vec<(String, Array2<f32>)>> + Send + Sync;

fn invalid(option: &'static str, reason: impl Into<String>) -> crate::errors::BrookError {
    ConfigError::InvalidOption {
        option,
        reason: reason.into(),
    }
    .into()
}

/// Options shared by every extractor family.
#[derive(Debug, Clone)]
pub struct FrameTraits {
    /// Samples per frame.
    pub frame_dim: usize,
    /// Frames per dispatched batch.
    pub batch_size: usize,
    /// Batches at least this large are split across two threads.
    pub min_parallel_size: usize,
    /// Energy floor (0 disables flooring).
    pub energy_floor: f32,
    /// Compute energy from the raw frame rather than the windowed one.
    pub raw_energy: bool,
    pub window: WindowKind,
    /// Dither factor (0 disables).
    pub dither: f32,
    /// Seed for the dither noise source.
    pub dither_seed: u64,
    pub remove_dc: bool,
    pub preemph_coeff: f32,
    pub blackman_coeff: f32,
    /// Slot to read; defaults to the packet's main slot.
    pub ikey: Option<String>,
}

impl Default for FrameTraits {
    fn default() -> Self {
        Self {
            frame_dim: 400,
            batch_size: 10,
            min_parallel_size: 10,
            energy_floor: 0.0,
            raw_energy: true,
            window: WindowKind::Povey,
            dither: 1.0,
            dither_seed: 0,
            remove_dc: true,
            preemph_coeff: 0.97,
            blackman_coeff: 0.42,
            ikey: None,
        }
    }
}

impl FrameTraits {
    fn validate(&self) -> Result<()> {
        if self.frame_dim < 2 {
            return Err(invalid("frame_dim", "need at least 2 samples per frame"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be positive"));
        }
        if self.min_parallel_size < 2 {
            return Err(invalid("min_parallel_size", "must be at least 2"));
        }
        if self.energy_floor < 0.0 {
            return Err(invalid("energy_floor", "must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.preemph_coeff) {
            return Err(invalid("preemph_coeff", "must lie in [0, 1]"));
        }
        if !(0.0..0.5).contains(&self.blackman_coeff) || self.blackman_coeff == 0.0 {
            return Err(invalid("blackman_coeff", "must lie in (0, 0.5)"));
        }
        if self.dither < 0.0 {
            return Err(invalid("dither", "must be non-negative"));
        }
        Ok(())
    }
}

/// The waveform-domain front shared by all extractor families: dither, DC
/// removal, raw energy, pre-emphasis, windowing, FFT, power spectrum.
struct FrontEnd {
    dither: f32,
    rng: Mutex<ChaCha8Rng>,
    remove_dc: bool,
    raw_energy: bool,
    preemph_coeff: f32,
    window: Array1<f32>,
    // ln of the configured floor, or 0.0 when flooring is off.
    energy_floor_ln: f32,
}

impl FrontEnd {
    fn new(traits: &FrameTraits) -> Self {
        Self {
            dither: traits.dither,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(traits.dither_seed)),
            remove_dc: traits.remove_dc,
            raw_energy: traits.raw_energy,
            preemph_coeff: traits.preemph_coeff,
            window: window_function(traits.frame_dim, traits.window, traits.blackman_coeff),
            energy_floor_ln: if traits.energy_floor > 0.0 {
                traits.energy_floor.ln()
            } else {
                0.0
            },
        }
    }

    /// Power spectrum plus per-frame log-energies.
    fn run(&self, frames: &Array2<f32>) -> (Array2<f32>, Array1<f32>) {
        let mut work = if self.dither != 0.0 {
            let mut rng = self.rng.lock().unwrap();
            dither_2d(frames, self.dither, &mut *rng)
        } else {
            frames.clone()
        };
        if self.remove_dc {
            work = remove_dc_offset_2d(&work);
        }
        let mut energies = if self.raw_energy {
            log_energy_2d(&work, EPSILON)
        } else {
            Array1::zeros(work.nrows())
        };
        if self.preemph_coeff > 0.0 {
            work = pre_emphasize_2d(&work, self.preemph_coeff);
        }
        for mut row in work.outer_iter_mut() {
            row *= &self.window;
        }
        if !self.raw_energy {
            energies = log_energy_2d(&work, EPSILON);
        }
        if self.energy_floor_ln != 0.0 {
            energies.mapv_inplace(|e| e.max(self.energy_floor_ln));
        }
        let (_, packed) = srfft_2d(&work);
        (power_spectrum_2d(&packed), energies)
    }
}

fn floored_ln(mut mat: Array2<f32>) -> Array2<f32> {
    mat.mapv_inplace(|x| x.max(EPSILON).ln());
    mat
}

// ---------------------------------------------------------------------------
// The shared batch driver
// ---------------------------------------------------------------------------

struct ExtractWorker {
    frame_dim: usize,
    batch_size: usize,
    min_parallel: usize,
    ikey: Option<String>,
    extract: Arc<ExtractFn>,
    pending: VecDeque<Array1<f32>>,
    endpoint_step: bool,
    final_step: bool,
    warned_frames: bool,
}

impl ExtractWorker {
    fn new(
        frame_dim: usize,
        batch_size: usize,
        min_parallel: usize,
        ikey: Option<String>,
        extract: Arc<ExtractFn>,
    ) -> Self {
        Self {
            frame_dim,
            batch_size,
            min_parallel,
            ikey,
            extract,
            pending: VecDeque::new(),
            endpoint_step: false,
            final_step: false,
            warned_frames: false,
        }
    }

    fn push_frames(&mut self, ctx: &StageContext, packet: &Packet) -> Result<()> {
        let key = match &self.ikey {
            Some(k) => k.as_str(),
            None => ctx.input_key(packet)?,
        };
        let payload = packet.get(key).ok_or_else(|| GraphError::MissingKey {
            stage: ctx.name().to_string(),
            key: key.to_string(),
        })?;
        match payload {
            Payload::Vector(vec) => {
                self.check_dim(vec.len())?;
                self.pending.push_back(vec.clone());
            }
            Payload::Matrix(mat) => {
                self.check_dim(mat.ncols())?;
                for row in mat.outer_iter() {
                    self.pending.push_back(row.to_owned());
                }
            }
            other => {
                return Err(GraphError::PayloadMismatch {
                    stage: ctx.name().to_string(),
                    expected: "vector or matrix",
                    actual: other.kind(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn check_dim(&self, dim: usize) -> Result<()> {
        if dim != self.frame_dim {
            return Err(FeatureError::ShapeMismatch {
                context: "extractor frame".to_string(),
                expected: self.frame_dim,
                actual: dim,
            }
            .into());
        }
        Ok(())
    }

    fn dispatch(&mut self, ctx: &mut StageContext) -> Result<()> {
        let tail = self.pending.len().min(self.batch_size);
        if tail == 0 {
            return Ok(());
        }
        let mut batch = Array2::zeros((tail, self.frame_dim));
        for i in 0..tail {
            batch
                .row_mut(i)
                .assign(&self.pending.pop_front().unwrap());
        }

        let outputs = if tail >= self.min_parallel {
            let mid = tail / 2;
            let head = batch.slice(s![0..mid, ..]).to_owned();
            let rest = batch.slice(s![mid.., ..]).to_owned();
            let extract = Arc::clone(&self.extract);
            let (a, b) = rayon::join(move || (extract)(&head), {
                let extract = Arc::clone(&self.extract);
                move || (extract)(&rest)
            });
            let (a, b) = (a?, b?);
            let mut merged = Vec::with_capacity(a.len());
            for ((key, top), (_, bottom)) in a.into_iter().zip(b.into_iter()) {
                merged.push((key, concatenate![Axis(0), top, bottom]));
            }
            merged
        } else {
            (self.extract)(&batch)?
        };

        if !self.warned_frames {
            if let Some((_, first)) = outputs.first() {
                if first.nrows() != tail {
                    warn!(
                        stage = ctx.name(),
                        expected = tail,
                        actual = first.nrows(),
                        "extract function changed the frame count"
                    );
                    self.warned_frames = true;
                }
            }
        }

        let slots = outputs
            .into_iter()
            .map(|(key, mat)| (key, Payload::Matrix(mat)))
            .collect();
        let cid = ctx.next_cid();
        ctx.put_packet(Packet::from_slots(slots, cid, ctx.id()))
    }
}

impl Worker for ExtractWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            // Collect one batch worth of frames (or up to an endpoint).
            while self.pending.len() < self.batch_size
                && !self.endpoint_step
                && !self.final_step
            {
                match ctx.decide_action()? {
                    Action::Proceed => {
                        let packet = ctx.get_packet()?;
                        if !packet.is_empty() {
                            self.push_frames(ctx, &packet)?;
                        }
                        if packet.is_endpoint() {
                            self.endpoint_step = true;
                        }
                    }
                    Action::Final => self.final_step = true,
                    Action::Stopped => return Ok(()),
                    Action::RetryLater => ctx.yield_now(),
                }
            }

            self.dispatch(ctx)?;

            if self.endpoint_step && self.pending.is_empty() {
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                self.endpoint_step = false;
            }
            if self.final_step && self.pending.is_empty() {
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                ctx.out_pipe().stop();
                return Ok(());
            }
        }
    }

    fn on_reset(&mut self) {
        self.pending.clear();
        self.endpoint_step = false;
        self.final_step = false;
        self.warned_frames = false;
    }
}

fn build_core(
    name: &str,
    config: RuntimeConfig,
    traits: &FrameTraits,
    okeys: Vec<String>,
    extract: Arc<ExtractFn>,
) -> StageCore {
    StageCore::new(
        name,
        config,
        traits.ikey.clone(),
        okeys,
        InputArity::Exactly(1),
        1,
        ExtractWorker::new(
            traits.frame_dim,
            traits.batch_size,
            traits.min_parallel_size,
            traits.ikey.clone(),
            extract,
        ),
    )
}

// ---------------------------------------------------------------------------
// Spectrogram
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SpectrogramOptions {
    pub frame: FrameTraits,
    pub okey: String,
}

impl Default for SpectrogramOptions {
    fn default() -> Self {
        Self {
            frame: FrameTraits::default(),
            okey: "spectrogram".to_string(),
        }
    }
}

/// Log power-spectrum extractor; the first coefficient carries the frame
/// energy.
pub struct SpectrogramExtractor {
    core: StageCore,
    dim: usize,
}

impl SpectrogramExtractor {
    pub fn new(options: SpectrogramOptions, config: RuntimeConfig) -> Result<Self> {
        options.frame.validate()?;
        let front = FrontEnd::new(&options.frame);
        let extract: Arc<ExtractFn> = {
            let okey = options.okey.clone();
            Arc::new(move |frames| {
                let (power, energies) = front.run(frames);
                let mut feats = floored_ln(power);
                feats.column_mut(0).assign(&energies);
                Ok(vec![(okey.clone(), feats)])
            })
        };
        let dim = padded_fft_length(options.frame.frame_dim) / 2 + 1;
        let core = build_core(
            "SpectrogramExtractor",
            config,
            &options.frame,
            vec![options.okey],
            extract,
        );
        Ok(Self { core, dim })
    }

    pub fn feat_dim(&self) -> usize {
        self.dim
    }
}

impl Node for SpectrogramExtractor {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

// ---------------------------------------------------------------------------
// fBank
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FbankOptions {
    pub frame: FrameTraits,
    pub rate: u32,
    pub num_bins: usize,
    pub low_freq: i32,
    pub high_freq: i32,
    /// Prepend the frame energy as an extra leading dim.
    pub use_energy: bool,
    pub use_power: bool,
    pub use_log: bool,
    pub okey: String,
}

impl Default for FbankOptions {
    fn default() -> Self {
        Self {
            frame: FrameTraits::default(),
            rate: 16000,
            num_bins: 23,
            low_freq: 20,
            high_freq: 0,
            use_energy: false,
            use_power: true,
            use_log: true,
            okey: "fbank".to_string(),
        }
    }
}

/// Mel filter-bank extractor.
pub struct FbankExtractor {
    core: StageCore,
    dim: usize,
}

impl FbankExtractor {
    pub fn new(options: FbankOptions, config: RuntimeConfig) -> Result<Self> {
        options.frame.validate()?;
        let fft_len = padded_fft_length(options.frame.frame_dim);
        let filters = mel_bank(
            options.num_bins,
            options.rate,
            fft_len,
            options.low_freq,
            options.high_freq,
        )?;
        let front = FrontEnd::new(&options.frame);
        let use_energy = options.use_energy;
        let use_power = options.use_power;
        let use_log = options.use_log;
        let extract: Arc<ExtractFn> = {
            let okey = options.okey.clone();
            Arc::new(move |frames| {
                let (mut power, energies) = front.run(frames);
                if !use_power {
                    power.mapv_inplace(|x| x.sqrt());
                }
                let mut feats = power.dot(&filters);
                if use_log {
                    feats = floored_ln(feats);
                }
                if use_energy {
                    let col = energies.insert_axis(Axis(1));
                    feats = concatenate![Axis(1), col, feats];
                }
                Ok(vec![(okey.clone(), feats)])
            })
        };
        let dim = options.num_bins + usize::from(options.use_energy);
        let core = build_core(
            "FbankExtractor",
            config,
            &options.frame,
            vec![options.okey],
            extract,
        );
        Ok(Self { core, dim })
    }

    pub fn feat_dim(&self) -> usize {
        self.dim
    }
}

impl Node for FbankExtractor {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

// ---------------------------------------------------------------------------
// MFCC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MfccOptions {
    pub frame: FrameTraits,
    pub rate: u32,
    pub num_bins: usize,
    pub low_freq: i32,
    pub high_freq: i32,
    pub num_ceps: usize,
    pub cepstral_lifter: f32,
    /// Replace the first coefficient with the frame energy.
    pub use_energy: bool,
    pub okey: String,
}

impl Default for MfccOptions {
    fn default() -> Self {
        Self {
            frame: FrameTraits::default(),
            rate: 16000,
            num_bins: 23,
            low_freq: 20,
            high_freq: 0,
            num_ceps: 13,
            cepstral_lifter: 22.0,
            use_energy: true,
            okey: "mfcc".to_string(),
        }
    }
}

/// Mel-frequency cepstral coefficient extractor.
pub struct MfccExtractor {
    core: StageCore,
    dim: usize,
}

impl MfccExtractor {
    pub fn new(options: MfccOptions, config: RuntimeConfig) -> Result<Self> {
        options.frame.validate()?;
        if options.num_ceps == 0 || options.num_ceps > options.num_bins {
            return Err(invalid("num_ceps", "must lie in (0, num_bins]"));
        }
        if options.cepstral_lifter < 0.0 {
            return Err(invalid("cepstral_lifter", "must be non-negative"));
        }
        let fft_len = padded_fft_length(options.frame.frame_dim);
        let filters = mel_bank(
            options.num_bins,
            options.rate,
            fft_len,
            options.low_freq,
            options.high_freq,
        )?;
        let dct = dct_matrix(options.num_ceps, options.num_bins);
        let lifter = if options.cepstral_lifter > 0.0 {
            Some(lifter_coeffs(options.num_ceps, options.cepstral_lifter))
        } else {
            None
        };
        let front = FrontEnd::new(&options.frame);
        let use_energy = options.use_energy;
        let extract: Arc<ExtractFn> = {
            let okey = options.okey.clone();
            Arc::new(move |frames| {
                let (power, energies) = front.run(frames);
                let mel = floored_ln(power.dot(&filters));
                let mut feats = mel.dot(&dct);
                if let Some(lifter) = &lifter {
                    for mut row in feats.outer_iter_mut() {
                        row *= lifter;
                    }
                }
                if use_energy {
                    feats.column_mut(0).assign(&energies);
                }
                Ok(vec![(okey.clone(), feats)])
            })
        };
        let dim = options.num_ceps;
        let core = build_core(
            "MfccExtractor",
            config,
            &options.frame,
            vec![options.okey],
            extract,
        );
        Ok(Self { core, dim })
    }

    pub fn feat_dim(&self) -> usize {
        self.dim
    }
}

impl Node for MfccExtractor {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

// ---------------------------------------------------------------------------
// Mixture
// ---------------------------------------------------------------------------

/// Which feature families a mixture extractor computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixType {
    Spectrogram,
    Fbank,
    Mfcc,
}

impl MixType {
    fn key(&self) -> &'static str {
        match self {
            MixType::Spectrogram => "spectrogram",
            MixType::Fbank => "fbank",
            MixType::Mfcc => "mfcc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MixtureOptions {
    pub frame: FrameTraits,
    pub mix_types: Vec<MixType>,
    pub rate: u32,
    pub num_bins: usize,
    pub low_freq: i32,
    pub high_freq: i32,
    pub use_energy_for_fbank: bool,
    pub use_power_for_fbank: bool,
    pub use_log_for_fbank: bool,
    pub use_energy_for_mfcc: bool,
    pub num_ceps: usize,
    pub cepstral_lifter: f32,
}

impl Default for MixtureOptions {
    fn default() -> Self {
        Self {
            frame: FrameTraits::default(),
            mix_types: vec![MixType::Mfcc, MixType::Fbank],
            rate: 16000,
            num_bins: 23,
            low_freq: 20,
            high_freq: 0,
            use_energy_for_fbank: true,
            use_power_for_fbank: true,
            use_log_for_fbank: true,
            use_energy_for_mfcc: true,
            num_ceps: 13,
            cepstral_lifter: 22.0,
        }
    }
}

/// Computes several feature families from one shared power spectrum and
/// emits them as separate named slots of a single packet.
pub struct MixtureExtractor {
    core: StageCore,
}

impl MixtureExtractor {
    pub fn new(options: MixtureOptions, config: RuntimeConfig) -> Result<Self> {
        options.frame.validate()?;
        if options.mix_types.len() < 2 {
            return Err(invalid("mix_types", "a mixture needs at least two types"));
        }
        let mut seen = Vec::new();
        for t in &options.mix_types {
            if seen.contains(t) {
                return Err(invalid("mix_types", format!("{t:?} listed twice")));
            }
            seen.push(*t);
        }
        if options.num_ceps == 0 || options.num_ceps > options.num_bins {
            return Err(invalid("num_ceps", "must lie in (0, num_bins]"));
        }

        let fft_len = padded_fft_length(options.frame.frame_dim);
        let filters = mel_bank(
            options.num_bins,
            options.rate,
            fft_len,
            options.low_freq,
            options.high_freq,
        )?;
        let dct = dct_matrix(options.num_ceps, options.num_bins);
        let lifter = if options.cepstral_lifter > 0.0 {
            Some(lifter_coeffs(options.num_ceps, options.cepstral_lifter))
        } else {
            None
        };
        let front = FrontEnd::new(&options.frame);
        let opts = options.clone();
        let extract: Arc<ExtractFn> = Arc::new(move |frames| {
            let (power, energies) = front.run(frames);
            let mut out = Vec::with_capacity(opts.mix_types.len());
            for mix in &opts.mix_types {
                let feats = match mix {
                    MixType::Spectrogram => {
                        let mut spec = floored_ln(power.clone());
                        spec.column_mut(0).assign(&energies);
                        spec
                    }
                    MixType::Fbank => {
                        let mut base = power.clone();
                        if !opts.use_power_for_fbank {
                            base.mapv_inplace(|x| x.sqrt());
                        }
                        let mut feats = base.dot(&filters);
                        if opts.use_log_for_fbank {
                            feats = floored_ln(feats);
                        }
                        if opts.use_energy_for_fbank {
                            let col = energies.clone().insert_axis(Axis(1));
                            feats = concatenate![Axis(1), col, feats];
                        }
                        feats
                    }
                    MixType::Mfcc => {
                        let mel = floored_ln(power.dot(&filters));
                        let mut feats = mel.dot(&dct);
                        if let Some(lifter) = &lifter {
                            for mut row in feats.outer_iter_mut() {
                                row *= lifter;
                            }
                        }
                        if opts.use_energy_for_mfcc {
                            feats.column_mut(0).assign(&energies);
                        }
                        feats
                    }
                };
                out.push((mix.key().to_string(), feats));
            }
            Ok(out)
        });

        let okeys = options
            .mix_types
            .iter()
            .map(|t| t.key().to_string())
            .collect();
        let core = build_core(
            "MixtureExtractor",
            config,
            &options.frame,
            okeys,
            extract,
        );
        Ok(Self { core })
    }
}

impl Node for MixtureExtractor {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::Pipe;
    use ndarray::Array1;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn tone_frames(n: usize, dim: usize) -> Vec<Array1<f32>> {
        (0..n)
            .map(|f| {
                Array1::from_iter(
                    (0..dim).map(|i| (((f * dim + i) as f32) * 0.03).sin() * 1000.0),
                )
            })
            .collect()
    }

    fn quiet_traits() -> FrameTraits {
        FrameTraits {
            dither: 0.0,
            ..Default::default()
        }
    }

    fn feed(pipe: &Pipe, frames: Vec<Array1<f32>>) {
        for (cid, frame) in frames.into_iter().enumerate() {
            pipe.put(Packet::new("wave", Payload::Vector(frame), cid as u64, 0))
                .unwrap();
        }
        pipe.stop();
    }

    #[test]
    fn test_mfcc_extractor_shapes() {
        let config = cfg();
        let input = Pipe::new("frames", &config);
        feed(&input, tone_frames(25, 400));

        let options = MfccOptions {
            frame: quiet_traits(),
            ..Default::default()
        };
        let mut extractor = MfccExtractor::new(options, config).unwrap();
        assert_eq!(extractor.feat_dim(), 13);
        extractor.start(vec![input]).unwrap();
        extractor.wait().unwrap();

        let groups = extractor.out_pipe().to_list().unwrap();
        assert_eq!(groups.len(), 1);
        let total: usize = groups[0]
            .iter()
            .map(|p| p.main().unwrap().as_matrix().unwrap().nrows())
            .sum();
        assert_eq!(total, 25);
        for packet in &groups[0] {
            assert_eq!(packet.main_key(), Some("mfcc"));
            assert_eq!(packet.main().unwrap().as_matrix().unwrap().ncols(), 13);
        }
    }

    #[test]
    fn test_fbank_energy_prepends_dim() {
        let config = cfg();
        let input = Pipe::new("frames", &config);
        feed(&input, tone_frames(10, 400));

        let options = FbankOptions {
            frame: quiet_traits(),
            use_energy: true,
            ..Default::default()
        };
        let mut extractor = FbankExtractor::new(options, config).unwrap();
        assert_eq!(extractor.feat_dim(), 24);
        extractor.start(vec![input]).unwrap();
        extractor.wait().unwrap();

        let groups = extractor.out_pipe().to_list().unwrap();
        let mat = groups[0][0].main().unwrap().as_matrix().unwrap().clone();
        assert_eq!(mat.ncols(), 24);
    }

    #[test]
    fn test_spectrogram_dim_is_half_fft_plus_one() {
        let config = cfg();
        let input = Pipe::new("frames", &config);
        feed(&input, tone_frames(10, 400));

        let options = SpectrogramOptions {
            frame: quiet_traits(),
            ..Default::default()
        };
        let mut extractor = SpectrogramExtractor::new(options, config).unwrap();
        assert_eq!(extractor.feat_dim(), 257);
        extractor.start(vec![input]).unwrap();
        extractor.wait().unwrap();

        let groups = extractor.out_pipe().to_list().unwrap();
        let mat = groups[0][0].main().unwrap().as_matrix().unwrap().clone();
        assert_eq!(mat.ncols(), 257);
    }

    #[test]
    fn test_mixture_carries_separate_keys() {
        let config = cfg();
        let input = Pipe::new("frames", &config);
        feed(&input, tone_frames(10, 400));

        let options = MixtureOptions {
            frame: quiet_traits(),
            ..Default::default()
        };
        let mut extractor = MixtureExtractor::new(options, config).unwrap();
        extractor.start(vec![input]).unwrap();
        extractor.wait().unwrap();

        let groups = extractor.out_pipe().to_list().unwrap();
        let packet = &groups[0][0];
        let mfcc = packet.get("mfcc").unwrap().as_matrix().unwrap();
        let fbank = packet.get("fbank").unwrap().as_matrix().unwrap();
        assert_eq!(mfcc.ncols(), 13);
        assert_eq!(fbank.ncols(), 24);
        assert_eq!(mfcc.nrows(), fbank.nrows());
    }

    #[test]
    fn test_parallel_split_matches_serial() {
        // Same input through a serial-only and a parallel-splitting
        // extractor must agree exactly (dither off).
        let config = cfg();
        let frames = tone_frames(20, 400);

        let run = |min_parallel: usize| {
            let input = Pipe::new("frames", &cfg());
            feed(&input, frames.clone());
            let options = MfccOptions {
                frame: FrameTraits {
                    dither: 0.0,
                    batch_size: 20,
                    min_parallel_size: min_parallel,
                    ..Default::default()
                },
                ..Default::default()
            };
            let mut extractor = MfccExtractor::new(options, config.clone()).unwrap();
            extractor.start(vec![input]).unwrap();
            extractor.wait().unwrap();
            let groups = extractor.out_pipe().to_list().unwrap();
            groups[0][0].main().unwrap().as_matrix().unwrap().clone()
        };

        let serial = run(1000);
        let parallel = run(2);
        assert_eq!(serial.dim(), parallel.dim());
        for (a, b) in serial.iter().zip(parallel.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn test_rejects_bad_options() {
        let config = cfg();
        assert!(MfccExtractor::new(
            MfccOptions {
                num_ceps: 40,
                ..Default::default()
            },
            config.clone()
        )
        .is_err());
        assert!(FbankExtractor::new(
            FbankOptions {
                num_bins: 1,
                ..Default::default()
            },
            config.clone()
        )
        .is_err());
        assert!(MixtureExtractor::new(
            MixtureOptions {
                mix_types: vec![MixType::Mfcc, MixType::Mfcc],
                ..Default::default()
            },
            config
        )
        .is_err());
    }
}
