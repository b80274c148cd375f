//! Stream adapters: audio sources and frame-shaping stages.
//!
//! Sources emit one `Element` packet per sample. The frame cutter turns the
//! element stream into windowed frames; the dissolver is its inverse for
//! testing. Batcher and subsetter reshape vector/matrix streams, and the
//! vector VAD drops long silence or truncates it into an endpoint.

use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use ndarray::{s, Array1, Array2};

use crate::component::{Action, InputArity, Node, StageCore, StageContext, Worker};
use crate::config::{RuntimeConfig, StreamInfo};
use crate::errors::{ConfigError, FeatureError, GraphError, Result};
use crate::packet::{Packet, Payload, Scalar};
use crate::pipe::PipeState;

// ---------------------------------------------------------------------------
// Wave file helpers
// ---------------------------------------------------------------------------

/// A fully loaded waveform.
#[derive(Debug, Clone)]
pub struct WaveData {
    pub rate: u32,
    pub channels: u16,
    /// Sample width in bytes.
    pub width: u16,
    /// Frames per channel.
    pub points: usize,
    pub duration: f64,
    /// Interleaved samples.
    pub samples: Vec<i16>,
}

/// Read a PCM wave file.
pub fn read_wave(path: impl AsRef<Path>) -> Result<WaveData> {
    let path = path.as_ref();
    let mut reader = WavReader::open(path).map_err(|e| ConfigError::InvalidOption {
        option: "wave_file",
        reason: format!("{}: {e}", path.display()),
    })?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(ConfigError::InvalidOption {
            option: "wave_file",
            reason: format!(
                "{}: only 16-bit integer PCM is supported",
                path.display()
            ),
        }
        .into());
    }
    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ConfigError::InvalidOption {
            option: "wave_file",
            reason: format!("{}: {e}", path.display()),
        })?;
    let points = samples.len() / spec.channels as usize;
    Ok(WaveData {
        rate: spec.sample_rate,
        channels: spec.channels,
        width: 2,
        points,
        duration: points as f64 / spec.sample_rate as f64,
        samples,
    })
}

/// Write 16-bit PCM samples to a wave file.
pub fn write_wave(
    samples: &[i16],
    path: impl AsRef<Path>,
    rate: u32,
    channels: u16,
) -> Result<()> {
    let spec = WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path.as_ref(), spec).map_err(|e| {
        ConfigError::InvalidOption {
            option: "wave_file",
            reason: e.to_string(),
        }
    })?;
    for &sample in samples {
        writer.write_sample(sample).map_err(|e| ConfigError::InvalidOption {
            option: "wave_file",
            reason: e.to_string(),
        })?;
    }
    writer.finalize().map_err(|e| ConfigError::InvalidOption {
        option: "wave_file",
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Cut a waveform into overlapping frames. With `snip` the incomplete tail
/// frame is discarded, otherwise it is zero-padded.
pub fn cut_frames(waveform: &Array1<f32>, width: usize, shift: usize, snip: bool) -> Array2<f32> {
    debug_assert!(width > 0 && shift > 0 && shift <= width);
    let points = waveform.len();
    if points < width {
        return Array2::zeros((0, width));
    }
    let mut n = (points - width) / shift + 1;
    if !snip && n * shift + (width - shift) < points {
        n += 1;
    }
    let mut out = Array2::zeros((n, width));
    for i in 0..n {
        let offset = i * shift;
        let rest = width.min(points - offset);
        out.slice_mut(s![i, 0..rest])
            .assign(&waveform.slice(s![offset..offset + rest]));
    }
    out
}

// ---------------------------------------------------------------------------
// Voice activity gating
// ---------------------------------------------------------------------------

/// What to do with one chunk of audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// Keep the chunk.
    Speech,
    /// Discard the chunk.
    Silence,
    /// Discard the chunk and mark an endpoint.
    Truncate,
}

/// Patience-counting gate around a caller-supplied speech predicate.
///
/// Chunks stay kept until `patience` consecutive silent chunks have been
/// seen; at exactly `patience` the stream is either truncated into an
/// endpoint or silently dropped from then on.
pub struct VadGate {
    patience: usize,
    truncate: bool,
    silence_counter: usize,
    predicate: Box<dyn FnMut(&[i16]) -> bool + Send>,
}

impl VadGate {
    pub fn new(
        patience: usize,
        truncate: bool,
        predicate: Box<dyn FnMut(&[i16]) -> bool + Send>,
    ) -> Self {
        debug_assert!(patience > 0);
        Self {
            patience,
            truncate,
            silence_counter: 0,
            predicate,
        }
    }

    pub fn reset(&mut self) {
        self.silence_counter = 0;
    }

    pub fn detect(&mut self, chunk: &[i16]) -> VadDecision {
        if (self.predicate)(chunk) {
            self.silence_counter = 0;
            return VadDecision::Speech;
        }
        self.silence_counter += 1;
        if self.silence_counter == self.patience {
            if self.truncate {
                VadDecision::Truncate
            } else {
                VadDecision::Silence
            }
        } else if self.silence_counter > self.patience {
            VadDecision::Silence
        } else {
            VadDecision::Speech
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A pull-based producer of 16-bit samples (a microphone handle, a ring
/// buffer fed by a sound API, ...). An empty return ends the stream.
pub trait SampleSource: Send {
    fn read(&mut self, points: usize) -> Result<Vec<i16>>;
}

#[derive(Default)]
pub struct ReaderOptions {
    /// Sample points per read.
    pub chunk_size: Option<usize>,
    /// Sleep to match real-time pacing.
    pub simulate: bool,
    pub okey: Option<String>,
    pub vad: Option<VadGate>,
}

struct SourceWorker {
    samples: Option<Vec<i16>>,
    source: Option<Box<dyn SampleSource>>,
    info: StreamInfo,
    chunk_size: usize,
    simulate: bool,
    vad: Option<VadGate>,
}

impl Worker for SourceWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        ctx.out_pipe().set_extra_info(self.info);
        let time_span = Duration::from_secs_f64(self.chunk_size as f64 / self.info.rate as f64);
        let mut cid = 0u64;
        let mut offset = 0usize;

        loop {
            match ctx.decide_state() {
                (_, PipeState::Wrong) | (_, PipeState::Terminated) => break,
                (_, PipeState::Stranded) => {
                    ctx.yield_now();
                    continue;
                }
                _ => {}
            }

            let started = Instant::now();
            let mut chunk: Vec<i16> = match (&self.samples, &mut self.source) {
                (Some(samples), _) => {
                    if offset >= samples.len() {
                        break;
                    }
                    let end = (offset + self.chunk_size).min(samples.len());
                    let chunk = samples[offset..end].to_vec();
                    offset = end;
                    chunk
                }
                (None, Some(source)) => {
                    let chunk = source.read(self.chunk_size)?;
                    if chunk.is_empty() {
                        break;
                    }
                    chunk
                }
                (None, None) => break,
            };

            let decision = match &mut self.vad {
                Some(vad) => {
                    // The detector sees fixed-size chunks; pad the tail.
                    if chunk.len() < self.chunk_size {
                        chunk.resize(self.chunk_size, 0);
                    }
                    vad.detect(&chunk)
                }
                None => VadDecision::Speech,
            };
            match decision {
                VadDecision::Speech => {
                    for &sample in &chunk {
                        if ctx
                            .out_pipe()
                            .state_is(&[PipeState::Silent, PipeState::Active])
                        {
                            ctx.put_packet(Packet::new(
                                ctx.okey(0).to_string(),
                                Payload::Element(Scalar::I16(sample)),
                                cid,
                                ctx.id(),
                            ))?;
                            cid += 1;
                        }
                    }
                }
                VadDecision::Truncate => {
                    ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                    cid += 1;
                    if let Some(vad) = &mut self.vad {
                        vad.reset();
                    }
                }
                VadDecision::Silence => {}
            }

            if self.simulate {
                let elapsed = started.elapsed();
                if elapsed < time_span {
                    std::thread::sleep(time_span - elapsed);
                }
            }
        }

        let _ = ctx.put_packet(Packet::endpoint(u64::MAX, ctx.id()));
        ctx.out_pipe().stop();
        Ok(())
    }
}

/// Stream a 16 kHz / 16-bit / mono wave file as element packets.
pub struct StreamReader {
    core: StageCore,
    info: StreamInfo,
}

impl StreamReader {
    pub fn new(
        wave_file: impl AsRef<Path>,
        options: ReaderOptions,
        config: RuntimeConfig,
    ) -> Result<Self> {
        let wave = read_wave(&wave_file)?;
        if wave.rate != 16000 || wave.channels != 1 || wave.width != 2 {
            return Err(ConfigError::InvalidOption {
                option: "wave_file",
                reason: format!(
                    "{}: need 16 kHz / 16-bit / mono, got {} Hz / {} ch",
                    wave_file.as_ref().display(),
                    wave.rate,
                    wave.channels
                ),
            }
            .into());
        }
        let info = StreamInfo {
            rate: wave.rate,
            channels: wave.channels,
            width: wave.width,
            duration: Some(wave.duration),
        };
        let worker = SourceWorker {
            samples: Some(wave.samples),
            source: None,
            info,
            chunk_size: options.chunk_size.unwrap_or(480),
            simulate: options.simulate,
            vad: options.vad,
        };
        let okey = options.okey.unwrap_or_else(|| "data".to_string());
        let core = StageCore::new(
            "StreamReader",
            config,
            None,
            vec![okey],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Ok(Self { core, info })
    }

    pub fn audio_info(&self) -> StreamInfo {
        self.info
    }
}

impl Node for StreamReader {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

/// Stream a live sample source (e.g. a microphone handle) as element
/// packets; same packet shape as [`StreamReader`].
pub struct StreamRecorder {
    core: StageCore,
    info: StreamInfo,
}

impl StreamRecorder {
    pub fn new(
        source: Box<dyn SampleSource>,
        options: ReaderOptions,
        config: RuntimeConfig,
    ) -> Self {
        let info = StreamInfo {
            rate: 16000,
            channels: 1,
            width: 2,
            duration: None,
        };
        let worker = SourceWorker {
            samples: None,
            source: Some(source),
            info,
            chunk_size: options.chunk_size.unwrap_or(480),
            simulate: false,
            vad: options.vad,
        };
        let okey = options.okey.unwrap_or_else(|| "data".to_string());
        let core = StageCore::new(
            "StreamRecorder",
            config,
            None,
            vec![okey],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Self { core, info }
    }

    pub fn audio_info(&self) -> StreamInfo {
        self.info
    }
}

impl Node for StreamRecorder {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

// ---------------------------------------------------------------------------
// Frame cutter / dissolver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CutterOptions {
    /// Frames per emitted packet: 1 emits vectors, more emits matrices.
    pub batch_size: usize,
    /// Sliding window width in samples.
    pub width: usize,
    /// Window step in samples.
    pub shift: usize,
    pub ikey: Option<String>,
    pub okey: String,
}

impl Default for CutterOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            width: 400,
            shift: 160,
            ikey: None,
            okey: "data".to_string(),
        }
    }
}

struct CutterWorker {
    batch_size: usize,
    width: usize,
    shift: usize,
    cover: usize,
    ikey: Option<String>,
    prev_row: Option<Array1<f32>>,
    endpoint_step: bool,
    final_step: bool,
}

enum Fill {
    Complete,
    Partial(usize),
    Nothing,
    Stopped,
}

impl CutterWorker {
    /// Fill one frame row, reusing the overlap from the previous row.
    fn fill_row(&mut self, ctx: &mut StageContext, row: &mut Array1<f32>) -> Result<Fill> {
        let mut pos = match &self.prev_row {
            Some(prev) => {
                row.slice_mut(s![0..self.cover])
                    .assign(&prev.slice(s![self.shift..]));
                self.cover
            }
            None => 0,
        };
        while pos < self.width {
            match ctx.decide_action()? {
                Action::Proceed => {
                    let packet = ctx.get_packet()?;
                    if !packet.is_empty() {
                        let key = match &self.ikey {
                            Some(k) => k.as_str(),
                            None => ctx.input_key(&packet)?,
                        };
                        let element = packet
                            .get(key)
                            .and_then(|p| p.as_element())
                            .ok_or_else(|| GraphError::PayloadMismatch {
                                stage: ctx.name().to_string(),
                                expected: "element",
                                actual: "other",
                            })?;
                        row[pos] = element.as_f32();
                        pos += 1;
                    }
                    if packet.is_endpoint() {
                        self.endpoint_step = true;
                        break;
                    }
                }
                Action::Final => {
                    self.final_step = true;
                    break;
                }
                Action::Stopped => return Ok(Fill::Stopped),
                Action::RetryLater => ctx.yield_now(),
            }
        }
        let started = if self.prev_row.is_some() {
            self.cover
        } else {
            0
        };
        if pos == self.width {
            self.prev_row = Some(row.clone());
            Ok(Fill::Complete)
        } else if pos > started {
            // Zero-pad the tail of a truncated utterance.
            row.slice_mut(s![pos..]).fill(0.0);
            Ok(Fill::Partial(pos))
        } else {
            Ok(Fill::Nothing)
        }
    }
}

impl Worker for CutterWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            let mut rows: Vec<Array1<f32>> = Vec::with_capacity(self.batch_size);
            while rows.len() < self.batch_size && !self.endpoint_step && !self.final_step {
                let mut row = Array1::zeros(self.width);
                match self.fill_row(ctx, &mut row)? {
                    Fill::Complete => rows.push(row),
                    Fill::Partial(_) => {
                        // Keep the padded frame at an endpoint; a bare end
                        // of stream snips it.
                        if self.endpoint_step {
                            rows.push(row);
                        }
                        self.prev_row = None;
                    }
                    Fill::Nothing => {}
                    Fill::Stopped => return Ok(()),
                }
            }

            if !rows.is_empty() {
                let cid = ctx.next_cid();
                let payload = if self.batch_size == 1 {
                    Payload::Vector(rows.pop().unwrap())
                } else {
                    let mut mat = Array2::zeros((rows.len(), self.width));
                    for (i, row) in rows.iter().enumerate() {
                        mat.row_mut(i).assign(row);
                    }
                    Payload::Matrix(mat)
                };
                ctx.put_packet(Packet::new(ctx.okey(0).to_string(), payload, cid, ctx.id()))?;
            }

            if self.endpoint_step {
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                self.endpoint_step = false;
                self.prev_row = None;
            }
            if self.final_step {
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                ctx.out_pipe().stop();
                return Ok(());
            }
        }
    }

    fn on_reset(&mut self) {
        self.prev_row = None;
        self.endpoint_step = false;
        self.final_step = false;
    }
}

/// Cut an element stream into sliding-window frames.
pub struct ElementFrameCutter {
    core: StageCore,
    width: usize,
    shift: usize,
}

impl ElementFrameCutter {
    pub fn new(options: CutterOptions, config: RuntimeConfig) -> Result<Self> {
        if options.width == 0 || options.shift == 0 || options.shift > options.width {
            return Err(ConfigError::InvalidOption {
                option: "shift",
                reason: format!(
                    "need 0 < shift <= width, got shift {} width {}",
                    options.shift, options.width
                ),
            }
            .into());
        }
        if options.batch_size == 0 {
            return Err(ConfigError::InvalidOption {
                option: "batch_size",
                reason: "must be positive".to_string(),
            }
            .into());
        }
        let worker = CutterWorker {
            batch_size: options.batch_size,
            width: options.width,
            shift: options.shift,
            cover: options.width - options.shift,
            ikey: options.ikey.clone(),
            prev_row: None,
            endpoint_step: false,
            final_step: false,
        };
        let core = StageCore::new(
            "ElementFrameCutter",
            config,
            options.ikey,
            vec![options.okey],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Ok(Self {
            core,
            width: options.width,
            shift: options.shift,
        })
    }

    pub fn window_info(&self) -> (usize, usize) {
        (self.width, self.shift)
    }
}

impl Node for ElementFrameCutter {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

struct DissolverWorker {
    ikey: Option<String>,
}

impl Worker for DissolverWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            match ctx.decide_action()? {
                Action::Proceed => {
                    let packet = ctx.get_packet()?;
                    if !packet.is_empty() {
                        let key = match &self.ikey {
                            Some(k) => k.as_str(),
                            None => ctx.input_key(&packet)?,
                        };
                        let values: Vec<f32> = match packet.get(key) {
                            Some(Payload::Vector(v)) => v.to_vec(),
                            Some(Payload::Matrix(m)) => m.iter().copied().collect(),
                            Some(other) => {
                                return Err(GraphError::PayloadMismatch {
                                    stage: ctx.name().to_string(),
                                    expected: "vector or matrix",
                                    actual: other.kind(),
                                }
                                .into());
                            }
                            None => {
                                return Err(GraphError::MissingKey {
                                    stage: ctx.name().to_string(),
                                    key: key.to_string(),
                                }
                                .into());
                            }
                        };
                        for value in values {
                            let cid = ctx.next_cid();
                            ctx.put_packet(Packet::new(
                                ctx.okey(0).to_string(),
                                Payload::Element(Scalar::F32(value)),
                                cid,
                                ctx.id(),
                            ))?;
                        }
                    }
                    if packet.is_endpoint() {
                        let cid = ctx.next_cid();
                        ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                    }
                }
                Action::Final => {
                    ctx.put_packet(Packet::endpoint(u64::MAX, ctx.id()))?;
                    ctx.out_pipe().stop();
                    return Ok(());
                }
                Action::Stopped => return Ok(()),
                Action::RetryLater => ctx.yield_now(),
            }
        }
    }
}

/// Flatten vector/matrix packets back into an element stream (the inverse
/// of the cutter for testing).
pub struct FrameDissolver {
    core: StageCore,
}

impl FrameDissolver {
    pub fn new(ikey: Option<String>, okey: impl Into<String>, config: RuntimeConfig) -> Self {
        let worker = DissolverWorker { ikey: ikey.clone() };
        let core = StageCore::new(
            "FrameDissolver",
            config,
            ikey,
            vec![okey.into()],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Self { core }
    }
}

impl Node for FrameDissolver {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

// ---------------------------------------------------------------------------
// Vector batcher / matrix subsetter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BatcherOptions {
    pub center: usize,
    pub left: usize,
    pub right: usize,
    pub ikey: Option<String>,
    pub okey: String,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            center: 16,
            left: 0,
            right: 0,
            ikey: None,
            okey: "data".to_string(),
        }
    }
}

struct BatcherWorker {
    center: usize,
    left: usize,
    width: usize,
    cover: usize,
    ikey: Option<String>,
    buffer: Option<Array2<f32>>,
    zeroth_step: bool,
    endpoint_step: bool,
    final_step: bool,
}

impl Worker for BatcherWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            let mut pos = if self.zeroth_step {
                self.zeroth_step = false;
                self.left
            } else {
                if let Some(buffer) = self.buffer.as_mut() {
                    let rolled = buffer.slice(s![self.center.., ..]).to_owned();
                    buffer.slice_mut(s![0..self.cover, ..]).assign(&rolled);
                }
                self.cover
            };

            let mut had_data = false;
            while pos < self.width {
                match ctx.decide_action()? {
                    Action::Proceed => {
                        let packet = ctx.get_packet()?;
                        if !packet.is_empty() {
                            let key = match &self.ikey {
                                Some(k) => k.as_str(),
                                None => ctx.input_key(&packet)?,
                            };
                            let vec = packet
                                .get(key)
                                .and_then(|p| p.as_vector())
                                .ok_or_else(|| GraphError::PayloadMismatch {
                                    stage: ctx.name().to_string(),
                                    expected: "vector",
                                    actual: "other",
                                })?;
                            let buffer = self.buffer.get_or_insert_with(|| {
                                Array2::zeros((self.width, vec.len()))
                            });
                            buffer.row_mut(pos).assign(vec);
                            pos += 1;
                            had_data = true;
                        }
                        if packet.is_endpoint() {
                            self.endpoint_step = true;
                            break;
                        }
                    }
                    Action::Final => {
                        self.final_step = true;
                        break;
                    }
                    Action::Stopped => return Ok(()),
                    Action::RetryLater => ctx.yield_now(),
                }
            }

            if let Some(buffer) = self.buffer.as_mut() {
                buffer.slice_mut(s![pos.., ..]).fill(0.0);
            }

            if had_data {
                let cid = ctx.next_cid();
                let batch = self.buffer.as_ref().unwrap().clone();
                ctx.put_packet(Packet::new(
                    ctx.okey(0).to_string(),
                    Payload::Matrix(batch),
                    cid,
                    ctx.id(),
                ))?;
            }
            if self.endpoint_step {
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                self.endpoint_step = false;
                self.zeroth_step = true;
            }
            if self.final_step {
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                ctx.out_pipe().stop();
                return Ok(());
            }
        }
    }

    fn on_reset(&mut self) {
        self.buffer = None;
        self.zeroth_step = true;
        self.endpoint_step = false;
        self.final_step = false;
    }
}

/// Pack consecutive vectors into a `(left + center + right) x D` matrix per
/// step, rolling the context margins between steps.
pub struct VectorBatcher {
    core: StageCore,
}

impl VectorBatcher {
    pub fn new(options: BatcherOptions, config: RuntimeConfig) -> Result<Self> {
        if options.center == 0 {
            return Err(ConfigError::InvalidOption {
                option: "center",
                reason: "must be positive".to_string(),
            }
            .into());
        }
        let width = options.center + options.left + options.right;
        let worker = BatcherWorker {
            center: options.center,
            left: options.left,
            width,
            cover: options.left + options.right,
            ikey: options.ikey.clone(),
            buffer: None,
            zeroth_step: true,
            endpoint_step: false,
            final_step: false,
        };
        let core = StageCore::new(
            "VectorBatcher",
            config,
            options.ikey,
            vec![options.okey],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Ok(Self { core })
    }
}

impl Node for VectorBatcher {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

struct SubsetterWorker {
    n_chunk: usize,
    ikey: Option<String>,
}

impl Worker for SubsetterWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            match ctx.decide_action()? {
                Action::Proceed => {
                    let packet = ctx.get_packet()?;
                    if !packet.is_empty() {
                        let key = match &self.ikey {
                            Some(k) => k.as_str(),
                            None => ctx.input_key(&packet)?,
                        };
                        let mat = packet
                            .get(key)
                            .and_then(|p| p.as_matrix())
                            .ok_or_else(|| GraphError::PayloadMismatch {
                                stage: ctx.name().to_string(),
                                expected: "matrix",
                                actual: "other",
                            })?;
                        if mat.nrows() % self.n_chunk != 0 {
                            return Err(FeatureError::ShapeMismatch {
                                context: format!("{}: subset rows", ctx.name()),
                                expected: self.n_chunk,
                                actual: mat.nrows(),
                            }
                            .into());
                        }
                        let size = mat.nrows() / self.n_chunk;
                        for i in 0..self.n_chunk {
                            let cid = ctx.next_cid();
                            let part = mat.slice(s![i * size..(i + 1) * size, ..]).to_owned();
                            ctx.put_packet(Packet::new(
                                ctx.okey(0).to_string(),
                                Payload::Matrix(part),
                                cid,
                                ctx.id(),
                            ))?;
                        }
                    }
                    if packet.is_endpoint() {
                        let cid = ctx.next_cid();
                        ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                    }
                }
                Action::Final => {
                    ctx.put_packet(Packet::endpoint(u64::MAX, ctx.id()))?;
                    ctx.out_pipe().stop();
                    return Ok(());
                }
                Action::Stopped => return Ok(()),
                Action::RetryLater => ctx.yield_now(),
            }
        }
    }
}

/// Split every `N x D` matrix packet into `n_chunk` equal matrix packets.
pub struct MatrixSubsetter {
    core: StageCore,
}

impl MatrixSubsetter {
    pub fn new(
        n_chunk: usize,
        ikey: Option<String>,
        okey: impl Into<String>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        if n_chunk < 2 {
            return Err(ConfigError::InvalidOption {
                option: "n_chunk",
                reason: "must be at least 2".to_string(),
            }
            .into());
        }
        let worker = SubsetterWorker {
            n_chunk,
            ikey: ikey.clone(),
        };
        let core = StageCore::new(
            "MatrixSubsetter",
            config,
            ikey,
            vec![okey.into()],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Ok(Self { core })
    }
}

impl Node for MatrixSubsetter {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

// ---------------------------------------------------------------------------
// Vector VAD
// ---------------------------------------------------------------------------

/// Verdict of a vector VAD predicate over one batch.
pub enum VadVerdict {
    /// One verdict for the whole batch.
    All(bool),
    /// One verdict per frame.
    PerFrame(Vec<bool>),
}

pub type VadFn = dyn FnMut(&Array2<f32>) -> VadVerdict + Send;

struct VectorVadWorker {
    batch_size: usize,
    patience: usize,
    truncate: bool,
    predicate: Box<VadFn>,
    ikey: Option<String>,
    silence_counter: usize,
    pending: VecDeque<Array1<f32>>,
    endpoint_step: bool,
    final_step: bool,
}

impl VectorVadWorker {
    fn emit_frame(&self, ctx: &mut StageContext, frame: &Array1<f32>) -> Result<()> {
        let cid = ctx.next_cid();
        ctx.put_packet(Packet::new(
            ctx.okey(0).to_string(),
            Payload::Vector(frame.clone()),
            cid,
            ctx.id(),
        ))
    }
}

impl Worker for VectorVadWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            while self.pending.len() < self.batch_size
                && !self.endpoint_step
                && !self.final_step
            {
                match ctx.decide_action()? {
                    Action::Proceed => {
                        let packet = ctx.get_packet()?;
                        if !packet.is_empty() {
                            let key = match &self.ikey {
                                Some(k) => k.as_str(),
                                None => ctx.input_key(&packet)?,
                            };
                            match packet.get(key) {
                                Some(Payload::Vector(v)) => self.pending.push_back(v.clone()),
                                Some(Payload::Matrix(m)) => {
                                    for row in m.outer_iter() {
                                        self.pending.push_back(row.to_owned());
                                    }
                                }
                                _ => {
                                    return Err(GraphError::PayloadMismatch {
                                        stage: ctx.name().to_string(),
                                        expected: "vector or matrix",
                                        actual: "other",
                                    }
                                    .into());
                                }
                            }
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

            let tail = self.pending.len().min(self.batch_size);
            if tail > 0 {
                let mut batch = Array2::zeros((tail, self.pending[0].len()));
                let frames: Vec<Array1<f32>> = self.pending.drain(0..tail).collect();
                for (i, frame) in frames.iter().enumerate() {
                    batch.row_mut(i).assign(frame);
                }
                match (self.predicate)(&batch) {
                    VadVerdict::All(active) => {
                        if active {
                            self.silence_counter = 0;
                            for frame in &frames {
                                self.emit_frame(ctx, frame)?;
                            }
                        } else {
                            self.silence_counter += 1;
                            if self.silence_counter < self.patience {
                                for frame in &frames {
                                    self.emit_frame(ctx, frame)?;
                                }
                            } else if self.silence_counter == self.patience && self.truncate {
                                let cid = ctx.next_cid();
                                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                            }
                        }
                    }
                    VadVerdict::PerFrame(verdicts) => {
                        if verdicts.len() != frames.len() {
                            return Err(FeatureError::ShapeMismatch {
                                context: format!("{}: vad verdicts", ctx.name()),
                                expected: frames.len(),
                                actual: verdicts.len(),
                            }
                            .into());
                        }
                        for (frame, active) in frames.iter().zip(verdicts) {
                            if active {
                                self.silence_counter = 0;
                                self.emit_frame(ctx, frame)?;
                            } else {
                                self.silence_counter += 1;
                                if self.silence_counter < self.patience {
                                    self.emit_frame(ctx, frame)?;
                                } else if self.silence_counter == self.patience && self.truncate {
                                    let cid = ctx.next_cid();
                                    ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                                }
                            }
                        }
                    }
                }
            }

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
        self.silence_counter = 0;
        self.pending.clear();
        self.endpoint_step = false;
        self.final_step = false;
    }
}

/// Voice-activity detection over vector batches with a patience counter.
pub struct VectorVadDetector {
    core: StageCore,
}

impl VectorVadDetector {
    pub fn new(
        batch_size: usize,
        predicate: Box<VadFn>,
        patience: usize,
        truncate: bool,
        ikey: Option<String>,
        okey: impl Into<String>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        if batch_size == 0 || patience == 0 {
            return Err(ConfigError::InvalidOption {
                option: "patience",
                reason: "batch_size and patience must be positive".to_string(),
            }
            .into());
        }
        let worker = VectorVadWorker {
            batch_size,
            patience,
            truncate,
            predicate,
            ikey: ikey.clone(),
            silence_counter: 0,
            pending: VecDeque::new(),
            endpoint_step: false,
            final_step: false,
        };
        let core = StageCore::new(
            "VectorVadDetector",
            config,
            ikey,
            vec![okey.into()],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Ok(Self { core })
    }
}

impl Node for VectorVadDetector {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}
