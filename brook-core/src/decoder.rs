//! Driver for the external WFST beam-search subprocess.
//!
//! The decoder child speaks a line protocol over stdio. A feeder (the stage
//! worker) frames scaled probability chunks to the child's stdin; a reader
//! thread demultiplexes the child's stdout lines into partial hypotheses,
//! endpoint n-best blocks and the final marker. Packets written to the child
//! wait in an internal queue so each emitted result can be correlated with
//! the chunk that produced it. Only the feeder touches stdin and only the
//! reader touches stdout.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::component::{Action, InputArity, Node, StageCore, StageContext, Worker};
use crate::config::RuntimeConfig;
use crate::errors::{BrookError, DecodeError, GraphError, Result};
use crate::packet::{Packet, Payload};
use crate::pipe::{Pipe, PipeState};

/// Reranks endpoint n-best lists of word ids; the first returned list
/// becomes the main hypothesis.
pub type RerankFn = dyn FnMut(Vec<Vec<i64>>) -> Vec<Vec<i64>> + Send;

/// Load a `<word> <id>` symbol table. Ids are kept as strings and looked up
/// by string; unknown ids resolve to `<UNK>`.
pub fn load_symbol_table(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let mut table = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(word), Some(id), None) => {
                table.insert(id.to_string(), word.to_string());
            }
            (None, _, _) => continue,
            _ => {
                return Err(DecodeError::ProtocolMismatch {
                    stage: "symbol table".to_string(),
                    line: line.to_string(),
                }
                .into());
            }
        }
    }
    Ok(table)
}

/// Ask `hmm-info` for the model's pdf count, to validate probability dims
/// before decoding starts.
pub fn query_pdf_dim(hmm_info: impl AsRef<Path>, tmodel: impl AsRef<Path>) -> Result<usize> {
    let output = Command::new(hmm_info.as_ref())
        .arg(tmodel.as_ref())
        .output()?;
    if !output.status.success() {
        return Err(DecodeError::ChildCrash {
            stage: "hmm-info".to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        if line.contains("pdfs") {
            if let Some(count) = line.split_whitespace().last() {
                if let Ok(count) = count.parse::<usize>() {
                    return Ok(count);
                }
            }
        }
    }
    Err(DecodeError::ProtocolMismatch {
        stage: "hmm-info".to_string(),
        line: stdout.trim().to_string(),
    }
    .into())
}

fn ids_to_words(table: &HashMap<String, String>, ids: &[&str]) -> String {
    ids.iter()
        .map(|id| table.get(*id).map(String::as_str).unwrap_or("<UNK>"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Beam-search configuration forwarded to the decoder child.
pub struct DecoderOptions {
    /// Directory holding the `exkaldi-online-decoder` executable.
    pub cmd_root: PathBuf,
    pub symbol_table: PathBuf,
    /// Colon-separated silence phone ids.
    pub silence_phones: String,
    pub frame_shift_sec: f64,
    pub tmodel: PathBuf,
    pub graph: PathBuf,
    pub word_boundary: Option<PathBuf>,
    pub n_bests: usize,
    pub beam: f64,
    pub max_active: usize,
    pub min_active: usize,
    pub lattice_beam: f64,
    pub prune_interval: usize,
    pub beam_delta: f64,
    pub hash_ratio: f64,
    pub prune_scale: f64,
    pub acoustic_scale: f32,
    pub lm_scale: f64,
    pub allow_partial: bool,
    /// Largest chunk (frames) the child accepts per write.
    pub max_batch_size: usize,
    /// Expected probability dim (the model's pdf count), when known.
    pub pdf_dim: Option<usize>,
    pub ikey: Option<String>,
    pub okey: String,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            cmd_root: PathBuf::new(),
            symbol_table: PathBuf::new(),
            silence_phones: "1".to_string(),
            frame_shift_sec: 0.01,
            tmodel: PathBuf::new(),
            graph: PathBuf::new(),
            word_boundary: None,
            n_bests: 10,
            beam: 16.0,
            max_active: 7000,
            min_active: 200,
            lattice_beam: 10.0,
            prune_interval: 25,
            beam_delta: 0.5,
            hash_ratio: 2.0,
            prune_scale: 0.1,
            acoustic_scale: 0.1,
            lm_scale: 1.0,
            allow_partial: false,
            max_batch_size: 100,
            pdf_dim: None,
            ikey: None,
            okey: "text".to_string(),
        }
    }
}

impl DecoderOptions {
    fn validate(&self) -> Result<()> {
        let check = |ok: bool, option: &'static str, reason: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(crate::errors::ConfigError::InvalidOption {
                    option,
                    reason: reason.to_string(),
                }
                .into())
            }
        };
        check(self.n_bests > 1, "n_bests", "must be greater than 1")?;
        check(self.beam > 0.0, "beam", "must be positive")?;
        check(
            self.max_active > self.min_active && self.min_active > 0,
            "max_active",
            "need max_active > min_active > 0",
        )?;
        check(self.lattice_beam > 0.0, "lattice_beam", "must be positive")?;
        check(self.prune_interval > 0, "prune_interval", "must be positive")?;
        check(self.beam_delta > 0.0, "beam_delta", "must be positive")?;
        check(self.hash_ratio > 0.0, "hash_ratio", "must be positive")?;
        check(self.prune_scale > 0.0, "prune_scale", "must be positive")?;
        check(
            self.acoustic_scale > 0.0,
            "acoustic_scale",
            "must be positive",
        )?;
        check(self.lm_scale > 0.0, "lm_scale", "must be positive")?;
        check(
            self.frame_shift_sec > 0.0,
            "frame_shift_sec",
            "must be positive",
        )?;
        check(
            self.max_batch_size > 1,
            "max_batch_size",
            "must be greater than 1",
        )?;
        Ok(())
    }

    fn build_command(&self, config: &RuntimeConfig) -> Command {
        let mut cmd = Command::new(self.cmd_root.join("exkaldi-online-decoder"));
        cmd.arg("--beam").arg(self.beam.to_string());
        cmd.arg("--max-active").arg(self.max_active.to_string());
        cmd.arg("--min-active").arg(self.min_active.to_string());
        cmd.arg("--lattice-beam").arg(self.lattice_beam.to_string());
        cmd.arg("--prune-interval").arg(self.prune_interval.to_string());
        cmd.arg("--beam-delta").arg(self.beam_delta.to_string());
        cmd.arg("--hash-ratio").arg(self.hash_ratio.to_string());
        cmd.arg("--prune-scale").arg(self.prune_scale.to_string());
        cmd.arg("--acoustic-scale").arg(self.acoustic_scale.to_string());
        cmd.arg("--lm-scale").arg(self.lm_scale.to_string());
        cmd.arg("--chunk-frames").arg(self.max_batch_size.to_string());
        cmd.arg("--allow-partial").arg(self.allow_partial.to_string());
        cmd.arg("--n-bests").arg(self.n_bests.to_string());
        cmd.arg("--silence-phones").arg(&self.silence_phones);
        cmd.arg("--frame-shift").arg(self.frame_shift_sec.to_string());
        cmd.arg("--tmodel").arg(&self.tmodel);
        cmd.arg("--fst").arg(&self.graph);
        if let Some(word_boundary) = &self.word_boundary {
            cmd.arg("--word-boundary").arg(word_boundary);
        }
        cmd.arg("--timeout")
            .arg((config.timeout_secs * 1000).to_string());
        cmd.arg("--timescale")
            .arg(((config.timescale_secs * 1000.0) as u64).to_string());
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

fn drain_stderr(stderr: Option<&mut ChildStderr>) -> String {
    let mut buf = String::new();
    if let Some(stderr) = stderr {
        let _ = stderr.read_to_string(&mut buf);
    }
    buf.trim().to_string()
}

/// Encode a probability chunk as the ASCII block the child expects.
fn encode_chunk(kind: i32, mat: &ndarray::Array2<f32>) -> Vec<u8> {
    let mut out = format!(" {kind} {} ", mat.nrows()).into_bytes();
    for value in mat.iter() {
        out.extend_from_slice(value.to_string().as_bytes());
        out.push(b' ');
    }
    out
}

struct ReaderThread {
    out_pipe: Pipe,
    in_pipe: Pipe,
    stage: String,
    okey: String,
    symbols: HashMap<String, String>,
    reranker: Option<Box<RerankFn>>,
    waiting: Receiver<Packet>,
    timeout: std::time::Duration,
}

impl ReaderThread {
    fn pop_waiting(&self) -> Result<Packet> {
        self.waiting.recv_timeout(self.timeout).map_err(|_| {
            BrookError::from(GraphError::Timeout {
                stage: self.stage.clone(),
                timeout_secs: self.timeout.as_secs(),
            })
        })
    }

    fn handle_partial(&self, rest: &str) -> Result<()> {
        let mut packet = self.pop_waiting()?;
        let ids: Vec<&str> = rest.split_whitespace().collect();
        let text = if ids.is_empty() {
            " ".to_string()
        } else {
            ids_to_words(&self.symbols, &ids)
        };
        packet.add(self.okey.clone(), Payload::Text(text), true);
        self.out_pipe.put(packet)
    }

    fn handle_endpoint(&mut self, rest: &str) -> Result<()> {
        let mut endpoint = self.pop_waiting()?.into_endpoint();
        let hypotheses: Vec<Vec<&str>> = rest
            .split("-1")
            .map(|chunk| chunk.split_whitespace().collect::<Vec<&str>>())
            .filter(|ids| !ids.is_empty())
            .collect();

        if hypotheses.is_empty() {
            endpoint.add(self.okey.clone(), Payload::Text(" ".to_string()), true);
        } else {
            let ranked: Vec<String> = match &mut self.reranker {
                Some(rerank) if hypotheses.len() > 1 => {
                    let as_ints: Vec<Vec<i64>> = hypotheses
                        .iter()
                        .map(|ids| {
                            ids.iter()
                                .map(|id| {
                                    id.parse::<i64>().map_err(|_| {
                                        BrookError::from(DecodeError::ProtocolMismatch {
                                            stage: self.stage.clone(),
                                            line: (*id).to_string(),
                                        })
                                    })
                                })
                                .collect()
                        })
                        .collect::<Result<_>>()?;
                    rerank(as_ints)
                        .into_iter()
                        .map(|ids| {
                            let strs: Vec<String> =
                                ids.iter().map(|id| id.to_string()).collect();
                            let refs: Vec<&str> = strs.iter().map(String::as_str).collect();
                            ids_to_words(&self.symbols, &refs)
                        })
                        .collect()
                }
                _ => hypotheses
                    .iter()
                    .map(|ids| ids_to_words(&self.symbols, ids))
                    .collect(),
            };
            for (i, text) in ranked.into_iter().enumerate() {
                let key = if i == 0 {
                    self.okey.clone()
                } else {
                    format!("{}-{}", self.okey, i + 1)
                };
                endpoint.add(key, Payload::Text(text), i == 0);
            }
        }
        self.out_pipe.put(endpoint)
    }

    fn run(&mut self, stdout: std::process::ChildStdout) -> Result<()> {
        let mut lines = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            match self.out_pipe.state() {
                PipeState::Wrong => {
                    if !self
                        .in_pipe
                        .state_is(&[PipeState::Wrong, PipeState::Terminated])
                    {
                        self.in_pipe.kill();
                    }
                    return Ok(());
                }
                PipeState::Terminated => return Ok(()),
                _ => {}
            }

            line.clear();
            let read = lines.read_line(&mut line)?;
            if read == 0 {
                // EOF during an orderly shutdown is fine; anything else
                // means the child died before the final marker.
                if self
                    .out_pipe
                    .state_is(&[PipeState::Wrong, PipeState::Terminated])
                {
                    return Ok(());
                }
                return Err(DecodeError::ChildCrash {
                    stage: self.stage.clone(),
                    stderr: "decoder child closed its output stream".to_string(),
                }
                .into());
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("-1") {
                self.handle_partial(rest)?;
            } else if let Some(rest) = trimmed.strip_prefix("-2") {
                self.handle_endpoint(rest)?;
            } else if trimmed.starts_with("-3") {
                debug!(stage = %self.stage, "decoder child finished");
                return Ok(());
            } else {
                return Err(DecodeError::ProtocolMismatch {
                    stage: self.stage.clone(),
                    line: trimmed.to_string(),
                }
                .into());
            }
        }
    }
}

struct DecoderWorker {
    options: DecoderOptions,
    symbols: HashMap<String, String>,
    reranker: Option<Box<RerankFn>>,
    child_slot: Arc<Mutex<Option<Child>>>,
}

impl DecoderWorker {
    fn feed_chunk(
        &self,
        ctx: &StageContext,
        stdin: &mut std::process::ChildStdin,
        kind: i32,
        packet: &Packet,
    ) -> Result<()> {
        let key = match &self.options.ikey {
            Some(k) => k.as_str(),
            None => ctx.input_key(packet)?,
        };
        let mat = match packet.get(key) {
            Some(Payload::Matrix(mat)) => mat,
            Some(other) => {
                return Err(GraphError::PayloadMismatch {
                    stage: ctx.name().to_string(),
                    expected: "matrix",
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
        if mat.nrows() > self.options.max_batch_size {
            return Err(DecodeError::ChunkTooLarge {
                stage: ctx.name().to_string(),
                frames: mat.nrows(),
                limit: self.options.max_batch_size,
            }
            .into());
        }
        if let Some(pdfs) = self.options.pdf_dim {
            if mat.ncols() != pdfs {
                return Err(DecodeError::BadProbabilityDim {
                    stage: ctx.name().to_string(),
                    expected: pdfs,
                    actual: mat.ncols(),
                }
                .into());
            }
        }
        let scaled = mat.mapv(|x| x * self.options.acoustic_scale);
        stdin.write_all(&encode_chunk(kind, &scaled))?;
        stdin.flush()?;
        Ok(())
    }
}

impl Worker for DecoderWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        self.options.validate()?;
        let mut child = self
            .options
            .build_command(ctx.config())
            .spawn()
            .map_err(|e| DecodeError::ChildCrash {
                stage: ctx.name().to_string(),
                stderr: format!("failed to launch decoder child: {e}"),
            })?;
        let mut stdin = child.stdin.take().expect("child stdin is piped");
        let stdout = child.stdout.take().expect("child stdout is piped");
        let mut stderr = child.stderr.take();
        *self.child_slot.lock().unwrap() = Some(child);

        let (waiting_tx, waiting_rx): (Sender<Packet>, Receiver<Packet>) = unbounded();
        let mut reader = ReaderThread {
            out_pipe: ctx.out_pipe().clone(),
            in_pipe: ctx.in_pipe().clone(),
            stage: ctx.name().to_string(),
            okey: ctx.okey(0).to_string(),
            symbols: std::mem::take(&mut self.symbols),
            reranker: self.reranker.take(),
            waiting: waiting_rx,
            timeout: ctx.config().timeout(),
        };
        let reader_handle: JoinHandle<(Result<()>, ReaderThread)> =
            std::thread::Builder::new()
                .name(format!("{} reader", ctx.name()))
                .spawn(move || {
                    let result = reader.run(stdout);
                    if result.is_err() {
                        for pipe in [&reader.in_pipe, &reader.out_pipe] {
                            if !pipe.state_is(&[PipeState::Wrong, PipeState::Terminated]) {
                                pipe.kill();
                            }
                        }
                    }
                    (result, reader)
                })
                .expect("failed to spawn decoder reader thread");

        // Ok(true) means the final marker was handed to the child and the
        // reader will see a matching `-3` line.
        let feed_result: Result<bool> = (|| {
            loop {
                match ctx.decide_action()? {
                    Action::Proceed => {
                        let packet = ctx.get_packet()?;
                        if packet.is_endpoint() {
                            if packet.is_empty() {
                                stdin.write_all(b" -2 0 ")?;
                                stdin.flush()?;
                            } else {
                                self.feed_chunk(ctx, &mut stdin, -2, &packet)?;
                            }
                            let _ = waiting_tx.send(packet);
                        } else {
                            if packet.is_empty() {
                                continue;
                            }
                            self.feed_chunk(ctx, &mut stdin, -1, &packet)?;
                            let _ = waiting_tx.send(packet);
                        }
                    }
                    Action::Final => {
                        stdin.write_all(b" -3 ")?;
                        stdin.flush()?;
                        return Ok(true);
                    }
                    Action::Stopped => return Ok(false),
                    Action::RetryLater => ctx.yield_now(),
                }
            }
        })();

        // Without the final handshake in flight the reader would block on
        // the child's stdout forever; tear the child down to unblock it.
        if !matches!(feed_result, Ok(true)) {
            if let Some(child) = self.child_slot.lock().unwrap().as_mut() {
                let _ = child.kill();
            }
        }

        // Wait for the reader to drain every outstanding result, then close
        // the child with the shutdown handshake.
        let (reader_result, reader_state) = match reader_handle.join() {
            Ok(result) => result,
            Err(_) => {
                return Err(GraphError::WorkerPanicked {
                    name: ctx.name().to_string(),
                }
                .into());
            }
        };
        self.symbols = reader_state.symbols;
        self.reranker = reader_state.reranker;

        let _ = stdin.write_all(b"over");
        let _ = stdin.flush();
        if let Some(mut child) = self.child_slot.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }

        match (feed_result, reader_result) {
            (Err(err), _) => {
                let detail = drain_stderr(stderr.as_mut());
                if detail.is_empty() {
                    Err(err)
                } else {
                    Err(DecodeError::ChildCrash {
                        stage: ctx.name().to_string(),
                        stderr: detail,
                    }
                    .into())
                }
            }
            (Ok(_), Err(err)) => Err(err),
            (Ok(true), Ok(())) => {
                ctx.put_packet(Packet::endpoint(u64::MAX, ctx.id()))?;
                ctx.out_pipe().stop();
                Ok(())
            }
            (Ok(false), Ok(())) => Ok(()),
        }
    }
}

/// The decoder-driver stage.
pub struct WfstDecoder {
    core: StageCore,
    child_slot: Arc<Mutex<Option<Child>>>,
}

impl WfstDecoder {
    pub fn new(options: DecoderOptions, config: RuntimeConfig) -> Result<Self> {
        options.validate()?;
        let symbols = load_symbol_table(&options.symbol_table)?;
        Self::with_symbols_and_reranker(options, symbols, None, config)
    }

    /// Variant with an explicit symbol table and optional reranker hook.
    pub fn with_symbols_and_reranker(
        options: DecoderOptions,
        symbols: HashMap<String, String>,
        reranker: Option<Box<RerankFn>>,
        config: RuntimeConfig,
    ) -> Result<Self> {
        options.validate()?;
        let child_slot = Arc::new(Mutex::new(None));
        let ikey = options.ikey.clone();
        let okey = options.okey.clone();
        let worker = DecoderWorker {
            options,
            symbols,
            reranker,
            child_slot: Arc::clone(&child_slot),
        };
        let core = StageCore::new(
            "WfstDecoder",
            config,
            ikey,
            vec![okey],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Ok(Self { core, child_slot })
    }
}

impl Node for WfstDecoder {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }

    fn kill(&self) {
        self.core.kill();
        if let Some(mut child) = self.child_slot.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Collapse a terminated text queue into a transcription: one line per
/// endpoint group, optionally keeping a trailing partial hypothesis.
pub fn dump_text_pipe(
    pipe: &Pipe,
    key: Option<&str>,
    allow_partial: bool,
    end_symbol: &str,
) -> Result<String> {
    if !pipe.state_is(&[PipeState::Terminated, PipeState::Wrong]) {
        return Err(GraphError::ClosedForWrite {
            pipe: pipe.name().to_string(),
        }
        .into());
    }
    let mut result: Vec<String> = Vec::new();
    let mut memory: Option<String> = None;
    while !pipe.is_empty() {
        let packet = match pipe.try_get()? {
            Some(p) => p,
            None => break,
        };
        if !packet.is_empty() {
            let text = match key {
                Some(k) => packet.get(k).and_then(|p| p.as_text()),
                None => packet.main().and_then(|p| p.as_text()),
            };
            if let Some(text) = text {
                memory = Some(text.to_string());
            }
        }
        if packet.is_endpoint() {
            if let Some(text) = memory.take() {
                result.push(text);
            }
        }
    }
    if allow_partial {
        if let Some(text) = memory {
            result.push(text);
        }
    }
    Ok(result.join(end_symbol))
}
