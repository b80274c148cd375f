//! Context-window feature processing: CMVN, deltas, splicing, LDA.
//!
//! The processor keeps a rolling window of `left + center + right` frames.
//! Each step rolls the last `left + right` frames down, fills `center` new
//! frames from the input, applies the configured CMVNs to the new frames
//! only, runs the transform over the whole window and emits the slice the
//! context makes valid: everything up to `left + center` on the first step,
//! the central `center` frames in steady state, and the whole remaining tail
//! on an endpoint or final step.

use std::collections::VecDeque;

use ndarray::{s, Array1, Array2};

use crate::component::{Action, InputArity, Node, StageCore, StageContext, Worker};
use crate::config::RuntimeConfig;
use crate::dsp::{add_deltas, splice_feats};
use crate::errors::{FeatureError, GraphError, Result};
use crate::feature::cmvn::{CmvnNormalizer, SharedCmvn};
use crate::packet::{Packet, Payload};

/// Transform run over the full context window each step.
pub type ProcessFn = dyn FnMut(&Array2<f32>) -> Result<Array2<f32>> + Send;

/// Feature processor configuration. The context half-widths are derived as
/// `delta + splice_left` / `delta + splice_right`.
pub struct ProcessorOptions {
    /// Frames emitted per steady-state step.
    pub batch_size: usize,
    /// Delta order (0 disables).
    pub delta: usize,
    pub delta_window: usize,
    pub splice_left: usize,
    pub splice_right: usize,
    /// Dense projection applied after splicing.
    pub lda: Option<Array2<f32>>,
    /// Normalizers applied, in order, to newly arrived frames.
    pub cmvns: Vec<SharedCmvn>,
    /// Replaces the default delta -> splice -> LDA transform.
    pub process_function: Option<Box<ProcessFn>>,
    /// Slot to read; defaults to the packet's main slot.
    pub ikey: Option<String>,
    pub okey: String,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            batch_size: 32,
            delta: 0,
            delta_window: 2,
            splice_left: 0,
            splice_right: 0,
            lda: None,
            cmvns: Vec::new(),
            process_function: None,
            ikey: None,
            okey: "feat".to_string(),
        }
    }
}

enum Item {
    Frame(Array1<f32>),
    Endpoint,
}

enum Pulled {
    Item(Item),
    Final,
    Stopped,
}

struct ProcessorWorker {
    center: usize,
    left: usize,
    right: usize,
    width: usize,
    cover: usize,
    cmvns: Vec<SharedCmvn>,
    process: Box<ProcessFn>,
    ikey: Option<String>,
    buffer: Option<Array2<f32>>,
    pending: VecDeque<Item>,
    zeroth_step: bool,
    duration: usize,
}

impl ProcessorWorker {
    fn pull(&mut self, ctx: &mut StageContext) -> Result<Pulled> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Ok(Pulled::Item(item));
            }
            match ctx.decide_action()? {
                Action::Proceed => {
                    let packet = ctx.get_packet()?;
                    if !packet.is_empty() {
                        let key = match &self.ikey {
                            Some(k) => k.as_str(),
                            None => ctx.input_key(&packet)?,
                        };
                        match packet.get(key) {
                            Some(Payload::Vector(v)) => {
                                self.pending.push_back(Item::Frame(v.clone()));
                            }
                            Some(Payload::Matrix(m)) => {
                                for row in m.outer_iter() {
                                    self.pending.push_back(Item::Frame(row.to_owned()));
                                }
                            }
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
                        }
                    }
                    if packet.is_endpoint() {
                        self.pending.push_back(Item::Endpoint);
                    }
                }
                Action::Final => return Ok(Pulled::Final),
                Action::Stopped => return Ok(Pulled::Stopped),
                Action::RetryLater => ctx.yield_now(),
            }
        }
    }

    fn apply_cmvns(&mut self, ctx: &StageContext, start: usize, end: usize) -> Result<()> {
        let buffer = self.buffer.as_mut().unwrap();
        for shared in &self.cmvns {
            let mut cmvn = shared.lock().unwrap();
            let cols = buffer.ncols();
            let rows = buffer.slice_mut(s![start..end, ..]);
            match cmvn.offset() {
                None => cmvn.apply(rows)?,
                Some(offset) => {
                    let stop = match cmvn.dim() {
                        Some(dim) => offset + dim,
                        None => cols,
                    };
                    if stop > cols {
                        return Err(FeatureError::ShapeMismatch {
                            context: format!("{}: cmvn slice", ctx.name()),
                            expected: cols,
                            actual: stop,
                        }
                        .into());
                    }
                    cmvn.apply(rows.slice_move(s![.., offset..stop]))?;
                }
            }
        }
        Ok(())
    }
}

impl Worker for ProcessorWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            // Lay out this step's window.
            let (mut pos, first_step) = if self.zeroth_step {
                self.zeroth_step = false;
                (0, true)
            } else {
                let buffer = self.buffer.as_mut().unwrap();
                let rolled = buffer.slice(s![self.center.., ..]).to_owned();
                buffer.slice_mut(s![0..self.cover, ..]).assign(&rolled);
                (self.cover, false)
            };

            let mut endpoint_step = false;
            let mut final_step = false;
            let mut tail = self.width;
            while pos < self.width {
                match self.pull(ctx)? {
                    Pulled::Item(Item::Frame(frame)) => {
                        let buffer = self.buffer.get_or_insert_with(|| {
                            Array2::zeros((self.width, frame.len()))
                        });
                        if frame.len() != buffer.ncols() {
                            return Err(FeatureError::ShapeMismatch {
                                context: format!("{}: input frame", ctx.name()),
                                expected: buffer.ncols(),
                                actual: frame.len(),
                            }
                            .into());
                        }
                        buffer.row_mut(pos).assign(&frame);
                        pos += 1;
                        self.duration += 1;
                    }
                    Pulled::Item(Item::Endpoint) => {
                        endpoint_step = true;
                        tail = pos;
                        break;
                    }
                    Pulled::Final => {
                        final_step = true;
                        tail = pos;
                        break;
                    }
                    Pulled::Stopped => return Ok(()),
                }
            }
            if let Some(buffer) = self.buffer.as_mut() {
                buffer.slice_mut(s![pos.., ..]).fill(0.0);
            }

            if self.duration == 0 {
                if final_step {
                    let cid = ctx.next_cid();
                    ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                    ctx.out_pipe().stop();
                    return Ok(());
                }
                if endpoint_step {
                    let cid = ctx.next_cid();
                    ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                    self.zeroth_step = true;
                }
                continue;
            }

            // Normalize only the frames that arrived this step.
            let start = if first_step { 0 } else { self.cover };
            if !self.cmvns.is_empty() && tail > start {
                self.apply_cmvns(ctx, start, tail)?;
            }

            let window = self
                .buffer
                .as_ref()
                .unwrap()
                .slice(s![0..tail, ..])
                .to_owned();
            let feats = (self.process)(&window)?;

            let avail_left = if first_step { 0 } else { self.left };
            let avail_right = if endpoint_step || final_step {
                tail
            } else {
                self.left + self.center
            };
            if avail_right > avail_left {
                let chunk = feats.slice(s![avail_left..avail_right, ..]).to_owned();
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::new(
                    ctx.okey(0).to_string(),
                    Payload::Matrix(chunk),
                    cid,
                    ctx.id(),
                ))?;
            }

            if endpoint_step {
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                self.zeroth_step = true;
                self.duration = 0;
            }
            if final_step {
                let cid = ctx.next_cid();
                ctx.put_packet(Packet::endpoint(cid, ctx.id()))?;
                ctx.out_pipe().stop();
                return Ok(());
            }
        }
    }

    fn on_reset(&mut self) {
        self.buffer = None;
        self.pending.clear();
        self.zeroth_step = true;
        self.duration = 0;
        for cmvn in &self.cmvns {
            cmvn.lock().unwrap().reset();
        }
    }
}

/// A stage applying CMVN and the delta/splice/LDA assembly over a rolling
/// context window, emitting one matrix packet per step.
pub struct FeatureProcessor {
    core: StageCore,
}

impl FeatureProcessor {
    pub fn new(mut options: ProcessorOptions, config: RuntimeConfig) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(crate::errors::ConfigError::InvalidOption {
                option: "batch_size",
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if options.delta > 0 && options.delta_window == 0 {
            return Err(crate::errors::ConfigError::InvalidOption {
                option: "delta_window",
                reason: "must be positive when deltas are on".to_string(),
            }
            .into());
        }
        let left = options.delta + options.splice_left;
        let right = options.delta + options.splice_right;
        let center = options.batch_size;

        let process: Box<ProcessFn> = match options.process_function.take() {
            Some(f) => f,
            None => {
                let delta = options.delta;
                let delta_window = options.delta_window;
                let splice_left = options.splice_left;
                let splice_right = options.splice_right;
                let lda = options.lda.take();
                Box::new(move |window: &Array2<f32>| {
                    let mut feats = if delta > 0 {
                        add_deltas(window, delta, delta_window)
                    } else {
                        window.clone()
                    };
                    if splice_left != 0 || splice_right != 0 {
                        feats = splice_feats(&feats, splice_left, splice_right);
                    }
                    if let Some(lda) = &lda {
                        if feats.ncols() != lda.nrows() {
                            return Err(FeatureError::ShapeMismatch {
                                context: "lda input".to_string(),
                                expected: lda.nrows(),
                                actual: feats.ncols(),
                            }
                            .into());
                        }
                        feats = feats.dot(lda);
                    }
                    Ok(feats)
                })
            }
        };

        let worker = ProcessorWorker {
            center,
            left,
            right,
            width: center + left + right,
            cover: left + right,
            cmvns: options.cmvns,
            process,
            ikey: options.ikey.clone(),
            buffer: None,
            pending: VecDeque::new(),
            zeroth_step: true,
            duration: 0,
        };
        let core = StageCore::new(
            "FeatureProcessor",
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

impl Node for FeatureProcessor {
    fn core(&self) -> &StageCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StageCore {
        &mut self.core
    }
}

// Re-exported so callers can embed normalizers without importing the cmvn
// module path explicitly.
pub use crate::feature::cmvn::shared as shared_cmvn;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::cmvn::SlidingCmvn;
    use crate::pipe::Pipe;
    use ndarray::Array1;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn feed_frames(pipe: &Pipe, n: usize, dim: usize) {
        for cid in 0..n {
            let frame = Array1::from_iter((0..dim).map(|d| (cid * dim + d) as f32));
            pipe.put(Packet::new("feat", Payload::Vector(frame), cid as u64, 0))
                .unwrap();
        }
        pipe.stop();
    }

    fn total_rows(groups: &[Vec<Packet>]) -> usize {
        groups
            .iter()
            .flatten()
            .map(|p| p.main().unwrap().as_matrix().unwrap().nrows())
            .sum()
    }

    #[test]
    fn test_frame_count_is_preserved() {
        let config = cfg();
        let input = Pipe::new("feat", &config);
        feed_frames(&input, 100, 13);

        let options = ProcessorOptions {
            batch_size: 8,
            delta: 2,
            splice_left: 3,
            splice_right: 3,
            okey: "feat".to_string(),
            ..Default::default()
        };
        let mut processor = FeatureProcessor::new(options, config).unwrap();
        processor.start(vec![input]).unwrap();
        processor.wait().unwrap();

        let groups = processor.out_pipe().to_list().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(total_rows(&groups), 100);
        // 13 * (2 + 1) * (3 + 1 + 3)
        let dim = groups[0][0].main().unwrap().as_matrix().unwrap().ncols();
        assert_eq!(dim, 13 * 3 * 7);
    }

    #[test]
    fn test_steady_state_emits_center_frames() {
        let config = cfg();
        let input = Pipe::new("feat", &config);
        feed_frames(&input, 40, 4);

        let options = ProcessorOptions {
            batch_size: 8,
            splice_left: 2,
            splice_right: 2,
            okey: "feat".to_string(),
            ..Default::default()
        };
        let mut processor = FeatureProcessor::new(options, config).unwrap();
        processor.start(vec![input]).unwrap();
        processor.wait().unwrap();

        let groups = processor.out_pipe().to_list().unwrap();
        let sizes: Vec<usize> = groups[0]
            .iter()
            .map(|p| p.main().unwrap().as_matrix().unwrap().nrows())
            .collect();
        // First step carries the left context, steady steps carry exactly
        // `center`, the tail carries the rest.
        assert_eq!(sizes[0], 2 + 8);
        assert!(sizes[1..sizes.len() - 1].iter().all(|&s| s == 8));
        assert_eq!(sizes.iter().sum::<usize>(), 40);
    }

    #[test]
    fn test_endpoint_splits_processing() {
        let config = cfg();
        let input = Pipe::new("feat", &config);
        for cid in 0..10u64 {
            let frame = Array1::from_elem(4, cid as f32);
            input
                .put(Packet::new("feat", Payload::Vector(frame), cid, 0))
                .unwrap();
            if cid == 4 {
                input.put(Packet::endpoint(cid, 0)).unwrap();
            }
        }
        input.stop();

        let options = ProcessorOptions {
            batch_size: 3,
            splice_left: 1,
            splice_right: 1,
            okey: "feat".to_string(),
            ..Default::default()
        };
        let mut processor = FeatureProcessor::new(options, config).unwrap();
        processor.start(vec![input]).unwrap();
        processor.wait().unwrap();

        let groups = processor.out_pipe().to_list().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(total_rows(&groups), 10);
    }

    #[test]
    fn test_identity_transform_passes_values_through() {
        let config = cfg();
        let input = Pipe::new("feat", &config);
        feed_frames(&input, 12, 2);

        let options = ProcessorOptions {
            batch_size: 4,
            okey: "feat".to_string(),
            ..Default::default()
        };
        let mut processor = FeatureProcessor::new(options, config).unwrap();
        processor.start(vec![input]).unwrap();
        processor.wait().unwrap();

        let groups = processor.out_pipe().to_list().unwrap();
        let mut values = Vec::new();
        for packet in &groups[0] {
            let mat = packet.main().unwrap().as_matrix().unwrap().clone();
            for row in mat.outer_iter() {
                values.push(row[0]);
            }
        }
        let expected: Vec<f32> = (0..12).map(|t| (t * 2) as f32).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_cmvn_is_applied_once_per_frame() {
        let config = cfg();
        let input = Pipe::new("feat", &config);
        // Constant frames: after sliding CMVN every output is zero.
        for cid in 0..20u64 {
            input
                .put(Packet::new(
                    "feat",
                    Payload::Vector(Array1::from_elem(3, 7.0)),
                    cid,
                    0,
                ))
                .unwrap();
        }
        input.stop();

        let options = ProcessorOptions {
            batch_size: 5,
            cmvns: vec![shared_cmvn(SlidingCmvn::new(10, false, None))],
            okey: "feat".to_string(),
            ..Default::default()
        };
        let mut processor = FeatureProcessor::new(options, config).unwrap();
        processor.start(vec![input]).unwrap();
        processor.wait().unwrap();

        let groups = processor.out_pipe().to_list().unwrap();
        for packet in &groups[0] {
            let mat = packet.main().unwrap().as_matrix().unwrap();
            assert!(mat.iter().all(|&x| x.abs() < 1e-5));
        }
        assert_eq!(total_rows(&groups), 20);
    }
}
