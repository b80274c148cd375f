//! Acoustic probability estimation around a caller-supplied network.
//!
//! The estimator wraps a plain matrix-to-matrix function. With left/right
//! context configured, incoming chunks are routed through a context buffer:
//! the network sees `T + left + right` frames per call, its output is
//! attached to the packet that contributed the window's center frames, and
//! an endpoint flushes the tail with a zero matrix so the right context can
//! drain.

use ndarray::{Array1, Array2, Axis};
use tracing::warn;

use crate::component::{Action, InputArity, Node, StageCore, StageContext, Worker};
use crate::config::{RuntimeConfig, EPSILON};
use crate::errors::{DecodeError, GraphError, Result};
use crate::packet::{Packet, Payload};

/// The caller's acoustic model: `(T, D_feat) -> (T, D_prob)`.
pub type AcousticFn = dyn FnMut(&Array2<f32>) -> Result<Array2<f32>> + Send;

/// Row-wise softmax.
pub fn softmax(data: &Array2<f32>) -> Array2<f32> {
    let mut out = data.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|x| (x - max).exp());
        let sum: f32 = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    out
}

/// Row-wise log-softmax.
pub fn log_softmax(data: &Array2<f32>) -> Array2<f32> {
    let mut out = data.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|x| x - log_sum);
    }
    out
}

/// Sliding frame buffer providing symmetric context around each chunk.
///
/// Output appears only once `left + right + 1` frames have been seen; from
/// then on each input of `T` frames yields a window of `T + left + right`
/// frames whose center lags the input by `right` frames.
pub struct ContextBuffer {
    left: usize,
    right: usize,
    frames: Vec<Array1<f32>>,
    seen: usize,
}

impl ContextBuffer {
    pub fn new(left: usize, right: usize) -> Self {
        Self {
            left,
            right,
            frames: Vec::new(),
            seen: 0,
        }
    }

    pub fn left(&self) -> usize {
        self.left
    }

    pub fn right(&self) -> usize {
        self.right
    }

    /// Feed `mat`; returns the padded window once primed.
    pub fn wrap(&mut self, mat: &Array2<f32>) -> Option<Array2<f32>> {
        let t = mat.nrows();
        let dim = mat.ncols();
        for row in mat.outer_iter() {
            self.frames.push(row.to_owned());
        }
        self.seen += t;
        if self.seen < self.left + self.right + 1 {
            return None;
        }

        let want = self.left + t + self.right;
        while self.frames.len() > want {
            self.frames.remove(0);
        }
        let mut window = Array2::zeros((want, dim));
        let pad = want - self.frames.len();
        for (i, frame) in self.frames.iter().enumerate() {
            window.row_mut(pad + i).assign(frame);
        }
        Some(window)
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.seen = 0;
    }
}

/// Estimator configuration.
pub struct EstimatorOptions {
    pub left_context: usize,
    pub right_context: usize,
    pub apply_softmax: bool,
    pub apply_log: bool,
    /// Log priors subtracted from the (log) probabilities. Applied whenever
    /// present, regardless of contents.
    pub priors: Option<Array1<f32>>,
    pub ikey: Option<String>,
    pub okey: String,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            left_context: 0,
            right_context: 0,
            apply_softmax: false,
            apply_log: true,
            priors: None,
            ikey: None,
            okey: "prob".to_string(),
        }
    }
}

struct EstimatorWorker {
    acoustic: Box<AcousticFn>,
    context: Option<ContextBuffer>,
    apply_softmax: bool,
    apply_log: bool,
    priors: Option<Array1<f32>>,
    ikey: Option<String>,
    okey: String,
    // Packet whose probabilities are still in flight through the context
    // buffer.
    delayed: Option<Packet>,
    last_shape: Option<(usize, usize)>,
    warned_frames: bool,
}

impl EstimatorWorker {
    fn compute(&mut self, ctx: &StageContext, window: &Array2<f32>, frames: usize) -> Result<Array2<f32>> {
        let mut probs = (self.acoustic)(window)?;
        if probs.nrows() != frames && !self.warned_frames {
            warn!(
                stage = ctx.name(),
                expected = frames,
                actual = probs.nrows(),
                "acoustic function changed the frame count"
            );
            self.warned_frames = true;
        }
        if self.apply_softmax {
            probs = softmax(&probs);
        }
        if self.apply_log {
            probs.mapv_inplace(|x| x.max(EPSILON).ln());
        }
        if let Some(priors) = &self.priors {
            if probs.ncols() != priors.len() {
                return Err(DecodeError::BadProbabilityDim {
                    stage: ctx.name().to_string(),
                    expected: priors.len(),
                    actual: probs.ncols(),
                }
                .into());
            }
            for mut row in probs.axis_iter_mut(Axis(0)) {
                row -= priors;
            }
        }
        Ok(probs)
    }

    fn input_matrix<'a>(&self, ctx: &StageContext, packet: &'a Packet) -> Result<&'a Array2<f32>> {
        let key = match &self.ikey {
            Some(k) => k.as_str(),
            None => ctx.input_key(packet)?,
        };
        match packet.get(key) {
            Some(Payload::Matrix(mat)) => Ok(mat),
            Some(other) => Err(GraphError::PayloadMismatch {
                stage: ctx.name().to_string(),
                expected: "matrix",
                actual: other.kind(),
            }
            .into()),
            None => Err(GraphError::MissingKey {
                stage: ctx.name().to_string(),
                key: key.to_string(),
            }
            .into()),
        }
    }

    /// Flush the frames still buffered behind the right context by pushing
    /// a zero matrix of the last seen shape.
    fn flush_delayed(&mut self, ctx: &mut StageContext) -> Result<()> {
        let held = self.delayed.take();
        if let (Some(mut held), Some(shape)) = (held, self.last_shape) {
            let zeros = Array2::zeros(shape);
            let window = match self.context.as_mut() {
                Some(context) => context.wrap(&zeros),
                None => None,
            };
            if let Some(window) = window {
                let probs = self.compute(ctx, &window, shape.0)?;
                held.add(self.okey.clone(), Payload::Matrix(probs), true);
                ctx.put_packet(held)?;
            }
        }
        if let Some(context) = self.context.as_mut() {
            context.reset();
        }
        Ok(())
    }
}

impl Worker for EstimatorWorker {
    fn run(&mut self, ctx: &mut StageContext) -> Result<()> {
        loop {
            match ctx.decide_action()? {
                Action::Proceed => {
                    let mut packet = ctx.get_packet()?;
                    if !packet.is_empty() {
                        let mat = self.input_matrix(ctx, &packet)?.clone();
                        self.last_shape = Some(mat.dim());
                        match self.context.as_mut() {
                            Some(context) => match context.wrap(&mat) {
                                None => {
                                    // Still priming: hold the packet.
                                    self.delayed = Some(packet);
                                    continue;
                                }
                                Some(window) => {
                                    let probs =
                                        self.compute(ctx, &window, mat.nrows())?;
                                    // The window's center belongs to the
                                    // packet delayed by the right context.
                                    let mut target = match self.delayed.take() {
                                        Some(held) => {
                                            self.delayed = Some(packet);
                                            held
                                        }
                                        None => packet,
                                    };
                                    target.add(
                                        self.okey.clone(),
                                        Payload::Matrix(probs),
                                        true,
                                    );
                                    ctx.put_packet(target)?;
                                    continue;
                                }
                            },
                            None => {
                                let probs = self.compute(ctx, &mat, mat.nrows())?;
                                packet.add(self.okey.clone(), Payload::Matrix(probs), true);
                                ctx.put_packet(packet)?;
                                continue;
                            }
                        }
                    }
                    if packet.is_endpoint() {
                        self.flush_delayed(ctx)?;
                        ctx.put_packet(packet)?;
                    }
                }
                Action::Final => {
                    self.flush_delayed(ctx)?;
                    ctx.put_packet(Packet::endpoint(u64::MAX, ctx.id()))?;
                    ctx.out_pipe().stop();
                    return Ok(());
                }
                Action::Stopped => return Ok(()),
                Action::RetryLater => ctx.yield_now(),
            }
        }
    }

    fn on_reset(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.reset();
        }
        self.delayed = None;
        self.last_shape = None;
        self.warned_frames = false;
    }
}

/// Stage wrapping the caller's acoustic network.
pub struct AcousticEstimator {
    core: StageCore,
}

impl AcousticEstimator {
    pub fn new(
        acoustic: Box<AcousticFn>,
        options: EstimatorOptions,
        config: RuntimeConfig,
    ) -> Self {
        let context = if options.left_context > 0 || options.right_context > 0 {
            Some(ContextBuffer::new(
                options.left_context,
                options.right_context,
            ))
        } else {
            None
        };
        let worker = EstimatorWorker {
            acoustic,
            context,
            apply_softmax: options.apply_softmax,
            apply_log: options.apply_log,
            priors: options.priors,
            ikey: options.ikey.clone(),
            okey: options.okey.clone(),
            delayed: None,
            last_shape: None,
            warned_frames: false,
        };
        let core = StageCore::new(
            "AcousticEstimator",
            config,
            options.ikey,
            vec![options.okey],
            InputArity::Exactly(1),
            1,
            worker,
        );
        Self { core }
    }
}

impl Node for AcousticEstimator {
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
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn cfg() -> RuntimeConfig {
        RuntimeConfig {
            timeout_secs: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let data = arr2(&[[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]]);
        let out = softmax(&data);
        for row in out.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        assert!(out[[0, 2]] > out[[0, 1]]);
    }

    #[test]
    fn test_log_softmax_matches_log_of_softmax() {
        let data = arr2(&[[0.5f32, -1.5, 2.0]]);
        let a = log_softmax(&data);
        let b = softmax(&data).mapv(f32::ln);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_context_buffer_primes_then_slides() {
        let mut context = ContextBuffer::new(2, 2, );
        let chunk = Array2::from_elem((2, 3), 1.0f32);
        // 2 frames seen: below left + right + 1 = 5.
        assert!(context.wrap(&chunk).is_none());
        // 4 frames seen: still priming.
        assert!(context.wrap(&chunk).is_none());
        // 6 frames seen: a (2 + 2 + 2) x 3 window appears.
        let window = context.wrap(&chunk).unwrap();
        assert_eq!(window.dim(), (6, 3));
    }

    #[test]
    fn test_estimator_without_context_is_positional() {
        let config = cfg();
        let input = Pipe::new("probs", &config);
        input
            .put(Packet::new(
                "feat",
                Payload::Matrix(arr2(&[[1.0f32, 0.0], [0.0, 1.0]])),
                7,
                3,
            ))
            .unwrap();
        input.stop();

        let mut estimator = AcousticEstimator::new(
            Box::new(|mat: &Array2<f32>| Ok(mat.clone())),
            EstimatorOptions {
                apply_log: false,
                ..Default::default()
            },
            config,
        );
        estimator.start(vec![input]).unwrap();
        estimator.wait().unwrap();

        let groups = estimator.out_pipe().to_list().unwrap();
        let packet = &groups[0][0];
        // Ids preserved, result attached under the output key as main.
        assert_eq!(packet.cid(), 7);
        assert_eq!(packet.producer(), 3);
        assert_eq!(packet.main_key(), Some("prob"));
        assert!(packet.get("feat").is_some());
    }

    #[test]
    fn test_priors_are_subtracted_even_when_zero() {
        let config = cfg();
        let input = Pipe::new("probs", &config);
        input
            .put(Packet::new(
                "feat",
                Payload::Matrix(arr2(&[[0.2f32, 0.8]])),
                0,
                0,
            ))
            .unwrap();
        input.stop();

        let mut estimator = AcousticEstimator::new(
            Box::new(|mat: &Array2<f32>| Ok(mat.clone())),
            EstimatorOptions {
                apply_log: false,
                priors: Some(ndarray::arr1(&[0.0f32, 0.0])),
                ..Default::default()
            },
            config,
        );
        estimator.start(vec![input]).unwrap();
        estimator.wait().unwrap();

        let groups = estimator.out_pipe().to_list().unwrap();
        let probs = groups[0][0].main().unwrap().as_matrix().unwrap();
        assert_abs_diff_eq!(probs[[0, 1]], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_context_flush_emits_all_chunks() {
        let config = cfg();
        let input = Pipe::new("feats", &config);
        for cid in 0..4u64 {
            input
                .put(Packet::new(
                    "feat",
                    Payload::Matrix(Array2::from_elem((3, 2), cid as f32)),
                    cid,
                    0,
                ))
                .unwrap();
        }
        input.stop();

        let mut estimator = AcousticEstimator::new(
            Box::new(|mat: &Array2<f32>| Ok(mat.clone())),
            EstimatorOptions {
                left_context: 2,
                right_context: 2,
                apply_log: false,
                ..Default::default()
            },
            config,
        );
        estimator.start(vec![input]).unwrap();
        estimator.wait().unwrap();

        let groups = estimator.out_pipe().to_list().unwrap();
        // Every input chunk resurfaces with probabilities attached, in
        // chunk-id order.
        let cids: Vec<u64> = groups[0].iter().map(|p| p.cid()).collect();
        assert_eq!(cids, vec![0, 1, 2, 3]);
        for packet in &groups[0] {
            let probs = packet.get("prob").unwrap().as_matrix().unwrap();
            assert_eq!(probs.ncols(), 2);
        }
    }

    #[test]
    fn test_bad_prior_dim_kills_stage() {
        let config = cfg();
        let input = Pipe::new("probs", &config);
        input
            .put(Packet::new(
                "feat",
                Payload::Matrix(arr2(&[[0.2f32, 0.8]])),
                0,
                0,
            ))
            .unwrap();
        input.stop();

        let mut estimator = AcousticEstimator::new(
            Box::new(|mat: &Array2<f32>| Ok(mat.clone())),
            EstimatorOptions {
                apply_log: false,
                priors: Some(ndarray::arr1(&[0.0f32, 0.0, 0.0])),
                ..Default::default()
            },
            config,
        );
        estimator.start(vec![input]).unwrap();
        assert!(estimator.wait().is_err());
    }
}
