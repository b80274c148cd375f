//! Online cepstral mean (and variance) normalization.
//!
//! Normalizers are not stages: they are embedded inside a feature processor
//! and applied in place to freshly arrived frames. An `offset` restricts a
//! normalizer to the dim-slice `[offset, offset + dim)`, so several CMVNs can
//! coexist in one processor over concatenated feature types.

use std::sync::{Arc, Mutex};

use ndarray::{s, Array1, Array2, ArrayViewMut2, Axis};

use crate::config::EPSILON;
use crate::errors::{FeatureError, Result};

/// Shared handle letting the caller reach into a running processor (e.g. to
/// freeze a sliding CMVN mid-stream).
pub type SharedCmvn = Arc<Mutex<dyn CmvnNormalizer>>;

pub fn shared<C: CmvnNormalizer + 'static>(cmvn: C) -> SharedCmvn {
    Arc::new(Mutex::new(cmvn))
}

/// A mean (and optionally variance) normalizer applied frame by frame.
pub trait CmvnNormalizer: Send {
    /// Slice start, or `None` for the whole vector.
    fn offset(&self) -> Option<usize>;

    /// Normalized width, once known.
    fn dim(&self) -> Option<usize>;

    /// Normalize `frames` in place. `frames` is already sliced to this
    /// normalizer's dim range.
    fn apply(&mut self, frames: ArrayViewMut2<f32>) -> Result<()>;

    /// Clear any accumulated state.
    fn reset(&mut self) {}
}

/// Normalize rows given first/second moment rows.
fn normalize_rows(mut frames: ArrayViewMut2<f32>, moments: &Array2<f32>, std: bool) {
    let mean = moments.row(0);
    if std {
        let meansq = moments.row(1);
        for mut row in frames.outer_iter_mut() {
            for ((x, &m), &m2) in row.iter_mut().zip(mean.iter()).zip(meansq.iter()) {
                let sigma = (m2 - m * m).max(EPSILON).sqrt();
                *x = (*x - m) / sigma;
            }
        }
    } else {
        for mut row in frames.outer_iter_mut() {
            for (x, &m) in row.iter_mut().zip(mean.iter()) {
                *x -= m;
            }
        }
    }
}

/// CMVN frozen to a pre-computed statistics matrix of shape `(1|2, D + 1)`:
/// sum row, optional sum-of-squares row, frame count in the last column.
pub struct ConstantCmvn {
    moments: Array2<f32>,
    std: bool,
    offset: Option<usize>,
}

impl ConstantCmvn {
    pub fn new(stats: Array2<f32>, std: bool, offset: Option<usize>) -> Result<Self> {
        if stats.nrows() == 0 || stats.ncols() < 2 || (std && stats.nrows() < 2) {
            return Err(FeatureError::ShapeMismatch {
                context: "constant cmvn stats".to_string(),
                expected: 2,
                actual: stats.nrows(),
            }
            .into());
        }
        let dim = stats.ncols() - 1;
        let count = stats[[0, dim]];
        if count <= 0.0 {
            return Err(FeatureError::ShapeMismatch {
                context: "constant cmvn frame count".to_string(),
                expected: 1,
                actual: 0,
            }
            .into());
        }
        let mut moments = Array2::zeros((stats.nrows(), dim));
        moments.assign(&stats.slice(s![.., 0..dim]));
        moments.mapv_inplace(|x| x / count);
        Ok(Self {
            moments,
            std,
            offset,
        })
    }

    /// Adopt already-normalized moment rows (mean / mean-square).
    pub fn from_moments(moments: Array2<f32>, std: bool, offset: Option<usize>) -> Self {
        Self {
            moments,
            std,
            offset,
        }
    }
}

impl CmvnNormalizer for ConstantCmvn {
    fn offset(&self) -> Option<usize> {
        self.offset
    }

    fn dim(&self) -> Option<usize> {
        Some(self.moments.ncols())
    }

    fn apply(&mut self, frames: ArrayViewMut2<f32>) -> Result<()> {
        if frames.ncols() != self.moments.ncols() {
            return Err(FeatureError::ShapeMismatch {
                context: "constant cmvn".to_string(),
                expected: self.moments.ncols(),
                actual: frames.ncols(),
            }
            .into());
        }
        normalize_rows(frames, &self.moments, self.std);
        Ok(())
    }
}

/// Sliding-window CMVN over a ring buffer of the last `width` frames.
///
/// Until the window fills, externally supplied global statistics (if any)
/// are fused in to stabilize the estimate.
pub struct SlidingCmvn {
    width: usize,
    std: bool,
    offset: Option<usize>,
    dim: Option<usize>,
    frames: Option<Array2<f32>>,
    squares: Option<Array2<f32>>,
    sum: Option<Array1<f32>>,
    sumsq: Option<Array1<f32>>,
    ring_index: usize,
    counter: usize,
    global: Option<(Array2<f32>, f32)>,
    frozen: Option<Array2<f32>>,
}

impl SlidingCmvn {
    pub fn new(width: usize, std: bool, offset: Option<usize>) -> Self {
        debug_assert!(width > 0);
        Self {
            width,
            std,
            offset,
            dim: None,
            frames: None,
            squares: None,
            sum: None,
            sumsq: None,
            ring_index: 0,
            counter: 0,
            global: None,
            frozen: None,
        }
    }

    /// Attach global statistics of shape `(1|2, D + 1)` used while the
    /// window is still filling.
    pub fn with_global_stats(mut self, stats: Array2<f32>) -> Result<Self> {
        let dim = stats.ncols() - 1;
        let count = stats[[0, dim]];
        if count <= 0.0 || (self.std && stats.nrows() < 2) {
            return Err(FeatureError::ShapeMismatch {
                context: "sliding cmvn global stats".to_string(),
                expected: 2,
                actual: stats.nrows(),
            }
            .into());
        }
        let mut sums = Array2::zeros((stats.nrows(), dim));
        sums.assign(&stats.slice(s![.., 0..dim]));
        self.dim = Some(dim);
        self.global = Some((sums, count));
        Ok(self)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Capture the current CMVN and use it unchanged from now on.
    pub fn freeze(&mut self) {
        if self.frozen.is_none() && self.counter > 0 {
            self.frozen = Some(self.moments());
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Export the accumulated statistics as a `(1|2, D + 1)` matrix.
    pub fn stats(&self) -> Option<Array2<f32>> {
        let sum = self.sum.as_ref()?;
        let dim = sum.len();
        let rows = if self.std { 2 } else { 1 };
        let mut out = Array2::zeros((rows, dim + 1));
        out.slice_mut(s![0, 0..dim]).assign(sum);
        if let Some(sumsq) = &self.sumsq {
            out.slice_mut(s![1, 0..dim]).assign(sumsq);
        }
        out[[0, dim]] = self.counter.min(self.width) as f32;
        Some(out)
    }

    fn ensure_buffers(&mut self, dim: usize) {
        if self.frames.is_none() {
            self.frames = Some(Array2::zeros((self.width, dim)));
            self.sum = Some(Array1::zeros(dim));
            if self.std {
                self.squares = Some(Array2::zeros((self.width, dim)));
                self.sumsq = Some(Array1::zeros(dim));
            }
            self.dim = Some(dim);
        }
    }

    /// Push one frame into the ring, displacing the oldest.
    fn cache_frame(&mut self, frame: &[f32]) {
        self.ensure_buffers(frame.len());
        let frames = self.frames.as_mut().unwrap();
        let sum = self.sum.as_mut().unwrap();
        for (d, &x) in frame.iter().enumerate() {
            sum[d] += x - frames[[self.ring_index, d]];
            frames[[self.ring_index, d]] = x;
        }
        if self.std {
            let squares = self.squares.as_mut().unwrap();
            let sumsq = self.sumsq.as_mut().unwrap();
            for (d, &x) in frame.iter().enumerate() {
                let x2 = x * x;
                sumsq[d] += x2 - squares[[self.ring_index, d]];
                squares[[self.ring_index, d]] = x2;
            }
        }
        self.ring_index = (self.ring_index + 1) % self.width;
        self.counter += 1;
    }

    /// The current mean (and mean-square) rows, fusing the global stats
    /// while the window is short.
    fn moments(&self) -> Array2<f32> {
        let sum = self.sum.as_ref().expect("no frames cached");
        let dim = sum.len();
        let rows = if self.std { 2 } else { 1 };
        let mut local = Array2::zeros((rows, dim));
        local.row_mut(0).assign(sum);
        if let Some(sumsq) = &self.sumsq {
            local.row_mut(1).assign(sumsq);
        }

        if self.counter >= self.width {
            local.mapv_inplace(|x| x / self.width as f32);
            return local;
        }
        match &self.global {
            None => {
                local.mapv_inplace(|x| x / self.counter as f32);
                local
            }
            Some((gsum, gcount)) => {
                let missed = (self.width - self.counter) as f32;
                let grows = gsum.nrows().min(rows);
                if *gcount >= missed {
                    for r in 0..grows {
                        for d in 0..dim {
                            local[[r, d]] =
                                (local[[r, d]] + gsum[[r, d]] * missed / gcount) / self.width as f32;
                        }
                    }
                } else {
                    for r in 0..grows {
                        for d in 0..dim {
                            local[[r, d]] =
                                (local[[r, d]] + gsum[[r, d]]) / (self.counter as f32 + gcount);
                        }
                    }
                }
                local
            }
        }
    }
}

impl CmvnNormalizer for SlidingCmvn {
    fn offset(&self) -> Option<usize> {
        self.offset
    }

    fn dim(&self) -> Option<usize> {
        self.dim
    }

    fn apply(&mut self, mut frames: ArrayViewMut2<f32>) -> Result<()> {
        if frames.nrows() == 0 {
            return Ok(());
        }
        if let Some(dim) = self.dim {
            if frames.ncols() != dim {
                return Err(FeatureError::ShapeMismatch {
                    context: "sliding cmvn".to_string(),
                    expected: dim,
                    actual: frames.ncols(),
                }
                .into());
            }
        }
        if let Some(frozen) = self.frozen.clone() {
            normalize_rows(frames, &frozen, self.std);
            return Ok(());
        }
        for mut row in frames.axis_iter_mut(Axis(0)) {
            let frame: Vec<f32> = row.iter().copied().collect();
            self.cache_frame(&frame);
            let moments = self.moments();
            normalize_rows(row.view_mut().insert_axis(Axis(0)), &moments, self.std);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.frames = None;
        self.squares = None;
        self.sum = None;
        self.sumsq = None;
        self.ring_index = 0;
        self.counter = 0;
        self.frozen = None;
    }
}

/// Accumulate `(2, D + 1)` statistics over a speaker's utterances.
pub fn compute_stats<'a, I>(utterances: I) -> Result<Array2<f32>>
where
    I: IntoIterator<Item = &'a Array2<f32>>,
{
    let mut stats: Option<Array2<f32>> = None;
    for feat in utterances {
        let dim = feat.ncols();
        let acc = stats.get_or_insert_with(|| Array2::zeros((2, dim + 1)));
        if acc.ncols() != dim + 1 {
            return Err(FeatureError::ShapeMismatch {
                context: "speaker stats".to_string(),
                expected: acc.ncols() - 1,
                actual: dim,
            }
            .into());
        }
        for row in feat.outer_iter() {
            for (d, &x) in row.iter().enumerate() {
                acc[[0, d]] += x;
                acc[[1, d]] += x * x;
            }
        }
        acc[[0, dim]] += feat.nrows() as f32;
    }
    stats.ok_or_else(|| {
        FeatureError::ShapeMismatch {
            context: "speaker stats (no utterances)".to_string(),
            expected: 1,
            actual: 0,
        }
        .into()
    })
}
