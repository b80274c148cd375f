//! Frame-context transforms: delta regression, splicing, dense projection.

use ndarray::{s, Array2};

/// Regression coefficient rows for orders `0..=order`.
///
/// Order 0 is the identity; each higher order convolves the previous row
/// with the normalized ramp `[-window, ..., window] / sum(j^2)`.
fn delta_coefficients(order: usize, window: usize) -> Vec<Vec<f32>> {
    let mut scales: Vec<Vec<f32>> = vec![vec![1.0]];
    let normalizer: f32 = (1..=window).map(|j| 2.0 * (j * j) as f32).sum();
    for o in 1..=order {
        let prev = &scales[o - 1];
        let mut cur = vec![0.0f32; prev.len() + 2 * window];
        for j in -(window as i32)..=(window as i32) {
            for (k, &p) in prev.iter().enumerate() {
                cur[(j + window as i32) as usize + k] += j as f32 * p / normalizer;
            }
        }
        scales.push(cur);
    }
    scales
}

/// Append first..`order`-th delta blocks to every frame, clamping at the
/// sequence edges. Output shape: `(frames, dim * (order + 1))`.
pub fn add_deltas(feats: &Array2<f32>, order: usize, window: usize) -> Array2<f32> {
    debug_assert!(order > 0 && window > 0);
    let frames = feats.nrows();
    let dim = feats.ncols();
    let coeffs = delta_coefficients(order, window);
    let mut out = Array2::zeros((frames, dim * (order + 1)));

    for t in 0..frames {
        for (o, row) in coeffs.iter().enumerate() {
            let half = (row.len() - 1) / 2;
            let mut dst = out.slice_mut(s![t, o * dim..(o + 1) * dim]);
            for (idx, &c) in row.iter().enumerate() {
                if c == 0.0 {
                    continue;
                }
                let offset = idx as i64 - half as i64;
                let src_t = (t as i64 + offset).clamp(0, frames as i64 - 1) as usize;
                dst.scaled_add(c, &feats.row(src_t));
            }
        }
    }
    out
}

/// Concatenate `[t-left, ..., t+right]` around every frame, replicating the
/// first and last frames at the edges. Output shape:
/// `(frames, dim * (left + 1 + right))`.
pub fn splice_feats(feats: &Array2<f32>, left: usize, right: usize) -> Array2<f32> {
    if left == 0 && right == 0 {
        return feats.clone();
    }
    let frames = feats.nrows();
    let dim = feats.ncols();
    let width = left + 1 + right;
    let mut out = Array2::zeros((frames, dim * width));
    for t in 0..frames {
        for (slot, offset) in (-(left as i64)..=(right as i64)).enumerate() {
            let src_t = (t as i64 + offset).clamp(0, frames as i64 - 1) as usize;
            out.slice_mut(s![t, slot * dim..(slot + 1) * dim])
                .assign(&feats.row(src_t));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_deltas_of_constant_signal_vanish() {
        let feats = Array2::from_elem((20, 3), 5.0f32);
        let out = add_deltas(&feats, 2, 2);
        assert_eq!(out.dim(), (20, 9));
        for t in 0..20 {
            for d in 3..9 {
                assert_abs_diff_eq!(out[[t, d]], 0.0, epsilon = 1e-5);
            }
            assert_abs_diff_eq!(out[[t, 0]], 5.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_first_delta_of_ramp_is_slope() {
        // x[t] = t, so the regression slope is 1 away from the edges.
        let feats = Array2::from_shape_fn((30, 1), |(t, _)| t as f32);
        let out = add_deltas(&feats, 1, 2);
        for t in 2..28 {
            assert_abs_diff_eq!(out[[t, 1]], 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_splice_replicates_edges() {
        let feats = arr2(&[[1.0f32], [2.0], [3.0]]);
        let out = splice_feats(&feats, 1, 1);
        assert_eq!(out.dim(), (3, 3));
        // First frame: left context clamps to frame 0.
        assert_eq!(out.row(0).to_vec(), vec![1.0, 1.0, 2.0]);
        assert_eq!(out.row(1).to_vec(), vec![1.0, 2.0, 3.0]);
        // Last frame: right context clamps to the tail.
        assert_eq!(out.row(2).to_vec(), vec![2.0, 3.0, 3.0]);
    }

    #[test]
    fn test_splice_zero_context_is_identity() {
        let feats = arr2(&[[1.0f32, 2.0], [3.0, 4.0]]);
        assert_eq!(splice_feats(&feats, 0, 0), feats);
    }
}
