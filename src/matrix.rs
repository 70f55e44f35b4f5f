//! Dense matrix storage and the math backend.
//!
//! Two things live here:
//!
//! - [`Matrix`]: an owned, row-major `Vec<f32>` matrix used for weights,
//!   weight gradients, and optimizer accumulators. These persist across
//!   forward/backward sweeps, so they own their storage instead of living
//!   in the shared arena.
//! - The math backend: free functions over raw `&[f32]` slices with explicit
//!   row strides. All transient matrices (activations, gradient buffers,
//!   pack staging) are slices of the arena, and their logical width is often
//!   narrower than their storage stride (a bias column, or a column block of
//!   a wider matrix), so every kernel takes the stride explicitly.
//!
//! ## Parallelism
//!
//! Matrix multiplies and large elementwise passes are parallelized with
//! Rayon over destination rows. Small problems stay sequential: the work
//! threshold avoids paying fork/join overhead on the tiny matrices that
//! dominate unit tests and small networks.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Minimum multiply-add count before a kernel goes parallel.
const PAR_THRESHOLD: usize = 4_096;

/// Owned row-major matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Zero-filled matrix of the given shape.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build from existing data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            rows * cols,
            "data length {} does not match shape {}x{}",
            data.len(),
            rows,
            cols
        );
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|v| *v = value);
    }
}

/// `dest[m,n] = a[m,k] · b[k,n]ᵀ`-free form: `dest = a · b` where `b` is
/// addressed `[n, k]` row-major, i.e. `dest[i][j] = Σ_l a[i][l] · b[j][l]`.
///
/// The workhorse of the forward pass: activations `[batch, fan_in+1]` times
/// weights `[n, fan_in+1]` without materializing a transpose.
pub fn matmul_nt(
    dest: &mut [f32],
    dest_stride: usize,
    a: &[f32],
    a_stride: usize,
    b: &[f32],
    b_stride: usize,
    m: usize,
    n: usize,
    k: usize,
) {
    debug_assert!(dest.len() >= m.saturating_sub(1) * dest_stride + n.min(dest_stride));
    let body = |i: usize, dest_row: &mut [f32]| {
        let a_row = &a[i * a_stride..i * a_stride + k];
        for (j, out) in dest_row.iter_mut().take(n).enumerate() {
            let b_row = &b[j * b_stride..j * b_stride + k];
            let mut sum = 0.0;
            for l in 0..k {
                sum += a_row[l] * b_row[l];
            }
            *out = sum;
        }
    };
    run_rows(dest, dest_stride, m, n * k, body);
}

/// `dest[i][j] = Σ_l a[i][l] · b[l][j]` with `a: [m, k]`, `b: [k, *]`.
///
/// `n` may be smaller than `b_stride`, which is how the backward pass drops
/// a weight matrix's bias column without copying.
pub fn matmul_nn(
    dest: &mut [f32],
    dest_stride: usize,
    a: &[f32],
    a_stride: usize,
    b: &[f32],
    b_stride: usize,
    m: usize,
    n: usize,
    k: usize,
) {
    debug_assert!(dest.len() >= m.saturating_sub(1) * dest_stride + n.min(dest_stride));
    let body = |i: usize, dest_row: &mut [f32]| {
        let a_row = &a[i * a_stride..i * a_stride + k];
        let out = &mut dest_row[..n];
        out.iter_mut().for_each(|v| *v = 0.0);
        for (l, &a_val) in a_row.iter().enumerate() {
            let b_row = &b[l * b_stride..l * b_stride + n];
            for (o, &b_val) in out.iter_mut().zip(b_row.iter()) {
                *o += a_val * b_val;
            }
        }
    };
    run_rows(dest, dest_stride, m, n * k, body);
}

/// `dest[i][j] = Σ_s a[s][i] · b[s][j]` with `a: [k, *]`, `b: [k, *]`,
/// `dest: [m, n]`.
///
/// Weight gradients: `dLdW = dLdAᵀ · prev_activations`, summed over the
/// batch dimension `k`.
pub fn matmul_tn(
    dest: &mut [f32],
    dest_stride: usize,
    a: &[f32],
    a_stride: usize,
    b: &[f32],
    b_stride: usize,
    m: usize,
    n: usize,
    k: usize,
) {
    debug_assert!(dest.len() >= m.saturating_sub(1) * dest_stride + n.min(dest_stride));
    let body = |i: usize, dest_row: &mut [f32]| {
        let out = &mut dest_row[..n];
        out.iter_mut().for_each(|v| *v = 0.0);
        for s in 0..k {
            let a_val = a[s * a_stride + i];
            let b_row = &b[s * b_stride..s * b_stride + n];
            for (o, &b_val) in out.iter_mut().zip(b_row.iter()) {
                *o += a_val * b_val;
            }
        }
    };
    run_rows(dest, dest_stride, m, n * k, body);
}

/// Dispatch a per-row kernel sequentially or in parallel depending on the
/// amount of work per row times the row count.
fn run_rows<F>(dest: &mut [f32], dest_stride: usize, m: usize, work_per_row: usize, body: F)
where
    F: Fn(usize, &mut [f32]) + Sync + Send,
{
    if m == 0 {
        return;
    }
    if m * work_per_row >= PAR_THRESHOLD && dest_stride > 0 {
        dest[..m * dest_stride]
            .par_chunks_mut(dest_stride)
            .enumerate()
            .for_each(|(i, row)| body(i, row));
    } else {
        for i in 0..m {
            let row = &mut dest[i * dest_stride..i * dest_stride + dest_stride];
            body(i, row);
        }
    }
}

/// Copy a `rows x cols` block between two strided matrices.
pub fn copy_block(
    dst: &mut [f32],
    dst_stride: usize,
    src: &[f32],
    src_stride: usize,
    rows: usize,
    cols: usize,
) {
    for r in 0..rows {
        let d = &mut dst[r * dst_stride..r * dst_stride + cols];
        let s = &src[r * src_stride..r * src_stride + cols];
        d.copy_from_slice(s);
    }
}

/// Accumulate-add a `rows x cols` block: `dst += src`.
pub fn add_block(
    dst: &mut [f32],
    dst_stride: usize,
    src: &[f32],
    src_stride: usize,
    rows: usize,
    cols: usize,
) {
    for r in 0..rows {
        let d = &mut dst[r * dst_stride..r * dst_stride + cols];
        let s = &src[r * src_stride..r * src_stride + cols];
        for (dv, sv) in d.iter_mut().zip(s.iter()) {
            *dv += sv;
        }
    }
}

/// Scale every row's first `cols` entries by a per-row factor.
pub fn scale_rows(dst: &mut [f32], dst_stride: usize, rows: usize, cols: usize, factors: &[f32]) {
    for r in 0..rows {
        let f = factors[r];
        for v in dst[r * dst_stride..r * dst_stride + cols].iter_mut() {
            *v *= f;
        }
    }
}

/// Zero a strided block.
pub fn zero_block(dst: &mut [f32], dst_stride: usize, rows: usize, cols: usize) {
    for r in 0..rows {
        dst[r * dst_stride..r * dst_stride + cols]
            .iter_mut()
            .for_each(|v| *v = 0.0);
    }
}

/// L2 norm of a slice.
pub fn l2_norm(v: &[f32]) -> f32 {
    if v.len() >= PAR_THRESHOLD {
        v.par_iter().map(|x| x * x).sum::<f32>().sqrt()
    } else {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }
}

/// Scale a slice in place.
pub fn scale(v: &mut [f32], factor: f32) {
    if v.len() >= PAR_THRESHOLD {
        v.par_iter_mut().for_each(|x| *x *= factor);
    } else {
        v.iter_mut().for_each(|x| *x *= factor);
    }
}

/// Clamp each weight row's L2 norm to `cap`, measured over the first
/// `active_cols` columns of each row. Rows under the cap are untouched;
/// rows over it are rescaled so their norm equals the cap exactly,
/// preserving direction.
pub fn clamp_row_norms(weights: &mut Matrix, active_cols: usize, cap: f32) {
    let cols = weights.cols();
    debug_assert!(active_cols <= cols);
    for r in 0..weights.rows() {
        let row = weights.row_mut(r);
        let norm = l2_norm(&row[..active_cols]);
        if norm > cap {
            let factor = cap / norm;
            for v in row[..active_cols].iter_mut() {
                *v *= factor;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_nt_identity() {
        // a: [2,2], b rows are the identity's rows -> dest == a
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0];
        let mut dest = [0.0; 4];
        matmul_nt(&mut dest, 2, &a, 2, &b, 2, 2, 2, 2);
        assert_eq!(dest, a);
    }

    #[test]
    fn test_matmul_nt_strided_dest() {
        // dest has a trailing bias column (stride 3, n = 2) that must
        // survive untouched.
        let a = [1.0, 0.0, 0.0, 1.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut dest = [9.0; 6];
        matmul_nt(&mut dest, 3, &a, 2, &b, 2, 2, 2, 2);
        assert_eq!(dest, [5.0, 7.0, 9.0, 6.0, 8.0, 9.0]);
    }

    #[test]
    fn test_matmul_nn_drops_trailing_columns() {
        // b is [2, 3] but only the first 2 columns participate (n = 2).
        let a = [1.0, 1.0];
        let b = [1.0, 2.0, 99.0, 3.0, 4.0, 99.0];
        let mut dest = [0.0; 2];
        matmul_nn(&mut dest, 2, &a, 2, &b, 3, 1, 2, 2);
        assert_eq!(dest, [4.0, 6.0]);
    }

    #[test]
    fn test_matmul_tn_sums_over_batch() {
        // a: [2 samples, 2 units], b: [2 samples, 1 input]
        // dest[i][j] = sum_s a[s][i] * b[s][j]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [10.0, 100.0];
        let mut dest = [0.0; 2];
        matmul_tn(&mut dest, 1, &a, 2, &b, 1, 2, 1, 2);
        assert_eq!(dest, [1.0 * 10.0 + 3.0 * 100.0, 2.0 * 10.0 + 4.0 * 100.0]);
    }

    #[test]
    fn test_copy_and_add_block() {
        let src = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut dst = [0.0; 8];
        copy_block(&mut dst, 4, &src, 3, 2, 3);
        assert_eq!(dst, [1.0, 2.0, 3.0, 0.0, 4.0, 5.0, 6.0, 0.0]);
        add_block(&mut dst, 4, &src, 3, 2, 3);
        assert_eq!(dst, [2.0, 4.0, 6.0, 0.0, 8.0, 10.0, 12.0, 0.0]);
    }

    #[test]
    fn test_clamp_row_norms_rescales_exactly() {
        let mut w = Matrix::from_vec(2, 3, vec![3.0, 4.0, 7.0, 0.1, 0.1, 7.0]);
        // active_cols = 2 excludes the last (bias) column from the norm.
        clamp_row_norms(&mut w, 2, 1.0);
        let r0 = w.row(0);
        let norm = (r0[0] * r0[0] + r0[1] * r0[1]).sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        // Direction preserved: 3:4 ratio.
        assert!((r0[0] / r0[1] - 0.75).abs() < 1e-6);
        // Bias column untouched.
        assert_eq!(r0[2], 7.0);
        // Row under the cap untouched.
        assert_eq!(w.row(1), &[0.1, 0.1, 7.0]);
    }

    #[test]
    fn test_large_matmul_matches_naive() {
        // Exercise the parallel path against a naive reference.
        let m = 40;
        let n = 30;
        let k = 20;
        let a: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 - 3.0).collect();
        let b: Vec<f32> = (0..n * k).map(|i| (i % 5) as f32 - 2.0).collect();
        let mut dest = vec![0.0; m * n];
        matmul_nt(&mut dest, n, &a, k, &b, k, m, n, k);
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for l in 0..k {
                    sum += a[i * k + l] * b[j * k + l];
                }
                assert!((dest[i * n + j] - sum).abs() < 1e-4);
            }
        }
    }
}
