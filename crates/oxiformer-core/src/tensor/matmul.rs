use rayon::prelude::*;

use crate::dtype::Float;
use crate::error::{TensorError, TensorResult};
use crate::shape::Shape;

use super::Tensor;

/// `out += a · b` for row-major `a: [m, k]`, `b: [k, n]`.
fn gemm_into<T: Float>(a: &[T], b: &[T], out: &mut [T], k: usize, n: usize) {
    for (out_row, a_row) in out.chunks_mut(n).zip(a.chunks(k)) {
        for (&scale, b_row) in a_row.iter().zip(b.chunks(n)) {
            for (o, &x) in out_row.iter_mut().zip(b_row) {
                *o += scale * x;
            }
        }
    }
}

fn strip_leading_ones(dims: &[usize]) -> &[usize] {
    let lead = dims.iter().take_while(|&&d| d == 1).count();
    &dims[lead..]
}

impl<T: Float> Tensor<T> {
    /// Product over the two innermost axes.
    ///
    /// Leading axes are batch axes. They must match on both sides (up to
    /// leading size-1 axes), or one side holds a single matrix that is then
    /// reused for every batch entry. Batches run in parallel.
    pub fn matmul(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let (lhs, rhs) = (self.shape.dims(), other.shape.dims());
        if lhs.len() < 2 || rhs.len() < 2 {
            return Err(TensorError::Unsupported {
                op: "matmul",
                reason: format!("operands {} and {} need rank >= 2", self.shape, other.shape),
            });
        }
        let (lhs_batch, lhs_mat) = lhs.split_at(lhs.len() - 2);
        let (rhs_batch, rhs_mat) = rhs.split_at(rhs.len() - 2);
        let (m, k, n) = (lhs_mat[0], lhs_mat[1], rhs_mat[1]);
        if rhs_mat[0] != k {
            return Err(TensorError::ShapeMismatch {
                expected: vec![k, n],
                got: rhs_mat.to_vec(),
            });
        }

        let lhs_count: usize = lhs_batch.iter().product();
        let rhs_count: usize = rhs_batch.iter().product();
        let same_batch = strip_leading_ones(lhs_batch) == strip_leading_ones(rhs_batch);
        let batch_dims = match (lhs_count, rhs_count) {
            _ if same_batch && lhs_batch.len() >= rhs_batch.len() => lhs_batch,
            _ if same_batch => rhs_batch,
            (_, 1) => lhs_batch,
            (1, _) => rhs_batch,
            _ => {
                return Err(TensorError::Broadcast {
                    lhs: self.shape_vec(),
                    rhs: other.shape_vec(),
                })
            }
        };
        let mut dims = batch_dims.to_vec();
        dims.extend([m, n]);

        let batches = lhs_count.max(rhs_count);
        let mut data = vec![T::zero(); batches * m * n];
        if m * n > 0 && k > 0 {
            let lhs_step = if lhs_count == 1 { 0 } else { m * k };
            let rhs_step = if rhs_count == 1 { 0 } else { k * n };
            data.par_chunks_mut(m * n).enumerate().for_each(|(i, out)| {
                let a = &self.data[i * lhs_step..i * lhs_step + m * k];
                let b = &other.data[i * rhs_step..i * rhs_step + k * n];
                gemm_into(a, b, out, k, n);
            });
        }
        Ok(Tensor::from_parts(Shape::new(dims), data))
    }
}
