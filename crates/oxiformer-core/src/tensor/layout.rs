use crate::dtype::Float;
use crate::error::{TensorError, TensorResult};
use crate::shape::Shape;

use super::Tensor;

/// Visit every offset of a strided view in row-major order of `dims`.
pub(super) fn for_each_offset<F: FnMut(usize)>(dims: &[usize], strides: &[usize], mut f: F) {
    if dims.iter().any(|&d| d == 0) {
        return;
    }
    let mut coord = vec![0; dims.len()];
    let mut offset = 0;
    loop {
        f(offset);
        let mut axis = dims.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            coord[axis] += 1;
            offset += strides[axis];
            if coord[axis] < dims[axis] {
                break;
            }
            offset -= strides[axis] * dims[axis];
            coord[axis] = 0;
        }
    }
}

impl<T: Float> Tensor<T> {
    fn with_shape(&self, dims: Vec<usize>) -> Tensor<T> {
        Tensor::from_parts(Shape::new(dims), self.data.clone())
    }

    /// Same elements under a new shape with the same element count.
    pub fn reshape(&self, dims: Vec<usize>) -> TensorResult<Tensor<T>> {
        let count: usize = dims.iter().product();
        if count != self.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: dims,
                got: self.shape_vec(),
            });
        }
        Ok(self.with_shape(dims))
    }

    pub fn flatten(&self) -> Tensor<T> {
        self.with_shape(vec![self.numel()])
    }

    /// Swap the two innermost axes.
    pub fn t(&self) -> TensorResult<Tensor<T>> {
        let rank = self.ndim();
        if rank < 2 {
            return Err(TensorError::Unsupported {
                op: "t",
                reason: format!("rank {} has no matrix axes", rank),
            });
        }
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(rank - 2, rank - 1);
        self.permute(&perm)
    }

    /// Output axis `i` is input axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> TensorResult<Tensor<T>> {
        let shape = self.shape.permuted(perm)?;
        if perm.iter().enumerate().all(|(i, &p)| i == p) {
            return Ok(self.clone());
        }
        let source = self.shape.strides();
        let strides: Vec<usize> = perm.iter().map(|&p| source[p]).collect();
        let mut data = Vec::with_capacity(self.numel());
        for_each_offset(shape.dims(), &strides, |offset| data.push(self.data[offset]));
        Ok(Tensor::from_parts(shape, data))
    }

    /// Insert a size-1 axis before `axis` (`axis == ndim` appends).
    pub fn unsqueeze(&self, axis: usize) -> TensorResult<Tensor<T>> {
        if axis > self.ndim() {
            return Err(TensorError::AxisOutOfRange {
                axis: axis as isize,
                rank: self.ndim(),
            });
        }
        let mut dims = self.shape_vec();
        dims.insert(axis, 1);
        Ok(self.with_shape(dims))
    }

    /// Drop `axis`, which must have size 1.
    pub fn squeeze_axis(&self, axis: usize) -> TensorResult<Tensor<T>> {
        let size = self.shape.dim(axis)?;
        if size != 1 {
            return Err(TensorError::Unsupported {
                op: "squeeze_axis",
                reason: format!("axis {} has size {}", axis, size),
            });
        }
        let mut dims = self.shape_vec();
        dims.remove(axis);
        Ok(self.with_shape(dims))
    }

    /// Join tensors that agree on every axis except `axis`.
    pub fn concatenate(parts: &[&Tensor<T>], axis: usize) -> TensorResult<Tensor<T>> {
        let first = parts.first().ok_or(TensorError::Empty)?;
        let (outer, _, inner) = first.shape.around(axis)?;
        let mut dims = first.shape_vec();
        dims[axis] = 0;
        for part in parts {
            let mut expected = first.shape_vec();
            expected[axis] = part.shape.dims().get(axis).copied().unwrap_or(0);
            if part.shape.dims() != expected.as_slice() {
                return Err(TensorError::ShapeMismatch {
                    expected,
                    got: part.shape_vec(),
                });
            }
            dims[axis] += expected[axis];
        }

        let mut data = Vec::with_capacity(outer * dims[axis] * inner);
        for o in 0..outer {
            for part in parts {
                let block = part.shape.dims()[axis] * inner;
                data.extend_from_slice(&part.data[o * block..(o + 1) * block]);
            }
        }
        Ok(Tensor::from_parts(Shape::new(dims), data))
    }

    fn check_window(&self, axis: usize, start: usize, len: usize) -> TensorResult<(usize, usize, usize)> {
        let (outer, size, inner) = self.shape.around(axis)?;
        if start + len > size {
            return Err(TensorError::IndexOutOfRange {
                index: start + len,
                axis,
                size,
            });
        }
        Ok((outer, size, inner))
    }

    /// Entries `start..start + len` of `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> TensorResult<Tensor<T>> {
        let (outer, size, inner) = self.check_window(axis, start, len)?;
        let data = (0..outer)
            .flat_map(|o| {
                let from = (o * size + start) * inner;
                self.data[from..from + len * inner].iter().copied()
            })
            .collect();
        let mut dims = self.shape_vec();
        dims[axis] = len;
        Ok(Tensor::from_parts(Shape::new(dims), data))
    }

    /// Write `src` over entries `start..` of `axis`; the inverse of [`Tensor::narrow`].
    pub fn narrow_assign(&mut self, axis: usize, start: usize, src: &Tensor<T>) -> TensorResult<()> {
        let len = src.shape.dim(axis)?;
        let mut expected = self.shape_vec();
        expected[axis] = len;
        if src.shape.dims() != expected.as_slice() {
            return Err(TensorError::ShapeMismatch {
                expected,
                got: src.shape_vec(),
            });
        }
        let (_, size, inner) = self.check_window(axis, start, len)?;
        let block = len * inner;
        for (o, chunk) in src.data.chunks(block.max(1)).enumerate() {
            let to = (o * size + start) * inner;
            self.data[to..to + chunk.len()].copy_from_slice(chunk);
        }
        Ok(())
    }

    /// `parts` equal slices along `axis`.
    pub fn split(&self, axis: usize, parts: usize) -> TensorResult<Vec<Tensor<T>>> {
        let size = self.shape.dim(axis)?;
        if parts == 0 || size % parts != 0 {
            return Err(TensorError::Unsupported {
                op: "split",
                reason: format!("axis of size {} into {} parts", size, parts),
            });
        }
        let len = size / parts;
        (0..parts).map(|p| self.narrow(axis, p * len, len)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iota(dims: Vec<usize>) -> Tensor<f32> {
        let n = dims.iter().product::<usize>();
        Tensor::new((0..n).map(|v| v as f32).collect(), dims).unwrap()
    }

    #[test]
    fn test_offsets_walk_row_major() {
        let mut seen = Vec::new();
        for_each_offset(&[2, 3], &[1, 2], |o| seen.push(o));
        assert_eq!(seen, vec![0, 2, 4, 1, 3, 5]);

        let mut count = 0;
        for_each_offset(&[], &[], |_| count += 1);
        assert_eq!(count, 1);
        for_each_offset(&[3, 0], &[1, 1], |_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_permute_and_transpose() {
        let a = iota(vec![2, 3, 4]);
        let p = a.permute(&[1, 0, 2]).unwrap();
        assert_eq!(p.shape_vec(), vec![3, 2, 4]);
        assert_eq!(p.get(&[2, 1, 3]).unwrap(), a.get(&[1, 2, 3]).unwrap());

        let t = a.t().unwrap();
        assert_eq!(t.shape_vec(), vec![2, 4, 3]);
        assert_eq!(t.get(&[1, 3, 2]).unwrap(), a.get(&[1, 2, 3]).unwrap());
        assert!(Tensor::<f32>::zeros(vec![3]).t().is_err());
    }

    #[test]
    fn test_reshape_and_axes() {
        let a = iota(vec![2, 6]);
        assert_eq!(a.reshape(vec![3, 4]).unwrap().shape_vec(), vec![3, 4]);
        assert!(a.reshape(vec![5]).is_err());
        let u = a.unsqueeze(1).unwrap();
        assert_eq!(u.shape_vec(), vec![2, 1, 6]);
        assert_eq!(u.squeeze_axis(1).unwrap(), a);
        assert!(a.squeeze_axis(0).is_err());
        assert_eq!(a.flatten().shape_vec(), vec![12]);
    }

    #[test]
    fn test_narrow_split_assign() {
        let a = iota(vec![2, 6]);
        assert_eq!(a.narrow(1, 2, 2).unwrap().data(), &[2.0, 3.0, 8.0, 9.0]);

        let parts = a.split(1, 3).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].data(), &[4.0, 5.0, 10.0, 11.0]);
        assert!(a.split(1, 4).is_err());

        let mut z: Tensor<f32> = Tensor::zeros(vec![2, 6]);
        z.narrow_assign(1, 4, &parts[0]).unwrap();
        assert_eq!(z.data(), &[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 6.0, 7.0]);
        assert!(z.narrow_assign(1, 5, &parts[0]).is_err());
    }

    #[test]
    fn test_concatenate() {
        let a = Tensor::new(vec![1.0f32, 2.0, 3.0, 4.0], vec![2, 2]).unwrap();
        let b = Tensor::new(vec![5.0f32, 6.0], vec![2, 1]).unwrap();
        let c = Tensor::concatenate(&[&a, &b], 1).unwrap();
        assert_eq!(c.shape_vec(), vec![2, 3]);
        assert_eq!(c.data(), &[1.0, 2.0, 5.0, 3.0, 4.0, 6.0]);
        assert!(Tensor::concatenate(&[&a, &b], 0).is_err());
        assert!(Tensor::<f32>::concatenate(&[], 0).is_err());
    }
}
