use crate::dtype::Float;
use crate::error::{TensorError, TensorResult};
use crate::shape::Shape;

use super::layout::for_each_offset;
use super::Tensor;

impl<T: Float> Tensor<T> {
    pub fn apply<F: Fn(T) -> T>(&self, f: F) -> Tensor<T> {
        let data = self.data.iter().map(|&x| f(x)).collect();
        Tensor::from_parts(self.shape.clone(), data)
    }

    pub fn apply_mut<F: Fn(T) -> T>(&mut self, f: F) {
        self.data.iter_mut().for_each(|x| *x = f(*x));
    }

    pub fn exp(&self) -> Tensor<T> {
        self.apply(T::exp)
    }

    pub fn sqrt(&self) -> Tensor<T> {
        self.apply(T::sqrt)
    }

    pub fn tanh_elem(&self) -> Tensor<T> {
        self.apply(T::tanh)
    }

    pub fn relu(&self) -> Tensor<T> {
        self.apply(|x| x.max(T::zero()))
    }

    pub fn sigmoid(&self) -> Tensor<T> {
        self.apply(|x| (T::one() + (-x).exp()).recip())
    }

    pub fn add_scalar(&self, s: T) -> Tensor<T> {
        self.apply(|x| x + s)
    }

    pub fn mul_scalar(&self, s: T) -> Tensor<T> {
        self.apply(|x| x * s)
    }

    pub fn div_scalar(&self, s: T) -> Tensor<T> {
        self.apply(|x| x / s)
    }

    /// Combine with `other` element-wise after broadcasting both shapes.
    pub fn zip_with<F: Fn(T, T) -> T>(&self, other: &Tensor<T>, f: F) -> TensorResult<Tensor<T>> {
        if self.shape == other.shape {
            let data = self.data.iter().zip(&other.data).map(|(&a, &b)| f(a, b)).collect();
            return Ok(Tensor::from_parts(self.shape.clone(), data));
        }
        let shape = self.shape.broadcast(&other.shape)?;
        let lhs = self.broadcast_view(&shape);
        let rhs = other.broadcast_view(&shape);
        let data = lhs.into_iter().zip(rhs).map(|(a, b)| f(a, b)).collect();
        Ok(Tensor::from_parts(shape, data))
    }

    /// Elements in the order of `target`, repeating along broadcast axes.
    fn broadcast_view(&self, target: &Shape) -> Vec<T> {
        if &self.shape == target {
            return self.data.clone();
        }
        let strides = self.shape.broadcast_strides(target);
        let mut out = Vec::with_capacity(target.numel());
        for_each_offset(target.dims(), &strides, |offset| out.push(self.data[offset]));
        out
    }

    pub fn add(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn div(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        self.zip_with(other, |a, b| a / b)
    }

    /// `fill` wherever the broadcast `mask` is non-zero. The mask may not
    /// grow this tensor's shape.
    pub fn where_mask(&self, mask: &Tensor<T>, fill: T) -> TensorResult<Tensor<T>> {
        if self.shape.broadcast(&mask.shape)? != self.shape {
            return Err(TensorError::Broadcast {
                lhs: self.shape_vec(),
                rhs: mask.shape_vec(),
            });
        }
        self.zip_with(mask, |x, m| if m.is_zero() { x } else { fill })
    }

    pub fn sum_all(&self) -> T {
        self.data.iter().copied().sum()
    }

    pub fn mean_all(&self) -> T {
        self.sum_all() / T::from_usize(self.numel())
    }

    pub fn max_all(&self) -> TensorResult<T> {
        self.data.iter().copied().reduce(T::max).ok_or(TensorError::Empty)
    }

    pub fn min_all(&self) -> TensorResult<T> {
        self.data.iter().copied().reduce(T::min).ok_or(TensorError::Empty)
    }

    /// Sum over `axis`, removing it.
    pub fn sum_axis(&self, axis: usize) -> TensorResult<Tensor<T>> {
        let (outer, size, inner) = self.shape.around(axis)?;
        let mut data = vec![T::zero(); outer * inner];
        for (o, acc) in data.chunks_mut(inner.max(1)).enumerate().take(outer) {
            for slab in self.data[o * size * inner..(o + 1) * size * inner].chunks(inner.max(1)) {
                acc.iter_mut().zip(slab).for_each(|(a, &x)| *a += x);
            }
        }
        let mut dims = self.shape_vec();
        dims.remove(axis);
        Ok(Tensor::from_parts(Shape::new(dims), data))
    }

    /// Numerically stable softmax over the innermost axis.
    pub fn softmax(&self) -> TensorResult<Tensor<T>> {
        let mut out = self.clone();
        for lane in out.lanes_mut() {
            let peak = lane.iter().copied().fold(T::neg_infinity(), T::max);
            lane.iter_mut().for_each(|v| *v = (*v - peak).exp());
            let total: T = lane.iter().copied().sum();
            lane.iter_mut().for_each(|v| *v = *v / total);
        }
        Ok(out)
    }
}
