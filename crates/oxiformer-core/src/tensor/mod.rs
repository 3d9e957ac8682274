//! The [`Tensor`] type: a shape over a flat row-major buffer.
//!
//! Layout changes live in `layout`, element-wise math and reductions in
//! `ops`, batched matrix products in `matmul`.

mod layout;
mod matmul;
mod ops;

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::dtype::Float;
use crate::error::{TensorError, TensorResult};
use crate::shape::Shape;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct Tensor<T: Float> {
    shape: Shape,
    data: Vec<T>,
}

fn seeded(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

impl<T: Float> Tensor<T> {
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> TensorResult<Self> {
        let shape = Shape::new(shape);
        if shape.numel() != data.len() {
            return Err(TensorError::DataLength {
                len: data.len(),
                shape: shape.to_vec(),
            });
        }
        Ok(Tensor { shape, data })
    }

    /// Wrap a buffer whose length is known to match `shape`.
    pub(crate) fn from_parts(shape: Shape, data: Vec<T>) -> Self {
        debug_assert_eq!(shape.numel(), data.len());
        Tensor { shape, data }
    }

    pub fn full(shape: Vec<usize>, value: T) -> Self {
        let shape = Shape::new(shape);
        let data = vec![value; shape.numel()];
        Tensor { shape, data }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, T::zero())
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        Self::full(shape, T::one())
    }

    pub fn scalar(value: T) -> Self {
        Tensor {
            shape: Shape::scalar(),
            data: vec![value],
        }
    }

    /// 1-D tensor copied from `values`.
    pub fn from_slice(values: &[T]) -> Self {
        Tensor {
            shape: Shape::new(vec![values.len()]),
            data: values.to_vec(),
        }
    }

    /// Samples from `U[0, 1)`.
    pub fn rand_with<R: Rng>(shape: Vec<usize>, rng: &mut R) -> Self {
        let shape = Shape::new(shape);
        let data = (0..shape.numel())
            .map(|_| T::from_f64(rng.gen::<f64>()))
            .collect();
        Tensor { shape, data }
    }

    /// Samples from `N(0, 1)` via Box-Muller, two per uniform pair.
    pub fn randn_with<R: Rng>(shape: Vec<usize>, rng: &mut R) -> Self {
        let shape = Shape::new(shape);
        let n = shape.numel();
        let mut data = Vec::with_capacity(n + 1);
        while data.len() < n {
            let radius = (-2.0 * rng.gen::<f64>().max(f64::MIN_POSITIVE).ln()).sqrt();
            let (sin, cos) = (std::f64::consts::TAU * rng.gen::<f64>()).sin_cos();
            data.push(T::from_f64(radius * cos));
            data.push(T::from_f64(radius * sin));
        }
        data.truncate(n);
        Tensor { shape, data }
    }

    /// Uniform tensor, reproducible when `seed` is given.
    pub fn rand(shape: Vec<usize>, seed: Option<u64>) -> Self {
        Self::rand_with(shape, &mut seeded(seed))
    }

    /// Standard normal tensor, reproducible when `seed` is given.
    pub fn randn(shape: Vec<usize>, seed: Option<u64>) -> Self {
        Self::randn_with(shape, &mut seeded(seed))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn shape_vec(&self) -> Vec<usize> {
        self.shape.to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Size of the innermost axis; 1 for scalars.
    pub fn last_dim(&self) -> usize {
        self.shape.dims().last().map_or(1, |&d| d)
    }

    /// The value of a single-element tensor.
    pub fn item(&self) -> TensorResult<T> {
        match self.data.as_slice() {
            [value] => Ok(*value),
            _ => Err(TensorError::Unsupported {
                op: "item",
                reason: format!("tensor of shape {} has {} elements", self.shape, self.numel()),
            }),
        }
    }

    fn flat_index(&self, index: &[usize]) -> TensorResult<usize> {
        if index.len() != self.ndim() {
            return Err(TensorError::Unsupported {
                op: "index",
                reason: format!("{} coordinates for rank {}", index.len(), self.ndim()),
            });
        }
        let mut flat = 0;
        for (axis, (&i, &size)) in index.iter().zip(self.shape.dims()).enumerate() {
            if i >= size {
                return Err(TensorError::IndexOutOfRange {
                    index: i,
                    axis,
                    size,
                });
            }
            flat = flat * size + i;
        }
        Ok(flat)
    }

    pub fn get(&self, index: &[usize]) -> TensorResult<T> {
        let flat = self.flat_index(index)?;
        Ok(self.data[flat])
    }

    pub fn set(&mut self, index: &[usize], value: T) -> TensorResult<()> {
        let flat = self.flat_index(index)?;
        self.data[flat] = value;
        Ok(())
    }

    /// Rows along the innermost axis.
    pub fn lanes(&self) -> std::slice::ChunksExact<'_, T> {
        let width = self.last_dim().max(1);
        self.data.chunks_exact(width)
    }

    pub fn lanes_mut(&mut self) -> std::slice::ChunksExactMut<'_, T> {
        let width = self.last_dim().max(1);
        self.data.chunks_exact_mut(width)
    }
}

impl<T: Float> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 8;
        write!(f, "Tensor{} [", self.shape)?;
        for (i, v) in self.data.iter().take(SHOWN).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:.4}", v)?;
        }
        if self.numel() > SHOWN {
            write!(f, ", .. {} more", self.numel() - SHOWN)?;
        }
        f.write_str("]")
    }
}
