use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TensorError, TensorResult};

/// Row-major dimensions of a tensor. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    pub fn from_slice(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }

    pub fn scalar() -> Self {
        Shape::default()
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.dims.clone()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dim(&self, axis: usize) -> TensorResult<usize> {
        match self.dims.get(axis) {
            Some(&size) => Ok(size),
            None => Err(TensorError::AxisOutOfRange {
                axis: axis as isize,
                rank: self.ndim(),
            }),
        }
    }

    /// Element strides, last axis fastest.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![0; self.ndim()];
        let mut step = 1;
        for (stride, &size) in strides.iter_mut().zip(&self.dims).rev() {
            *stride = step;
            step *= size;
        }
        strides
    }

    /// `(outer, size, inner)` element counts around `axis`.
    pub fn around(&self, axis: usize) -> TensorResult<(usize, usize, usize)> {
        let size = self.dim(axis)?;
        let outer = self.dims[..axis].iter().product();
        let inner = self.dims[axis + 1..].iter().product();
        Ok((outer, size, inner))
    }

    /// Map a python-style axis (`-1` is the last) to an index.
    pub fn normalize_axis(&self, axis: isize) -> TensorResult<usize> {
        let rank = self.ndim() as isize;
        let index = if axis < 0 { rank + axis } else { axis };
        if (0..rank).contains(&index) {
            Ok(index as usize)
        } else {
            Err(TensorError::AxisOutOfRange {
                axis,
                rank: self.ndim(),
            })
        }
    }

    /// Shape both operands broadcast to, aligning trailing axes.
    pub fn broadcast(&self, other: &Shape) -> TensorResult<Shape> {
        let rank = self.ndim().max(other.ndim());
        let lhs = self.padded(rank);
        let rhs = other.padded(rank);
        lhs.iter()
            .zip(&rhs)
            .map(|(&a, &b)| match (a, b) {
                _ if a == b => Ok(a),
                (1, _) => Ok(b),
                (_, 1) => Ok(a),
                _ => Err(TensorError::Broadcast {
                    lhs: self.to_vec(),
                    rhs: other.to_vec(),
                }),
            })
            .collect::<TensorResult<Vec<_>>>()
            .map(Shape::new)
    }

    /// Strides for reading this shape as if it had `target`'s shape.
    ///
    /// Broadcast axes get stride 0. `target` must be a broadcast of `self`.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let lead = target.ndim() - self.ndim();
        let own = self.strides();
        (0..target.ndim())
            .map(|d| {
                if d < lead || self.dims[d - lead] == 1 {
                    0
                } else {
                    own[d - lead]
                }
            })
            .collect()
    }

    fn padded(&self, rank: usize) -> Vec<usize> {
        let mut dims = vec![1; rank - self.ndim()];
        dims.extend_from_slice(&self.dims);
        dims
    }

    /// Shape after moving input axis `perm[i]` to position `i`.
    pub fn permuted(&self, perm: &[usize]) -> TensorResult<Shape> {
        let invalid = || TensorError::Permutation {
            perm: perm.to_vec(),
            rank: self.ndim(),
        };
        if perm.len() != self.ndim() {
            return Err(invalid());
        }
        let mut taken = vec![false; perm.len()];
        for &axis in perm {
            match taken.get_mut(axis) {
                Some(slot) if !*slot => *slot = true,
                _ => return Err(invalid()),
            }
        }
        Ok(Shape::new(perm.iter().map(|&axis| self.dims[axis]).collect()))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(usize::to_string).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}
