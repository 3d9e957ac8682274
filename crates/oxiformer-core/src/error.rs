use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TensorError {
    #[error("{len} values cannot fill shape {shape:?}")]
    DataLength { len: usize, shape: Vec<usize> },

    #[error("expected shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("shapes {lhs:?} and {rhs:?} do not broadcast")]
    Broadcast { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: isize, rank: usize },

    #[error("index {index} out of range for axis {axis} of size {size}")]
    IndexOutOfRange {
        index: usize,
        axis: usize,
        size: usize,
    },

    #[error("{perm:?} is not a permutation of {rank} axes")]
    Permutation { perm: Vec<usize>, rank: usize },

    #[error("{op}: {reason}")]
    Unsupported { op: &'static str, reason: String },

    #[error("operation needs at least one element")]
    Empty,
}

pub type TensorResult<T> = Result<T, TensorError>;
