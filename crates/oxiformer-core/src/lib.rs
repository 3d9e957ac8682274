//! Dense row-major tensors backing the oxiformer layers.

pub mod dtype;
pub mod error;
pub mod shape;
pub mod tensor;

pub use dtype::Float;
pub use error::{TensorError, TensorResult};
pub use shape::Shape;
pub use tensor::Tensor;
