use oxiformer_core::TensorError;
use thiserror::Error;

use crate::sharding::ShardingError;

/// Error type for layer construction, forward passes and checkpoints.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error(transparent)]
    Sharding(#[from] ShardingError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing parameter: {0}")]
    MissingParam(String),

    #[error("Unexpected parameter: {0}")]
    UnexpectedParam(String),

    #[error("Parameter {name} has shape {got:?}, expected {expected:?}")]
    ParamShape {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Dropout needs a random generator, build the ApplyMode with ApplyMode::train")]
    MissingRng,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type LayerResult<T> = Result<T, LayerError>;
