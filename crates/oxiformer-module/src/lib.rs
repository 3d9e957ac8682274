//! Dense, normalization and MLP layers.
//!
//! Every layer is built from a serde-friendly config plus its input sizes,
//! owns its parameters and exposes them through [`Module`].

pub mod activations;
pub mod dense;
pub mod dropout;
pub mod error;
pub mod initializers;
pub mod layernorm;
pub mod layernorm_dense;
pub mod layernorm_mlp;
pub mod params;
pub mod sharding;

use oxiformer_core::Tensor;

/// Tensor type all layers compute in.
pub type Array = Tensor<f32>;

pub use activations::Activation;
pub use dense::{DenseGeneral, DenseGeneralConfig, LoraConfig};
pub use dropout::{ApplyMode, Dropout};
pub use error::{LayerError, LayerResult};
pub use initializers::{Distribution, FanMode, Fans, Initializer};
pub use layernorm::{LayerNorm, LayerNormConfig, LayerNormType};
pub use layernorm_dense::{LayerNormDenseGeneral, LayerNormDenseGeneralConfig};
pub use layernorm_mlp::{LayerNormMLP, LayerNormMLPConfig};
pub use params::{Module, Param, ParamTree};
pub use sharding::{
    LogicalAxisRule, LogicalRules, MeshAxes, MeshResource, ShardingError, ShardingResult,
};
