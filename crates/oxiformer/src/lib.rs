//! # oxiformer
//!
//! Transformer building blocks with logical-axis sharding metadata.
//!
//! ## Crates
//!
//! - **core**: Tensor engine with broadcasting, batched matmul and softmax
//! - **module**: DenseGeneral, LayerNorm, LayerNormDenseGeneral, LayerNormMLP,
//!   initializers, dropout, parameter trees and axis rules
//! - **transformer**: dot-product and multi-head attention, relative position
//!   biases, rotary embeddings and the full transformer layer
//! - **nn**: the public layer API, re-exported from `module` and `transformer`

/// Core tensor engine.
pub use oxiformer_core as core;

/// Dense and normalization layers.
pub use oxiformer_module as module;

/// Attention and transformer layers.
pub use oxiformer_transformer as transformer;

pub mod nn;
