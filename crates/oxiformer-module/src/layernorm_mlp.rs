use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activations::Activation;
use crate::dense::{DenseGeneral, DenseGeneralConfig, LoraConfig};
use crate::dropout::{ApplyMode, Dropout};
use crate::error::{LayerError, LayerResult};
use crate::initializers::Initializer;
use crate::layernorm::{LayerNorm, LayerNormConfig};
use crate::params::{prefixed, prefixed_mut, Module, Param};
use crate::Array;

fn axes(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerNormMLPConfig {
    pub enable_layernorm: bool,
    pub layernorm: LayerNormConfig,
    pub intermediate_dim: usize,
    /// One activation per intermediate branch; the branches are multiplied.
    pub activations: Vec<Activation>,
    pub intermediate_dropout_rate: f32,
    pub intermediate_hidden_dropout_dims: Vec<isize>,
    pub use_bias: bool,
    pub kernel_init: Initializer,
    pub kernel_axes_1: Vec<String>,
    pub kernel_axes_2: Vec<String>,
    pub bias_init: Initializer,
    pub bias_axes_1: Vec<String>,
    pub bias_axes_2: Vec<String>,
    pub return_layernorm_output: bool,
    #[serde(flatten)]
    pub lora: LoraConfig,
}

impl Default for LayerNormMLPConfig {
    fn default() -> Self {
        LayerNormMLPConfig {
            enable_layernorm: true,
            layernorm: LayerNormConfig::default(),
            intermediate_dim: 2048,
            activations: vec![Activation::Relu],
            intermediate_dropout_rate: 0.1,
            intermediate_hidden_dropout_dims: Vec::new(),
            use_bias: false,
            kernel_init: Initializer::kernel_default(),
            kernel_axes_1: axes(&["embed", "act", "mlp"]),
            kernel_axes_2: axes(&["mlp", "embed"]),
            bias_init: Initializer::Zeros,
            bias_axes_1: axes(&["act", "mlp"]),
            bias_axes_2: axes(&["embed"]),
            return_layernorm_output: true,
            lora: LoraConfig::default(),
        }
    }
}

/// Layer normalization followed by a gated two-layer feed-forward block.
#[derive(Debug, Clone)]
pub struct LayerNormMLP {
    pub config: LayerNormMLPConfig,
    pub layernorm: Option<LayerNorm>,
    pub wi: DenseGeneral,
    pub wo: DenseGeneral,
    dropout: Dropout,
}

impl LayerNormMLP {
    pub fn new<R: Rng>(config: LayerNormMLPConfig, hidden: usize, rng: &mut R) -> LayerResult<Self> {
        if config.activations.is_empty() {
            return Err(LayerError::InvalidConfig(
                "LayerNormMLP needs at least one activation".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&config.intermediate_dropout_rate) {
            return Err(LayerError::InvalidConfig(format!(
                "intermediate_dropout_rate must be in [0, 1], got {}",
                config.intermediate_dropout_rate
            )));
        }
        let layernorm = if config.enable_layernorm {
            Some(LayerNorm::new(config.layernorm.clone(), hidden, rng)?)
        } else {
            None
        };

        let wi_config = DenseGeneralConfig {
            features: vec![config.activations.len(), config.intermediate_dim],
            axis: vec![-1],
            use_bias: config.use_bias,
            kernel_init: config.kernel_init.clone(),
            kernel_axes: config.kernel_axes_1.clone(),
            bias_init: config.bias_init.clone(),
            bias_axes: config.bias_axes_1.clone(),
            lora: config.lora.clone(),
        };
        let wi = DenseGeneral::new(wi_config, &[hidden], rng)?;

        let wo_config = DenseGeneralConfig {
            features: vec![hidden],
            axis: vec![-1],
            use_bias: config.use_bias,
            kernel_init: config.kernel_init.clone(),
            kernel_axes: config.kernel_axes_2.clone(),
            bias_init: config.bias_init.clone(),
            bias_axes: config.bias_axes_2.clone(),
            lora: config.lora.clone(),
        };
        let wo = DenseGeneral::new(wo_config, &[config.intermediate_dim], rng)?;

        let dropout = Dropout::with_broadcast_dims(
            config.intermediate_dropout_rate,
            &config.intermediate_hidden_dropout_dims,
        );
        debug!(
            "LayerNormMLP(hidden={}, intermediate={}, activations={:?})",
            hidden, config.intermediate_dim, config.activations
        );
        Ok(LayerNormMLP {
            config,
            layernorm,
            wi,
            wo,
            dropout,
        })
    }

    pub fn forward(&self, x: &Array, mode: &mut ApplyMode) -> LayerResult<(Array, Option<Array>)> {
        trace!("LayerNormMLP forward {}", x.shape());
        let y = match &self.layernorm {
            Some(ln) => ln.forward(x)?,
            None => x.clone(),
        };

        // [..., n_act, intermediate]
        let h = self.wi.forward(&y)?;
        let act_axis = h.ndim() - 2;
        let branches = h.split(act_axis, self.config.activations.len())?;
        let mut gated: Option<Array> = None;
        for (branch, act) in branches.iter().zip(&self.config.activations) {
            let a = act.apply(branch);
            gated = Some(match gated {
                Some(g) => g.mul(&a)?,
                None => a,
            });
        }
        let gated = gated
            .ok_or_else(|| LayerError::InvalidConfig("no activations".to_string()))?
            .squeeze_axis(act_axis)?;

        let gated = self.dropout.apply(&gated, mode)?;
        let out = self.wo.forward(&gated)?;
        let ln_out = self.config.return_layernorm_output.then_some(y);
        Ok((out, ln_out))
    }
}

impl Module for LayerNormMLP {
    fn named_params(&self) -> Vec<(String, &Param)> {
        let mut params = match &self.layernorm {
            Some(ln) => ln.named_params(),
            None => Vec::new(),
        };
        params.extend(prefixed("wi_", self.wi.named_params()));
        params.extend(prefixed("wo_", self.wo.named_params()));
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut params = match &mut self.layernorm {
            Some(ln) => ln.named_params_mut(),
            None => Vec::new(),
        };
        params.extend(prefixed_mut("wi_", self.wi.named_params_mut()));
        params.extend(prefixed_mut("wo_", self.wo.named_params_mut()));
        params
    }
}
