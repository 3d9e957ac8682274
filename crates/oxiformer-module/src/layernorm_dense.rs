use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dense::{DenseGeneral, DenseGeneralConfig, LoraConfig};
use crate::error::{LayerError, LayerResult};
use crate::initializers::Initializer;
use crate::layernorm::{LayerNorm, LayerNormConfig};
use crate::params::{Module, Param};
use crate::Array;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerNormDenseGeneralConfig {
    pub features: Vec<usize>,
    pub enable_layernorm: bool,
    pub layernorm: LayerNormConfig,
    pub use_bias: bool,
    pub kernel_init: Initializer,
    pub kernel_axes: Vec<String>,
    pub bias_init: Initializer,
    pub bias_axes: Vec<String>,
    pub return_layernorm_output: bool,
    /// Divide the projection by this value.
    pub depth_scaling: Option<f32>,
    #[serde(flatten)]
    pub lora: LoraConfig,
}

impl Default for LayerNormDenseGeneralConfig {
    fn default() -> Self {
        LayerNormDenseGeneralConfig {
            features: Vec::new(),
            enable_layernorm: true,
            layernorm: LayerNormConfig::default(),
            use_bias: false,
            kernel_init: Initializer::kernel_default(),
            kernel_axes: Vec::new(),
            bias_init: Initializer::Zeros,
            bias_axes: Vec::new(),
            return_layernorm_output: true,
            depth_scaling: None,
            lora: LoraConfig::default(),
        }
    }
}

impl LayerNormDenseGeneralConfig {
    pub fn new(features: &[usize]) -> Self {
        LayerNormDenseGeneralConfig {
            features: features.to_vec(),
            ..Self::default()
        }
    }

    fn dense_config(&self) -> DenseGeneralConfig {
        DenseGeneralConfig {
            features: self.features.clone(),
            axis: vec![-1],
            use_bias: self.use_bias,
            kernel_init: self.kernel_init.clone(),
            kernel_axes: self.kernel_axes.clone(),
            bias_init: self.bias_init.clone(),
            bias_axes: self.bias_axes.clone(),
            lora: self.lora.clone(),
        }
    }
}

/// Optional layer normalization followed by a projection of the last axis.
#[derive(Debug, Clone)]
pub struct LayerNormDenseGeneral {
    pub config: LayerNormDenseGeneralConfig,
    pub layernorm: Option<LayerNorm>,
    pub dense: DenseGeneral,
}

impl LayerNormDenseGeneral {
    pub fn new<R: Rng>(
        config: LayerNormDenseGeneralConfig,
        hidden: usize,
        rng: &mut R,
    ) -> LayerResult<Self> {
        if let Some(d) = config.depth_scaling {
            if d == 0.0 {
                return Err(LayerError::InvalidConfig(
                    "depth_scaling must be non-zero".to_string(),
                ));
            }
        }
        let layernorm = if config.enable_layernorm {
            Some(LayerNorm::new(config.layernorm.clone(), hidden, rng)?)
        } else {
            None
        };
        let dense = DenseGeneral::new(config.dense_config(), &[hidden], rng)?;
        debug!(
            "LayerNormDenseGeneral(hidden={}, features={:?}, layernorm={})",
            hidden, config.features, config.enable_layernorm
        );
        Ok(LayerNormDenseGeneral {
            config,
            layernorm,
            dense,
        })
    }

    /// Returns the projection and, if `return_layernorm_output` is set, the
    /// normalized input (the raw input when normalization is disabled).
    pub fn forward(&self, x: &Array) -> LayerResult<(Array, Option<Array>)> {
        trace!("LayerNormDenseGeneral forward {}", x.shape());
        let y = match &self.layernorm {
            Some(ln) => ln.forward(x)?,
            None => x.clone(),
        };
        let mut z = self.dense.forward(&y)?;
        if let Some(d) = self.config.depth_scaling {
            z = z.div_scalar(d);
        }
        let ln_out = self.config.return_layernorm_output.then_some(y);
        Ok((z, ln_out))
    }
}

impl Module for LayerNormDenseGeneral {
    fn named_params(&self) -> Vec<(String, &Param)> {
        let mut params = match &self.layernorm {
            Some(ln) => ln.named_params(),
            None => Vec::new(),
        };
        params.extend(self.dense.named_params());
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut params = match &mut self.layernorm {
            Some(ln) => ln.named_params_mut(),
            None => Vec::new(),
        };
        params.extend(self.dense.named_params_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layernorm::LayerNormType;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(2)
    }

    #[test]
    fn test_returns_layernorm_output() {
        let mut layer = LayerNormDenseGeneral::new(LayerNormDenseGeneralConfig::new(&[3]), 4, &mut rng()).unwrap();
        layer.dense.kernel.value = Array::ones(vec![4, 3]);
        let x = Array::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 1, 4]).unwrap();
        let (z, ln_out) = layer.forward(&x).unwrap();
        assert_eq!(z.shape_vec(), vec![1, 1, 3]);
        // normalized rows sum to zero, so an all-ones kernel yields zeros
        assert!(z.data().iter().all(|v| v.abs() < 1e-5));
        let ln_out = ln_out.unwrap();
        assert_abs_diff_eq!(ln_out.sum_all(), 0.0, epsilon = 1e-5);

        let names: Vec<String> = layer.named_params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["scale", "ln_bias", "kernel"]);
    }

    #[test]
    fn test_without_layernorm_passes_input_through() {
        let config = LayerNormDenseGeneralConfig {
            enable_layernorm: false,
            depth_scaling: Some(2.0),
            use_bias: true,
            ..LayerNormDenseGeneralConfig::new(&[2])
        };
        let mut layer = LayerNormDenseGeneral::new(config, 2, &mut rng()).unwrap();
        layer.dense.kernel.value = Array::new(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]).unwrap();
        let x = Array::new(vec![2.0, 6.0], vec![1, 2]).unwrap();
        let (z, ln_out) = layer.forward(&x).unwrap();
        assert_eq!(z.data(), &[1.0, 3.0]);
        assert_eq!(ln_out.unwrap(), x);
        assert_eq!(layer.named_params().len(), 2);
    }

    #[test]
    fn test_rmsnorm_and_no_ln_output() {
        let config = LayerNormDenseGeneralConfig {
            layernorm: LayerNormConfig {
                layernorm_type: LayerNormType::RmsNorm,
                ..LayerNormConfig::default()
            },
            return_layernorm_output: false,
            ..LayerNormDenseGeneralConfig::new(&[3, 8])
        };
        let layer = LayerNormDenseGeneral::new(config, 16, &mut rng()).unwrap();
        let (z, ln_out) = layer.forward(&Array::randn(vec![2, 5, 16], Some(4))).unwrap();
        assert_eq!(z.shape_vec(), vec![2, 5, 3, 8]);
        assert!(ln_out.is_none());
        assert_eq!(layer.param_count(), 16 + 16 * 24);
    }

    #[test]
    fn test_zero_depth_scaling_rejected() {
        let config = LayerNormDenseGeneralConfig {
            depth_scaling: Some(0.0),
            ..LayerNormDenseGeneralConfig::new(&[2])
        };
        assert!(LayerNormDenseGeneral::new(config, 2, &mut rng()).is_err());
    }
}
