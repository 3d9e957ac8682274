use std::str::FromStr;

use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};
use crate::initializers::{Fans, Initializer};
use crate::params::{Module, Param};
use crate::Array;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerNormType {
    #[default]
    #[serde(rename = "layernorm", alias = "layer_norm")]
    LayerNorm,
    #[serde(rename = "rmsnorm", alias = "rms_norm")]
    RmsNorm,
}

impl FromStr for LayerNormType {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "layernorm" | "layer_norm" => Ok(LayerNormType::LayerNorm),
            "rmsnorm" | "rms_norm" => Ok(LayerNormType::RmsNorm),
            other => Err(LayerError::InvalidConfig(format!(
                "unknown layernorm type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerNormConfig {
    pub layernorm_type: LayerNormType,
    pub epsilon: f32,
    /// Store gamma as an offset from one.
    pub zero_centered_gamma: bool,
    /// Defaults to ones, or zeros with `zero_centered_gamma`.
    pub scale_init: Option<Initializer>,
    pub scale_axes: Vec<String>,
    pub bias_init: Initializer,
    pub bias_axes: Vec<String>,
}

impl Default for LayerNormConfig {
    fn default() -> Self {
        LayerNormConfig {
            layernorm_type: LayerNormType::LayerNorm,
            epsilon: 1e-6,
            zero_centered_gamma: false,
            scale_init: None,
            scale_axes: vec!["embed".to_string()],
            bias_init: Initializer::Zeros,
            bias_axes: vec!["embed".to_string()],
        }
    }
}

impl LayerNormConfig {
    pub fn validate(&self) -> LayerResult<()> {
        if self.layernorm_type == LayerNormType::RmsNorm && self.zero_centered_gamma {
            return Err(LayerError::InvalidConfig(
                "zero_centered_gamma is not supported with rmsnorm".to_string(),
            ));
        }
        if self.epsilon < 0.0 {
            return Err(LayerError::InvalidConfig(format!(
                "epsilon must be non-negative, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

/// Layer normalization or RMS normalization over the last axis.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub config: LayerNormConfig,
    pub scale: Param,
    pub ln_bias: Option<Param>,
    hidden: usize,
}

impl LayerNorm {
    pub fn new<R: Rng>(config: LayerNormConfig, hidden: usize, rng: &mut R) -> LayerResult<Self> {
        config.validate()?;
        let fans = Fans::split_at(&[hidden], 1);
        let scale_init = config.scale_init.clone().unwrap_or(if config.zero_centered_gamma {
            Initializer::Zeros
        } else {
            Initializer::Ones
        });
        let scale = Param::new(scale_init.init(&[hidden], fans, rng), &config.scale_axes)?;
        let ln_bias = match config.layernorm_type {
            LayerNormType::LayerNorm => Some(Param::new(
                config.bias_init.init(&[hidden], fans, rng),
                &config.bias_axes,
            )?),
            LayerNormType::RmsNorm => None,
        };
        debug!("LayerNorm({:?}, hidden={})", config.layernorm_type, hidden);
        Ok(LayerNorm {
            config,
            scale,
            ln_bias,
            hidden,
        })
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn forward(&self, x: &Array) -> LayerResult<Array> {
        if x.ndim() == 0 || x.last_dim() != self.hidden {
            return Err(LayerError::InvalidConfig(format!(
                "LayerNorm expects a last dim of {}, got shape {}",
                self.hidden,
                x.shape()
            )));
        }
        trace!("LayerNorm forward {}", x.shape());

        let eps = self.config.epsilon;
        let n = self.hidden as f32;
        let mut out = x.clone();
        for lane in out.lanes_mut() {
            match self.config.layernorm_type {
                LayerNormType::LayerNorm => {
                    let mean = lane.iter().sum::<f32>() / n;
                    let var = lane.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
                    let inv = 1.0 / (var + eps).sqrt();
                    for v in lane.iter_mut() {
                        *v = (*v - mean) * inv;
                    }
                }
                LayerNormType::RmsNorm => {
                    let ms = lane.iter().map(|v| v * v).sum::<f32>() / n;
                    let inv = 1.0 / (ms + eps).sqrt();
                    for v in lane.iter_mut() {
                        *v *= inv;
                    }
                }
            }
        }

        let gamma = if self.config.zero_centered_gamma {
            self.scale.value.add_scalar(1.0)
        } else {
            self.scale.value.clone()
        };
        let mut out = out.mul(&gamma)?;
        if let Some(bias) = &self.ln_bias {
            out = out.add(&bias.value)?;
        }
        Ok(out)
    }
}

impl Module for LayerNorm {
    fn named_params(&self) -> Vec<(String, &Param)> {
        let mut params = vec![("scale".to_string(), &self.scale)];
        if let Some(bias) = &self.ln_bias {
            params.push(("ln_bias".to_string(), bias));
        }
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut params = vec![("scale".to_string(), &mut self.scale)];
        if let Some(bias) = &mut self.ln_bias {
            params.push(("ln_bias".to_string(), bias));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn test_layernorm_normalizes_rows() {
        let ln = LayerNorm::new(LayerNormConfig::default(), 4, &mut rng()).unwrap();
        let x = Array::new(vec![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0], vec![2, 4]).unwrap();
        let y = ln.forward(&x).unwrap();
        let row: Vec<f32> = y.data()[..4].to_vec();
        assert_abs_diff_eq!(row.iter().sum::<f32>(), 0.0, epsilon = 1e-5);
        let var = row.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-4);
        // constant row maps to zero
        assert!(y.data()[4..].iter().all(|v| v.abs() < 1e-6));
        assert_eq!(ln.param_count(), 8);
    }

    #[test]
    fn test_rmsnorm() {
        let config = LayerNormConfig {
            layernorm_type: LayerNormType::RmsNorm,
            epsilon: 0.0,
            ..LayerNormConfig::default()
        };
        let ln = LayerNorm::new(config, 2, &mut rng()).unwrap();
        let y = ln.forward(&Array::from_slice(&[3.0, 4.0])).unwrap();
        let rms = (12.5f32).sqrt();
        assert_abs_diff_eq!(y.data()[0], 3.0 / rms, epsilon = 1e-6);
        assert_abs_diff_eq!(y.data()[1], 4.0 / rms, epsilon = 1e-6);
        let names: Vec<String> = ln.named_params().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["scale"]);
    }

    #[test]
    fn test_zero_centered_gamma() {
        let config = LayerNormConfig {
            zero_centered_gamma: true,
            ..LayerNormConfig::default()
        };
        let ln = LayerNorm::new(config, 2, &mut rng()).unwrap();
        assert_eq!(ln.scale.value.sum_all(), 0.0);
        let y = ln.forward(&Array::from_slice(&[-1.0, 1.0])).unwrap();
        assert_abs_diff_eq!(y.data()[1], 1.0, epsilon = 1e-5);

        let bad = LayerNormConfig {
            layernorm_type: LayerNormType::RmsNorm,
            zero_centered_gamma: true,
            ..LayerNormConfig::default()
        };
        assert!(matches!(
            LayerNorm::new(bad, 2, &mut rng()),
            Err(LayerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_hidden() {
        let ln = LayerNorm::new(LayerNormConfig::default(), 4, &mut rng()).unwrap();
        assert!(ln.forward(&Array::ones(vec![2, 3])).is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: LayerNormConfig =
            serde_json::from_str(r#"{"layernorm_type": "rmsnorm", "epsilon": 1e-5}"#).unwrap();
        assert_eq!(config.layernorm_type, LayerNormType::RmsNorm);
        assert_eq!(config.scale_axes, vec!["embed".to_string()]);
        assert_eq!("layernorm".parse::<LayerNormType>().unwrap(), LayerNormType::LayerNorm);
    }
}
