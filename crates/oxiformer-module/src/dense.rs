use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use oxiformer_core::Shape;

use crate::error::{LayerError, LayerResult};
use crate::initializers::{Fans, Initializer};
use crate::params::{Module, Param};
use crate::Array;

/// Low-rank adaptation: `out += scaling * x·A·B` alongside the main kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub enable_low_rank_adaptation: bool,
    pub low_rank_adaptation_dim: usize,
    /// `scaling = alpha / dim`; no alpha means a scaling of one.
    pub low_rank_adaptation_alpha: Option<f32>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        LoraConfig {
            enable_low_rank_adaptation: false,
            low_rank_adaptation_dim: 32,
            low_rank_adaptation_alpha: None,
        }
    }
}

impl LoraConfig {
    pub fn scaling(&self) -> f32 {
        match self.low_rank_adaptation_alpha {
            Some(alpha) => alpha / self.low_rank_adaptation_dim as f32,
            None => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenseGeneralConfig {
    /// Output dims appended after the non-contracted input dims.
    pub features: Vec<usize>,
    /// Input axes contracted with the kernel.
    pub axis: Vec<isize>,
    pub use_bias: bool,
    pub kernel_init: Initializer,
    pub kernel_axes: Vec<String>,
    pub bias_init: Initializer,
    pub bias_axes: Vec<String>,
    #[serde(flatten)]
    pub lora: LoraConfig,
}

impl Default for DenseGeneralConfig {
    fn default() -> Self {
        DenseGeneralConfig {
            features: Vec::new(),
            axis: vec![-1],
            use_bias: true,
            kernel_init: Initializer::kernel_default(),
            kernel_axes: Vec::new(),
            bias_init: Initializer::Zeros,
            bias_axes: Vec::new(),
            lora: LoraConfig::default(),
        }
    }
}

impl DenseGeneralConfig {
    pub fn new(features: &[usize]) -> Self {
        DenseGeneralConfig {
            features: features.to_vec(),
            ..Self::default()
        }
    }
}

/// Normalize `axis` against a rank, rejecting duplicates.
fn normalize_axes(axis: &[isize], shape: &Shape) -> LayerResult<Vec<usize>> {
    let mut out = Vec::with_capacity(axis.len());
    for &a in axis {
        let a = shape.normalize_axis(a)?;
        if out.contains(&a) {
            return Err(LayerError::InvalidConfig(format!(
                "axis {} is contracted twice",
                a
            )));
        }
        out.push(a);
    }
    Ok(out)
}

/// Linear layer contracting arbitrary input axes into arbitrary output features.
#[derive(Debug, Clone)]
pub struct DenseGeneral {
    pub config: DenseGeneralConfig,
    pub kernel: Param,
    pub bias: Option<Param>,
    pub lora_a_kernel: Option<Param>,
    pub lora_b_kernel: Option<Param>,
}

impl DenseGeneral {
    /// `input_shape` only needs the right rank and contracted dim sizes;
    /// batch dims may be anything.
    pub fn new<R: Rng>(
        config: DenseGeneralConfig,
        input_shape: &[usize],
        rng: &mut R,
    ) -> LayerResult<Self> {
        if config.features.is_empty() || config.features.contains(&0) {
            return Err(LayerError::InvalidConfig(format!(
                "features must be non-empty and positive, got {:?}",
                config.features
            )));
        }
        if config.axis.is_empty() {
            return Err(LayerError::InvalidConfig("no axis to contract".to_string()));
        }
        let shape = Shape::from_slice(input_shape);
        let axes = normalize_axes(&config.axis, &shape)?;
        let contracted: Vec<usize> = axes.iter().map(|&a| input_shape[a]).collect();

        let kernel_shape: Vec<usize> = contracted.iter().chain(&config.features).copied().collect();
        let fans = Fans::split_at(&kernel_shape, contracted.len());
        let kernel = Param::new(
            config.kernel_init.init(&kernel_shape, fans, rng),
            &config.kernel_axes,
        )?;

        let bias = if config.use_bias {
            Some(Param::new(
                config.bias_init.init(&config.features, fans, rng),
                &config.bias_axes,
            )?)
        } else {
            None
        };

        let (lora_a_kernel, lora_b_kernel) = if config.lora.enable_low_rank_adaptation {
            let rank = config.lora.low_rank_adaptation_dim;
            if rank == 0 {
                return Err(LayerError::InvalidConfig(
                    "low_rank_adaptation_dim must be positive".to_string(),
                ));
            }
            let (head, last) = config.features.split_at(config.features.len() - 1);
            let a_shape: Vec<usize> = contracted
                .iter()
                .chain(head)
                .copied()
                .chain(std::iter::once(rank))
                .collect();
            let b_shape: Vec<usize> = head.iter().copied().chain([rank, last[0]]).collect();
            let a_fans = Fans::split_at(&a_shape, contracted.len());
            let a = Param::new(config.kernel_init.init(&a_shape, a_fans, rng), &[])?;
            let b = Param::new(Array::zeros(b_shape), &[])?;
            (Some(a), Some(b))
        } else {
            (None, None)
        };

        debug!(
            "DenseGeneral(kernel={:?}, bias={}, lora={})",
            kernel_shape,
            config.use_bias,
            config.lora.enable_low_rank_adaptation
        );
        Ok(DenseGeneral {
            config,
            kernel,
            bias,
            lora_a_kernel,
            lora_b_kernel,
        })
    }

    pub fn features(&self) -> &[usize] {
        &self.config.features
    }

    fn out_numel(&self) -> usize {
        self.config.features.iter().product()
    }

    pub fn forward(&self, x: &Array) -> LayerResult<Array> {
        trace!("DenseGeneral forward {}", x.shape());
        let axes = normalize_axes(&self.config.axis, x.shape())?;
        let kernel_dims = self.kernel.value.shape().dims();
        let dims = x.shape().dims();
        for (i, &a) in axes.iter().enumerate() {
            if dims[a] != kernel_dims[i] {
                return Err(LayerError::InvalidConfig(format!(
                    "input dim {} has size {}, kernel expects {}",
                    a, dims[a], kernel_dims[i]
                )));
            }
        }

        let batch_axes: Vec<usize> = (0..x.ndim()).filter(|a| !axes.contains(a)).collect();
        let mut out_shape: Vec<usize> = batch_axes.iter().map(|&a| dims[a]).collect();
        let m: usize = out_shape.iter().product();
        let k: usize = axes.iter().map(|&a| dims[a]).product();
        let n = self.out_numel();

        let perm: Vec<usize> = batch_axes.iter().chain(&axes).copied().collect();
        let x2 = x.permute(&perm)?.reshape(vec![m, k])?;
        let w = self.kernel.value.reshape(vec![k, n])?;
        let mut y = x2.matmul(&w)?;

        if let (Some(a), Some(b)) = (&self.lora_a_kernel, &self.lora_b_kernel) {
            y = y.add(&self.lora_delta(&x2, a, b)?)?;
        }

        out_shape.extend_from_slice(&self.config.features);
        let mut y = y.reshape(out_shape)?;
        if let Some(bias) = &self.bias {
            y = y.add(&bias.value)?;
        }
        Ok(y)
    }

    /// `scaling * x·A·B` for a flattened `[m, k]` input, returned as `[m, n]`.
    fn lora_delta(&self, x2: &Array, a: &Param, b: &Param) -> LayerResult<Array> {
        let m = x2.shape().dims()[0];
        let k = x2.shape().dims()[1];
        let rank = self.config.lora.low_rank_adaptation_dim;
        let features = &self.config.features;
        let head: usize = features[..features.len() - 1].iter().product();
        let last = features[features.len() - 1];

        let xa = x2.matmul(&a.value.reshape(vec![k, head * rank])?)?;
        let xa = xa.reshape(vec![m, head, rank])?.permute(&[1, 0, 2])?;
        let xab = xa.matmul(&b.value.reshape(vec![head, rank, last])?)?;
        let delta = xab.permute(&[1, 0, 2])?.reshape(vec![m, head * last])?;
        Ok(delta.mul_scalar(self.config.lora.scaling()))
    }
}

impl Module for DenseGeneral {
    fn named_params(&self) -> Vec<(String, &Param)> {
        let mut params = vec![("kernel".to_string(), &self.kernel)];
        if let Some(bias) = &self.bias {
            params.push(("bias".to_string(), bias));
        }
        if let Some(a) = &self.lora_a_kernel {
            params.push(("lora_a_kernel".to_string(), a));
        }
        if let Some(b) = &self.lora_b_kernel {
            params.push(("lora_b_kernel".to_string(), b));
        }
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut params = vec![("kernel".to_string(), &mut self.kernel)];
        if let Some(bias) = &mut self.bias {
            params.push(("bias".to_string(), bias));
        }
        if let Some(a) = &mut self.lora_a_kernel {
            params.push(("lora_a_kernel".to_string(), a));
        }
        if let Some(b) = &mut self.lora_b_kernel {
            params.push(("lora_b_kernel".to_string(), b));
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
        StdRng::seed_from_u64(11)
    }

    #[test]
    fn test_single_axis_matches_matmul() {
        let mut dense = DenseGeneral::new(DenseGeneralConfig::new(&[2]), &[3], &mut rng()).unwrap();
        dense.kernel.value = Array::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]).unwrap();
        dense.bias.as_mut().unwrap().value = Array::from_slice(&[0.5, -0.5]);

        let x = Array::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![1, 2, 3]).unwrap();
        let y = dense.forward(&x).unwrap();
        assert_eq!(y.shape_vec(), vec![1, 2, 2]);
        assert_eq!(y.data(), &[4.5, 4.5, 10.5, 10.5]);
    }

    #[test]
    fn test_multi_axis_and_multi_feature_shapes() {
        let config = DenseGeneralConfig {
            axis: vec![-2, -1],
            ..DenseGeneralConfig::new(&[3, 5])
        };
        let dense = DenseGeneral::new(config, &[2, 4, 6], &mut rng()).unwrap();
        assert_eq!(dense.kernel.shape_vec(), vec![4, 6, 3, 5]);
        assert_eq!(dense.bias.as_ref().unwrap().shape_vec(), vec![3, 5]);

        let y = dense.forward(&Array::ones(vec![7, 4, 6])).unwrap();
        assert_eq!(y.shape_vec(), vec![7, 3, 5]);
        assert!(dense.forward(&Array::ones(vec![7, 4, 5])).is_err());
    }

    #[test]
    fn test_contracting_a_leading_axis() {
        let config = DenseGeneralConfig {
            axis: vec![0],
            use_bias: false,
            ..DenseGeneralConfig::new(&[1])
        };
        let mut dense = DenseGeneral::new(config, &[3, 2], &mut rng()).unwrap();
        dense.kernel.value = Array::ones(vec![3, 1]);
        let x = Array::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![3, 2]).unwrap();
        let y = dense.forward(&x).unwrap();
        assert_eq!(y.shape_vec(), vec![2, 1]);
        assert_eq!(y.data(), &[9.0, 12.0]);
    }

    #[test]
    fn test_invalid_axes() {
        let dup = DenseGeneralConfig {
            axis: vec![-1, 1],
            ..DenseGeneralConfig::new(&[4])
        };
        assert!(matches!(
            DenseGeneral::new(dup, &[2, 3], &mut rng()),
            Err(LayerError::InvalidConfig(_))
        ));
        let out_of_range = DenseGeneralConfig {
            axis: vec![2],
            ..DenseGeneralConfig::new(&[4])
        };
        assert!(DenseGeneral::new(out_of_range, &[2, 3], &mut rng()).is_err());
        assert!(DenseGeneral::new(DenseGeneralConfig::new(&[]), &[3], &mut rng()).is_err());
    }

    #[test]
    fn test_lora_shapes_and_delta() {
        let config = DenseGeneralConfig {
            use_bias: false,
            lora: LoraConfig {
                enable_low_rank_adaptation: true,
                low_rank_adaptation_dim: 2,
                low_rank_adaptation_alpha: Some(4.0),
            },
            ..DenseGeneralConfig::new(&[3, 4])
        };
        let mut dense = DenseGeneral::new(config, &[5], &mut rng()).unwrap();
        assert_eq!(dense.lora_a_kernel.as_ref().unwrap().shape_vec(), vec![5, 3, 2]);
        assert_eq!(dense.lora_b_kernel.as_ref().unwrap().shape_vec(), vec![3, 2, 4]);

        let x = Array::randn(vec![2, 5], Some(1));
        // B starts at zero, so LoRA is a no-op at init
        let base = x.reshape(vec![2, 5]).unwrap().matmul(&dense.kernel.value.reshape(vec![5, 12]).unwrap()).unwrap();
        let y = dense.forward(&x).unwrap();
        assert_eq!(y.reshape(vec![2, 12]).unwrap(), base);

        dense.lora_a_kernel.as_mut().unwrap().value = Array::ones(vec![5, 3, 2]);
        dense.lora_b_kernel.as_mut().unwrap().value = Array::ones(vec![3, 2, 4]);
        dense.kernel.value = Array::zeros(vec![5, 3, 4]);
        let ones = Array::ones(vec![1, 5]);
        let y = dense.forward(&ones).unwrap();
        // x·A = 5 per rank entry, ·B sums 2 ranks = 10, scaled by 4/2
        assert!(y.data().iter().all(|&v| (v - 20.0).abs() < 1e-5));
        assert_abs_diff_eq!(dense.config.lora.scaling(), 2.0);
        assert_eq!(dense.named_params().len(), 3);
    }

    #[test]
    fn test_kernel_axes_rank_checked() {
        let config = DenseGeneralConfig {
            kernel_axes: vec!["embed".to_string()],
            ..DenseGeneralConfig::new(&[4])
        };
        assert!(DenseGeneral::new(config, &[3], &mut rng()).is_err());
    }
}
