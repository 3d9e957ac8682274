use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::Array;

/// Stddev of a unit normal truncated to [-2, 2].
const TRUNCATED_NORMAL_STDDEV: f64 = 0.879_625_661_034_239;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    FanIn,
    FanOut,
    FanAvg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    TruncatedNormal,
    Normal,
    Uniform,
}

/// Input and output sizes of a weight, used by variance scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fans {
    pub fan_in: usize,
    pub fan_out: usize,
}

impl Fans {
    /// The first `contracted` dims of `shape` are inputs, the rest outputs.
    pub fn split_at(shape: &[usize], contracted: usize) -> Self {
        let contracted = contracted.min(shape.len());
        Fans {
            fan_in: shape[..contracted].iter().product(),
            fan_out: shape[contracted..].iter().product(),
        }
    }
}

/// How a parameter is filled at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    Zeros,
    Ones,
    Constant { value: f32 },
    Normal { stddev: f32 },
    /// U[-scale, scale].
    Uniform { scale: f32 },
    VarianceScaling {
        scale: f32,
        mode: FanMode,
        distribution: Distribution,
    },
}

impl Initializer {
    /// `VarianceScaling(1, fan_in, truncated_normal)`, used for kernels.
    pub fn kernel_default() -> Self {
        Initializer::VarianceScaling {
            scale: 1.0,
            mode: FanMode::FanIn,
            distribution: Distribution::TruncatedNormal,
        }
    }

    pub fn init<R: Rng>(&self, shape: &[usize], fans: Fans, rng: &mut R) -> Array {
        let shape = shape.to_vec();
        match *self {
            Initializer::Zeros => Array::zeros(shape),
            Initializer::Ones => Array::ones(shape),
            Initializer::Constant { value } => Array::full(shape, value),
            Initializer::Normal { stddev } => Array::randn_with(shape, rng).mul_scalar(stddev),
            Initializer::Uniform { scale } => uniform(shape, scale as f64, rng),
            Initializer::VarianceScaling {
                scale,
                mode,
                distribution,
            } => {
                let denom = match mode {
                    FanMode::FanIn => fans.fan_in as f64,
                    FanMode::FanOut => fans.fan_out as f64,
                    FanMode::FanAvg => (fans.fan_in + fans.fan_out) as f64 / 2.0,
                };
                let variance = scale as f64 / denom.max(1.0);
                match distribution {
                    Distribution::TruncatedNormal => {
                        truncated_normal(shape, variance.sqrt() / TRUNCATED_NORMAL_STDDEV, rng)
                    }
                    Distribution::Normal => {
                        Array::randn_with(shape, rng).mul_scalar(variance.sqrt() as f32)
                    }
                    Distribution::Uniform => uniform(shape, (3.0 * variance).sqrt(), rng),
                }
            }
        }
    }
}

fn uniform<R: Rng>(shape: Vec<usize>, limit: f64, rng: &mut R) -> Array {
    let mut out = Array::zeros(shape);
    for v in out.data_mut() {
        *v = ((rng.gen::<f64>() * 2.0 - 1.0) * limit) as f32;
    }
    out
}

/// Normal samples with `stddev`, redrawn until they fall within two stddevs.
fn truncated_normal<R: Rng>(shape: Vec<usize>, stddev: f64, rng: &mut R) -> Array {
    let mut out = Array::zeros(shape);
    for v in out.data_mut() {
        let z = loop {
            let u1: f64 = rng.gen::<f64>().max(1e-10);
            let u2: f64 = rng.gen::<f64>();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            if z.abs() <= 2.0 {
                break z;
            }
        };
        *v = (z * stddev) as f32;
    }
    out
}
