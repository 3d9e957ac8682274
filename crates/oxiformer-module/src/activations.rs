use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LayerError;
use crate::Array;

/// Element-wise activation selectable by name in layer configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Identity.
    Linear,
    Relu,
    /// Tanh approximation.
    Gelu,
    #[serde(alias = "swish")]
    Silu,
    /// x * sigmoid(1.702 x)
    QuickGelu,
    SquaredRelu,
    Sigmoid,
    Tanh,
}

impl Activation {
    pub fn apply(&self, x: &Array) -> Array {
        match self {
            Activation::Linear => x.clone(),
            Activation::Relu => x.relu(),
            Activation::Gelu => x.apply(|v| {
                let inner = (2.0f32 / std::f32::consts::PI).sqrt() * (v + 0.044_715 * v * v * v);
                0.5 * v * (1.0 + inner.tanh())
            }),
            Activation::Silu => x.apply(|v| v / (1.0 + (-v).exp())),
            Activation::QuickGelu => x.apply(|v| v / (1.0 + (-1.702 * v).exp())),
            Activation::SquaredRelu => x.apply(|v| {
                let r = v.max(0.0);
                r * r
            }),
            Activation::Sigmoid => x.sigmoid(),
            Activation::Tanh => x.tanh_elem(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Gelu => "gelu",
            Activation::Silu => "silu",
            Activation::QuickGelu => "quick_gelu",
            Activation::SquaredRelu => "squared_relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
        }
    }
}

impl FromStr for Activation {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "gelu" => Ok(Activation::Gelu),
            "silu" | "swish" => Ok(Activation::Silu),
            "quick_gelu" => Ok(Activation::QuickGelu),
            "squared_relu" => Ok(Activation::SquaredRelu),
            "sigmoid" => Ok(Activation::Sigmoid),
            "tanh" => Ok(Activation::Tanh),
            other => Err(LayerError::InvalidConfig(format!(
                "unknown activation '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
