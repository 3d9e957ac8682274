use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};
use crate::Array;

/// Whether a forward pass is deterministic, and the RNG used when it is not.
#[derive(Debug, Clone)]
pub struct ApplyMode {
    deterministic: bool,
    rng: Option<StdRng>,
}

impl ApplyMode {
    /// Inference: dropout and drop-path are identities.
    pub fn eval() -> Self {
        ApplyMode {
            deterministic: true,
            rng: None,
        }
    }

    pub fn train(seed: u64) -> Self {
        Self::train_with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn train_with_rng(rng: StdRng) -> Self {
        ApplyMode {
            deterministic: false,
            rng: Some(rng),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    pub fn rng(&mut self) -> LayerResult<&mut StdRng> {
        self.rng.as_mut().ok_or(LayerError::MissingRng)
    }
}

impl Default for ApplyMode {
    fn default() -> Self {
        Self::eval()
    }
}

/// Inverted dropout. Dimensions listed in `broadcast_dims` share one mask entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dropout {
    pub rate: f32,
    pub broadcast_dims: Vec<isize>,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Dropout {
            rate,
            broadcast_dims: Vec::new(),
        }
    }

    pub fn with_broadcast_dims(rate: f32, broadcast_dims: &[isize]) -> Self {
        Dropout {
            rate,
            broadcast_dims: broadcast_dims.to_vec(),
        }
    }

    pub fn apply(&self, x: &Array, mode: &mut ApplyMode) -> LayerResult<Array> {
        if mode.is_deterministic() || self.rate <= 0.0 {
            return Ok(x.clone());
        }
        if self.rate >= 1.0 {
            return Ok(Array::zeros(x.shape_vec()));
        }

        let mut mask_shape = x.shape_vec();
        for &d in &self.broadcast_dims {
            let axis = x.shape().normalize_axis(d)?;
            mask_shape[axis] = 1;
        }

        let keep = 1.0 - self.rate;
        let scale = 1.0 / keep;
        let rng = mode.rng()?;
        let mut mask = Array::zeros(mask_shape);
        for m in mask.data_mut() {
            if rng.gen::<f32>() < keep {
                *m = scale;
            }
        }
        Ok(x.mul(&mask)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_is_identity() {
        let x = Array::ones(vec![4, 8]);
        let out = Dropout::new(0.5).apply(&x, &mut ApplyMode::eval()).unwrap();
        assert_eq!(out, x);
    }

    #[test]
    fn test_train_scales_kept_values() {
        let x = Array::ones(vec![64, 64]);
        let out = Dropout::new(0.25).apply(&x, &mut ApplyMode::train(0)).unwrap();
        assert!(out.data().iter().all(|&v| v == 0.0 || (v - 4.0 / 3.0).abs() < 1e-6));
        let kept = out.data().iter().filter(|&&v| v != 0.0).count() as f32 / 4096.0;
        assert!((kept - 0.75).abs() < 0.05);
    }

    #[test]
    fn test_rate_one_zeros_input() {
        let x = Array::ones(vec![3]);
        let out = Dropout::new(1.0).apply(&x, &mut ApplyMode::train(1)).unwrap();
        assert_eq!(out.sum_all(), 0.0);
    }

    #[test]
    fn test_broadcast_dims_share_mask() {
        let x = Array::ones(vec![2, 16, 8]);
        let out = Dropout::with_broadcast_dims(0.5, &[-2])
            .apply(&x, &mut ApplyMode::train(9))
            .unwrap();
        for b in 0..2 {
            for f in 0..8 {
                let first = out.get(&[b, 0, f]).unwrap();
                for s in 1..16 {
                    assert_eq!(out.get(&[b, s, f]).unwrap(), first);
                }
            }
        }
    }

    #[test]
    fn test_missing_rng() {
        let mut mode = ApplyMode {
            deterministic: false,
            rng: None,
        };
        let err = Dropout::new(0.1).apply(&Array::ones(vec![2]), &mut mode);
        assert!(matches!(err, Err(LayerError::MissingRng)));
    }
}
