use log::{debug, trace};
use serde::{Deserialize, Serialize};

use oxiformer_module::dropout::{ApplyMode, Dropout};
use oxiformer_module::{Array, LayerError, LayerResult};

use crate::types::{AttnBiasType, AttnMaskType, QkvLayout};

/// Logit written over masked positions before the softmax.
pub const MASK_FILL: f32 = -1e10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DotProductAttentionConfig {
    pub head_dim: usize,
    pub num_attention_heads: usize,
    /// Key/value heads. Defaults to `num_attention_heads`.
    pub num_gqa_groups: Option<usize>,
    pub attention_dropout: f32,
    pub attn_mask_type: AttnMaskType,
    pub attn_bias_type: Option<AttnBiasType>,
    pub qkv_layout: QkvLayout,
    /// Defaults to `1 / sqrt(head_dim)`.
    pub scale_factor: Option<f32>,
    /// Inputs are `[s, b, ...]` instead of `[b, s, ...]`.
    pub transpose_batch_sequence: bool,
    /// `(left, right)` keys visible around the diagonal; negative is unbounded.
    pub window_size: Option<(i64, i64)>,
}

impl Default for DotProductAttentionConfig {
    fn default() -> Self {
        DotProductAttentionConfig {
            head_dim: 64,
            num_attention_heads: 8,
            num_gqa_groups: None,
            attention_dropout: 0.0,
            attn_mask_type: AttnMaskType::Causal,
            attn_bias_type: None,
            qkv_layout: QkvLayout::BshdBshdBshd,
            scale_factor: None,
            transpose_batch_sequence: false,
            window_size: None,
        }
    }
}

impl DotProductAttentionConfig {
    pub fn new(head_dim: usize, num_attention_heads: usize) -> Self {
        DotProductAttentionConfig {
            head_dim,
            num_attention_heads,
            ..Self::default()
        }
    }

    pub fn num_groups(&self) -> usize {
        self.num_gqa_groups.unwrap_or(self.num_attention_heads)
    }

    pub fn validate(&self) -> LayerResult<()> {
        if self.head_dim == 0 || self.num_attention_heads == 0 {
            return Err(LayerError::InvalidConfig(
                "head_dim and num_attention_heads must be positive".to_string(),
            ));
        }
        let groups = self.num_groups();
        if groups == 0 || self.num_attention_heads % groups != 0 {
            return Err(LayerError::InvalidConfig(format!(
                "num_attention_heads ({}) must be a multiple of num_gqa_groups ({})",
                self.num_attention_heads, groups
            )));
        }
        if !(0.0..=1.0).contains(&self.attention_dropout) {
            return Err(LayerError::InvalidConfig(format!(
                "attention_dropout must be in [0, 1], got {}",
                self.attention_dropout
            )));
        }
        Ok(())
    }
}

/// Scaled dot-product attention over already projected heads. Has no parameters.
#[derive(Debug, Clone)]
pub struct DotProductAttention {
    pub config: DotProductAttentionConfig,
}

/// Exchange the two leading axes, `[s, b, ..]` <-> `[b, s, ..]`.
pub(crate) fn swap_batch_sequence(x: &Array) -> LayerResult<Array> {
    if x.ndim() < 2 {
        return Err(LayerError::InvalidConfig(format!(
            "expected batch and sequence axes, got shape {}",
            x.shape()
        )));
    }
    let mut perm: Vec<usize> = (0..x.ndim()).collect();
    perm.swap(0, 1);
    Ok(x.permute(&perm)?)
}

/// Take entry `index` of the packed axis 2 of `[b, s, n, heads, d]`.
fn unpack(packed: &Array, index: usize, parts: usize) -> LayerResult<Array> {
    let dims = packed.shape().dims();
    if dims.len() != 5 || dims[2] != parts {
        return Err(LayerError::InvalidConfig(format!(
            "expected a packed [b, s, {}, heads, d] input, got {}",
            parts,
            packed.shape()
        )));
    }
    Ok(packed.narrow(2, index, 1)?.squeeze_axis(2)?)
}

/// Repeat each head of `[b, g, s, d]` `rep` times: `[b, g * rep, s, d]`.
fn repeat_heads(x: &Array, rep: usize) -> LayerResult<Array> {
    if rep == 1 {
        return Ok(x.clone());
    }
    let groups = x.shape().dims()[1];
    let mut parts = Vec::with_capacity(groups * rep);
    for g in 0..groups {
        let head = x.narrow(1, g, 1)?;
        parts.extend(std::iter::repeat(head).take(rep));
    }
    let refs: Vec<&Array> = parts.iter().collect();
    Ok(Array::concatenate(&refs, 1)?)
}

impl DotProductAttention {
    pub fn new(config: DotProductAttentionConfig) -> LayerResult<Self> {
        config.validate()?;
        debug!(
            "DotProductAttention(heads={}, groups={}, head_dim={}, mask={}, layout={})",
            config.num_attention_heads,
            config.num_groups(),
            config.head_dim,
            config.attn_mask_type,
            config.qkv_layout
        );
        Ok(DotProductAttention { config })
    }

    pub fn scale(&self) -> f32 {
        self.config
            .scale_factor
            .unwrap_or(1.0 / (self.config.head_dim as f32).sqrt())
    }

    /// Attend `query` to `key`/`value` as packed by `qkv_layout`.
    ///
    /// `bs3hd` reads everything from `query`, `bshd_bs2hd` reads key and value
    /// from `key`. `mask` is `[b|1, h|1, sq, sk]` with non-zero entries masked
    /// out; `bias` broadcasts to `[b, h, sq, sk]`. Returns `[b, sq, h, d]`.
    pub fn forward(
        &self,
        query: &Array,
        key: Option<&Array>,
        value: Option<&Array>,
        mask: Option<&Array>,
        bias: Option<&Array>,
        mode: &mut ApplyMode,
    ) -> LayerResult<Array> {
        let to_batch_first = |x: &Array| -> LayerResult<Array> {
            if self.config.transpose_batch_sequence {
                swap_batch_sequence(x)
            } else {
                Ok(x.clone())
            }
        };
        let missing = |what: &str| {
            LayerError::InvalidConfig(format!(
                "{} is required for the {} layout",
                what, self.config.qkv_layout
            ))
        };

        let (q, k, v) = match self.config.qkv_layout {
            QkvLayout::Bs3hd => {
                let packed = to_batch_first(query)?;
                (unpack(&packed, 0, 3)?, unpack(&packed, 1, 3)?, unpack(&packed, 2, 3)?)
            }
            QkvLayout::BshdBs2hd => {
                let packed = to_batch_first(key.ok_or_else(|| missing("key"))?)?;
                (to_batch_first(query)?, unpack(&packed, 0, 2)?, unpack(&packed, 1, 2)?)
            }
            QkvLayout::BshdBshdBshd => (
                to_batch_first(query)?,
                to_batch_first(key.ok_or_else(|| missing("key"))?)?,
                to_batch_first(value.ok_or_else(|| missing("value"))?)?,
            ),
        };

        let out = self.attend(&q, &k, &v, mask, bias, self.config.attn_mask_type, mode)?;
        if self.config.transpose_batch_sequence {
            swap_batch_sequence(&out)
        } else {
            Ok(out)
        }
    }

    /// Core attention on batch-first `q: [b, sq, h, d]`, `k, v: [b, sk, g, d]`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn attend(
        &self,
        q: &Array,
        k: &Array,
        v: &Array,
        mask: Option<&Array>,
        bias: Option<&Array>,
        mask_type: AttnMaskType,
        mode: &mut ApplyMode,
    ) -> LayerResult<Array> {
        let heads = self.config.num_attention_heads;
        let groups = self.config.num_groups();
        let d = self.config.head_dim;
        let (qd, kd) = (q.shape().dims(), k.shape().dims());
        if qd.len() != 4 || qd[2] != heads || qd[3] != d {
            return Err(LayerError::InvalidConfig(format!(
                "query must be [b, s, {}, {}], got {}",
                heads,
                d,
                q.shape()
            )));
        }
        if kd.len() != 4 || kd[0] != qd[0] || kd[2] != groups || kd[3] != d {
            return Err(LayerError::InvalidConfig(format!(
                "key must be [{}, s, {}, {}], got {}",
                qd[0],
                groups,
                d,
                k.shape()
            )));
        }
        if v.shape() != k.shape() {
            return Err(LayerError::InvalidConfig(format!(
                "value shape {} differs from key shape {}",
                v.shape(),
                k.shape()
            )));
        }
        let (sq, sk) = (qd[1], kd[1]);
        trace!("attention b={} sq={} sk={} h={} g={}", qd[0], sq, sk, heads, groups);

        let qh = q.permute(&[0, 2, 1, 3])?;
        let kh = repeat_heads(&k.permute(&[0, 2, 1, 3])?, heads / groups)?;
        let vh = repeat_heads(&v.permute(&[0, 2, 1, 3])?, heads / groups)?;

        // [b, h, sq, sk]
        let logits = qh.matmul(&kh.t()?)?;
        let scale = self.scale();
        let mut logits = match AttnBiasType::resolve(self.config.attn_bias_type, bias.is_some()) {
            AttnBiasType::NoBias => {
                if bias.is_some() {
                    return Err(LayerError::InvalidConfig(
                        "attention bias given with attn_bias_type no_bias".to_string(),
                    ));
                }
                logits.mul_scalar(scale)
            }
            AttnBiasType::PreScaleBias => {
                let bias = bias.ok_or_else(|| {
                    LayerError::InvalidConfig("pre_scale_bias needs a bias".to_string())
                })?;
                logits.add(bias)?.mul_scalar(scale)
            }
            AttnBiasType::PostScaleBias => {
                let bias = bias.ok_or_else(|| {
                    LayerError::InvalidConfig("post_scale_bias needs a bias".to_string())
                })?;
                logits.mul_scalar(scale).add(bias)?
            }
        };

        if mask_type != AttnMaskType::NoMask {
            if let Some(mask) = mask {
                logits = logits.where_mask(mask, MASK_FILL)?;
            }
        }
        if let Some(structural) = self.structural_mask(mask_type, sq, sk) {
            logits = logits.where_mask(&structural, MASK_FILL)?;
        }

        let probs = logits.softmax()?;
        let probs = Dropout::new(self.config.attention_dropout).apply(&probs, mode)?;
        let out = probs.matmul(&vh)?;
        Ok(out.permute(&[0, 2, 1, 3])?)
    }

    /// Causal and sliding-window mask as `[1, 1, sq, sk]`, non-zero = masked.
    fn structural_mask(&self, mask_type: AttnMaskType, sq: usize, sk: usize) -> Option<Array> {
        let causal = mask_type.is_causal();
        let window = self.config.window_size;
        if !causal && window.is_none() {
            return None;
        }
        let offset = if mask_type.is_bottom_right() {
            sk as i64 - sq as i64
        } else {
            0
        };
        let mut mask = Array::zeros(vec![1, 1, sq, sk]);
        for (i, row) in mask.lanes_mut().enumerate() {
            let diag = i as i64 + offset;
            for (j, m) in row.iter_mut().enumerate() {
                let j = j as i64;
                let mut masked = causal && j > diag;
                if let Some((left, right)) = window {
                    masked |= left >= 0 && j < diag - left;
                    masked |= right >= 0 && j > diag + right;
                }
                if masked {
                    *m = 1.0;
                }
            }
        }
        Some(mask)
    }
}
