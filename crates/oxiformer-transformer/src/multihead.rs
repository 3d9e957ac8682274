use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use oxiformer_module::dropout::ApplyMode;
use oxiformer_module::initializers::Initializer;
use oxiformer_module::params::scoped;
use oxiformer_module::params::scoped_mut;
use oxiformer_module::sharding::{W_FSDP_AXES, W_JOINED_AXES, W_NO_SHARD_AXES, W_TP_AXES};
use oxiformer_module::{
    Array, DenseGeneral, DenseGeneralConfig, LayerError, LayerNormConfig, LayerNormDenseGeneral,
    LayerNormDenseGeneralConfig, LayerNormType, LayerResult, LoraConfig, Module, Param,
};

use crate::attention::{swap_batch_sequence, DotProductAttention, DotProductAttentionConfig};
use crate::rotary::apply_rotary_pos_emb;
use crate::types::{AttnBiasType, AttnMaskType, QkvLayout, RotaryGroupMethod};

pub(crate) fn axes(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiHeadAttentionConfig {
    pub head_dim: usize,
    pub num_attention_heads: usize,
    pub num_gqa_groups: Option<usize>,
    pub attention_dropout: f32,
    pub input_layernorm: bool,
    pub layernorm_type: LayerNormType,
    pub layernorm_epsilon: f32,
    pub zero_centered_gamma: bool,
    pub return_layernorm_output: bool,
    pub use_bias: bool,
    pub kernel_init: Initializer,
    pub bias_init: Initializer,
    pub attn_mask_type: AttnMaskType,
    pub attn_bias_type: Option<AttnBiasType>,
    pub enable_rotary_pos_emb: bool,
    pub rotary_pos_emb_windows: (f32, f32),
    pub rotary_pos_emb_group_method: RotaryGroupMethod,
    /// Use one `qkv` (or `kv`) kernel instead of separate ones.
    pub fuse_qkv_params: bool,
    pub transpose_batch_sequence: bool,
    /// Scale logits by `1 / sqrt(head_dim)`.
    pub scale_attn_logits: bool,
    /// Divide the query kernel by `sqrt(head_dim)` at init.
    pub scaled_query_init: bool,
    pub window_size: Option<(i64, i64)>,
    #[serde(flatten)]
    pub lora: LoraConfig,
}

impl Default for MultiHeadAttentionConfig {
    fn default() -> Self {
        MultiHeadAttentionConfig {
            head_dim: 64,
            num_attention_heads: 8,
            num_gqa_groups: None,
            attention_dropout: 0.0,
            input_layernorm: true,
            layernorm_type: LayerNormType::LayerNorm,
            layernorm_epsilon: 1e-6,
            zero_centered_gamma: false,
            return_layernorm_output: false,
            use_bias: false,
            kernel_init: Initializer::kernel_default(),
            bias_init: Initializer::Zeros,
            attn_mask_type: AttnMaskType::Causal,
            attn_bias_type: None,
            enable_rotary_pos_emb: false,
            rotary_pos_emb_windows: (1.0, 10000.0),
            rotary_pos_emb_group_method: RotaryGroupMethod::Consecutive,
            fuse_qkv_params: true,
            transpose_batch_sequence: false,
            scale_attn_logits: false,
            scaled_query_init: true,
            window_size: None,
            lora: LoraConfig::default(),
        }
    }
}

impl MultiHeadAttentionConfig {
    pub fn new(head_dim: usize, num_attention_heads: usize) -> Self {
        MultiHeadAttentionConfig {
            head_dim,
            num_attention_heads,
            ..Self::default()
        }
    }

    pub fn num_groups(&self) -> usize {
        self.num_gqa_groups.unwrap_or(self.num_attention_heads)
    }

    fn layernorm_config(&self) -> LayerNormConfig {
        LayerNormConfig {
            layernorm_type: self.layernorm_type,
            epsilon: self.layernorm_epsilon,
            zero_centered_gamma: self.zero_centered_gamma,
            scale_axes: axes(&[W_NO_SHARD_AXES]),
            bias_axes: axes(&[W_NO_SHARD_AXES]),
            ..LayerNormConfig::default()
        }
    }

    fn dense_config(&self, features: &[usize], kernel_axes: &[&str], bias_axes: &[&str]) -> DenseGeneralConfig {
        DenseGeneralConfig {
            features: features.to_vec(),
            axis: vec![-1],
            use_bias: self.use_bias,
            kernel_init: self.kernel_init.clone(),
            kernel_axes: axes(kernel_axes),
            bias_init: self.bias_init.clone(),
            bias_axes: axes(bias_axes),
            lora: self.lora.clone(),
        }
    }

    fn query_config(&self, features: &[usize], kernel_axes: &[&str], bias_axes: &[&str]) -> LayerNormDenseGeneralConfig {
        LayerNormDenseGeneralConfig {
            features: features.to_vec(),
            enable_layernorm: self.input_layernorm,
            layernorm: self.layernorm_config(),
            use_bias: self.use_bias,
            kernel_init: self.kernel_init.clone(),
            kernel_axes: axes(kernel_axes),
            bias_init: self.bias_init.clone(),
            bias_axes: axes(bias_axes),
            // key/value of self attention read the normalized input
            return_layernorm_output: true,
            depth_scaling: None,
            lora: self.lora.clone(),
        }
    }
}

/// Keys and values cached across decode steps.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeCache {
    /// `[b, max_length, groups, head_dim]`
    pub cached_key: Array,
    pub cached_value: Array,
    /// Number of positions already written.
    pub cache_index: usize,
}

impl DecodeCache {
    pub fn max_length(&self) -> usize {
        self.cached_key.shape().dims().get(1).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
enum KvProjection {
    Fused(DenseGeneral),
    Split { key: DenseGeneral, value: DenseGeneral },
}

#[derive(Debug, Clone)]
enum QkvProjection {
    Fused(LayerNormDenseGeneral),
    Separate {
        query: LayerNormDenseGeneral,
        kv: KvProjection,
    },
}

/// Multi-head (and grouped-query) attention with input projections,
/// optional rotary embeddings and a decode cache.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    pub config: MultiHeadAttentionConfig,
    projection: QkvProjection,
    pub out: DenseGeneral,
    attention: DotProductAttention,
    hidden: usize,
    self_attention: bool,
}

/// Narrow a `[.., .., max_length, max_length]` mask or bias to the rows being
/// decoded and the keys written so far.
fn slice_for_decode(x: &Array, max_length: usize, start: usize, len: usize) -> LayerResult<Array> {
    let dims = x.shape().dims();
    if dims.len() != 4 {
        return Err(LayerError::InvalidConfig(format!(
            "attention mask and bias must be 4-D, got {}",
            x.shape()
        )));
    }
    let mut out = x.clone();
    if dims[2] == max_length && len != max_length {
        out = out.narrow(2, start, len)?;
    }
    if dims[3] == max_length {
        out = out.narrow(3, 0, start + len)?;
    }
    Ok(out)
}

impl MultiHeadAttention {
    /// Self attention when `kv_hidden` is `None`, cross attention otherwise.
    pub fn new<R: Rng>(
        config: MultiHeadAttentionConfig,
        hidden: usize,
        kv_hidden: Option<usize>,
        rng: &mut R,
    ) -> LayerResult<Self> {
        let heads = config.num_attention_heads;
        let groups = config.num_groups();
        let d = config.head_dim;
        if config.enable_rotary_pos_emb && d % 2 != 0 {
            return Err(LayerError::InvalidConfig(format!(
                "rotary embedding needs an even head_dim, got {}",
                d
            )));
        }

        let scale_factor = if config.scale_attn_logits {
            1.0 / (d as f32).sqrt()
        } else {
            1.0
        };
        let attention = DotProductAttention::new(DotProductAttentionConfig {
            head_dim: d,
            num_attention_heads: heads,
            num_gqa_groups: Some(groups),
            attention_dropout: config.attention_dropout,
            attn_mask_type: config.attn_mask_type,
            attn_bias_type: config.attn_bias_type,
            qkv_layout: QkvLayout::BshdBshdBshd,
            scale_factor: Some(scale_factor),
            transpose_batch_sequence: false,
            window_size: config.window_size,
        })?;

        let self_attention = kv_hidden.is_none();
        let query_scale = if config.scaled_query_init {
            (d as f32).sqrt()
        } else {
            1.0
        };

        let projection = if self_attention && config.fuse_qkv_params && groups == heads {
            let qkv_config = config.query_config(
                &[3, heads * d],
                &[W_FSDP_AXES, W_JOINED_AXES, W_TP_AXES],
                &[W_JOINED_AXES, W_TP_AXES],
            );
            let mut qkv = LayerNormDenseGeneral::new(qkv_config, hidden, rng)?;
            if query_scale != 1.0 {
                let kernel = &mut qkv.dense.kernel.value;
                let query = kernel.narrow(1, 0, 1)?.div_scalar(query_scale);
                kernel.narrow_assign(1, 0, &query)?;
            }
            QkvProjection::Fused(qkv)
        } else {
            let query_config = config.query_config(&[heads * d], &[W_FSDP_AXES, W_TP_AXES], &[W_TP_AXES]);
            let mut query = LayerNormDenseGeneral::new(query_config, hidden, rng)?;
            if query_scale != 1.0 {
                let kernel = &mut query.dense.kernel.value;
                *kernel = kernel.div_scalar(query_scale);
            }
            let kv_in = [kv_hidden.unwrap_or(hidden)];
            let kv = if config.fuse_qkv_params {
                KvProjection::Fused(DenseGeneral::new(
                    config.dense_config(
                        &[2, groups * d],
                        &[W_FSDP_AXES, W_JOINED_AXES, W_TP_AXES],
                        &[W_JOINED_AXES, W_TP_AXES],
                    ),
                    &kv_in,
                    rng,
                )?)
            } else {
                let kv_config = config.dense_config(&[groups * d], &[W_FSDP_AXES, W_TP_AXES], &[W_TP_AXES]);
                KvProjection::Split {
                    key: DenseGeneral::new(kv_config.clone(), &kv_in, rng)?,
                    value: DenseGeneral::new(kv_config, &kv_in, rng)?,
                }
            };
            QkvProjection::Separate { query, kv }
        };

        let out = DenseGeneral::new(
            config.dense_config(&[hidden], &[W_TP_AXES, W_FSDP_AXES], &[W_NO_SHARD_AXES]),
            &[heads * d],
            rng,
        )?;

        debug!(
            "MultiHeadAttention(hidden={}, heads={}, groups={}, head_dim={}, self_attention={}, fused={})",
            hidden,
            heads,
            groups,
            d,
            self_attention,
            matches!(projection, QkvProjection::Fused(_))
        );
        Ok(MultiHeadAttention {
            config,
            projection,
            out,
            attention,
            hidden,
            self_attention,
        })
    }

    pub fn is_self_attention(&self) -> bool {
        self.self_attention
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Empty key/value cache for `max_length` decode positions.
    pub fn init_cache(&self, batch: usize, max_length: usize) -> DecodeCache {
        let shape = vec![batch, max_length, self.config.num_groups(), self.config.head_dim];
        DecodeCache {
            cached_key: Array::zeros(shape.clone()),
            cached_value: Array::zeros(shape),
            cache_index: 0,
        }
    }

    /// Project, attend and project back.
    ///
    /// `inputs_kv` must be given exactly when this is a cross attention layer.
    /// With a `cache`, `inputs_q` holds the next positions of the sequence; a
    /// mask or bias sized for the whole cache is sliced to them.
    /// Returns the output and, if `return_layernorm_output`, the normalized
    /// query input.
    pub fn forward(
        &self,
        inputs_q: &Array,
        inputs_kv: Option<&Array>,
        mask: Option<&Array>,
        bias: Option<&Array>,
        cache: Option<&mut DecodeCache>,
        mode: &mut ApplyMode,
    ) -> LayerResult<(Array, Option<Array>)> {
        match (self.self_attention, inputs_kv.is_some()) {
            (true, true) => {
                return Err(LayerError::InvalidConfig(
                    "self attention takes no separate key/value input".to_string(),
                ))
            }
            (false, false) => {
                return Err(LayerError::InvalidConfig(
                    "cross attention needs a key/value input".to_string(),
                ))
            }
            _ => {}
        }
        if cache.is_some() && !self.self_attention {
            return Err(LayerError::InvalidConfig(
                "decode cache is only supported for self attention".to_string(),
            ));
        }

        for x in std::iter::once(inputs_q).chain(inputs_kv) {
            if x.ndim() != 3 {
                return Err(LayerError::InvalidConfig(format!(
                    "attention input must be 3-D, got {}",
                    x.shape()
                )));
            }
        }

        let batch_first = |x: &Array| -> LayerResult<Array> {
            if self.config.transpose_batch_sequence {
                swap_batch_sequence(x)
            } else {
                Ok(x.clone())
            }
        };
        let xq = batch_first(inputs_q)?;
        trace!("MultiHeadAttention forward {}", xq.shape());
        let (b, sq) = (xq.shape().dims()[0], xq.shape().dims()[1]);
        let heads = self.config.num_attention_heads;
        let groups = self.config.num_groups();
        let d = self.config.head_dim;

        let (mut q, mut k, v, ln_out) = match &self.projection {
            QkvProjection::Fused(qkv) => {
                let (packed, ln_out) = qkv.forward(&xq)?;
                let parts = packed.split(2, 3)?;
                let head_view = |x: &Array| x.reshape(vec![b, sq, heads, d]);
                (
                    head_view(&parts[0])?,
                    head_view(&parts[1])?,
                    head_view(&parts[2])?,
                    ln_out,
                )
            }
            QkvProjection::Separate { query, kv } => {
                let (q, ln_out) = query.forward(&xq)?;
                let kv_input = match inputs_kv {
                    Some(x) => batch_first(x)?,
                    None => ln_out.clone().ok_or_else(|| {
                        LayerError::InvalidConfig("query projection returned no input".to_string())
                    })?,
                };
                let sk = kv_input.shape().dims()[1];
                let (k, v) = match kv {
                    KvProjection::Fused(kv) => {
                        let parts = kv.forward(&kv_input)?.split(2, 2)?;
                        (parts[0].clone(), parts[1].clone())
                    }
                    KvProjection::Split { key, value } => {
                        (key.forward(&kv_input)?, value.forward(&kv_input)?)
                    }
                };
                (
                    q.reshape(vec![b, sq, heads, d])?,
                    k.reshape(vec![b, sk, groups, d])?,
                    v.reshape(vec![b, sk, groups, d])?,
                    ln_out,
                )
            }
        };

        if self.config.enable_rotary_pos_emb {
            let offset = cache.as_ref().map(|c| c.cache_index).unwrap_or(0);
            let windows = self.config.rotary_pos_emb_windows;
            let method = self.config.rotary_pos_emb_group_method;
            q = apply_rotary_pos_emb(&q, offset, windows, method)?;
            k = apply_rotary_pos_emb(&k, offset, windows, method)?;
        }

        let attended = match cache {
            Some(cache) => {
                let max_length = cache.max_length();
                let start = cache.cache_index;
                if start + sq > max_length {
                    return Err(LayerError::InvalidConfig(format!(
                        "decode cache overflow: {} + {} positions exceed max length {}",
                        start, sq, max_length
                    )));
                }
                let mask = mask
                    .map(|m| slice_for_decode(m, max_length, start, sq))
                    .transpose()?;
                let bias = bias
                    .map(|x| slice_for_decode(x, max_length, start, sq))
                    .transpose()?;
                // the cache is only updated once the step has succeeded
                let mut cached_key = cache.cached_key.clone();
                let mut cached_value = cache.cached_value.clone();
                cached_key.narrow_assign(1, start, &k)?;
                cached_value.narrow_assign(1, start, &v)?;
                let attended = self.attention.attend(
                    &q,
                    &cached_key.narrow(1, 0, start + sq)?,
                    &cached_value.narrow(1, 0, start + sq)?,
                    mask.as_ref(),
                    bias.as_ref(),
                    self.config.attn_mask_type.to_bottom_right(),
                    mode,
                )?;
                cache.cached_key = cached_key;
                cache.cached_value = cached_value;
                cache.cache_index = start + sq;
                attended
            }
            None => self
                .attention
                .attend(&q, &k, &v, mask, bias, self.config.attn_mask_type, mode)?,
        };

        let merged = attended.reshape(vec![b, sq, heads * d])?;
        let mut out = self.out.forward(&merged)?;
        let mut ln_out = if self.config.return_layernorm_output {
            ln_out
        } else {
            None
        };
        if self.config.transpose_batch_sequence {
            out = swap_batch_sequence(&out)?;
            ln_out = ln_out.map(|x| swap_batch_sequence(&x)).transpose()?;
        }
        Ok((out, ln_out))
    }
}

impl Module for MultiHeadAttention {
    fn named_params(&self) -> Vec<(String, &Param)> {
        let mut params = match &self.projection {
            QkvProjection::Fused(qkv) => scoped("qkv", qkv.named_params()),
            QkvProjection::Separate { query, kv } => {
                let mut params = scoped("query", query.named_params());
                match kv {
                    KvProjection::Fused(kv) => params.extend(scoped("kv", kv.named_params())),
                    KvProjection::Split { key, value } => {
                        params.extend(scoped("key", key.named_params()));
                        params.extend(scoped("value", value.named_params()));
                    }
                }
                params
            }
        };
        params.extend(scoped("out", self.out.named_params()));
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Param)> {
        let mut params = match &mut self.projection {
            QkvProjection::Fused(qkv) => scoped_mut("qkv", qkv.named_params_mut()),
            QkvProjection::Separate { query, kv } => {
                let mut params = scoped_mut("query", query.named_params_mut());
                match kv {
                    KvProjection::Fused(kv) => params.extend(scoped_mut("kv", kv.named_params_mut())),
                    KvProjection::Split { key, value } => {
                        params.extend(scoped_mut("key", key.named_params_mut()));
                        params.extend(scoped_mut("value", value.named_params_mut()));
                    }
                }
                params
            }
        };
        params.extend(scoped_mut("out", self.out.named_params_mut()));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(17)
    }

    fn names(m: &MultiHeadAttention) -> Vec<String> {
        m.named_params().into_iter().map(|(n, _)| n).collect()
    }

    fn assert_close(a: &Array, b: &Array) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.data().iter().zip(b.data()) {
            assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_fused_self_attention_params() {
        let mha = MultiHeadAttention::new(MultiHeadAttentionConfig::new(4, 2), 8, None, &mut rng()).unwrap();
        assert_eq!(names(&mha), vec!["qkv/scale", "qkv/ln_bias", "qkv/kernel", "out/kernel"]);
        let specs = mha.state_dict();
        assert_eq!(specs["qkv/kernel"].shape_vec(), vec![8, 3, 8]);
        assert_eq!(specs["out/kernel"].shape_vec(), vec![8, 8]);

        let x = Array::randn(vec![2, 5, 8], Some(0));
        let (out, ln_out) = mha.forward(&x, None, None, None, None, &mut ApplyMode::eval()).unwrap();
        assert_eq!(out.shape_vec(), vec![2, 5, 8]);
        assert!(ln_out.is_none());
    }

    #[test]
    fn test_gqa_and_unfused_projections() {
        let config = MultiHeadAttentionConfig {
            num_gqa_groups: Some(1),
            use_bias: true,
            ..MultiHeadAttentionConfig::new(4, 2)
        };
        let mha = MultiHeadAttention::new(config, 8, None, &mut rng()).unwrap();
        let n = names(&mha);
        assert!(n.contains(&"query/kernel".to_string()));
        assert!(n.contains(&"kv/kernel".to_string()));
        assert_eq!(mha.state_dict()["kv/kernel"].shape_vec(), vec![8, 2, 4]);

        let config = MultiHeadAttentionConfig {
            fuse_qkv_params: false,
            ..MultiHeadAttentionConfig::new(4, 2)
        };
        let mha = MultiHeadAttention::new(config, 8, None, &mut rng()).unwrap();
        let n = names(&mha);
        assert!(n.contains(&"key/kernel".to_string()));
        assert!(n.contains(&"value/kernel".to_string()));
        let (out, _) = mha
            .forward(&Array::randn(vec![1, 3, 8], Some(1)), None, None, None, None, &mut ApplyMode::eval())
            .unwrap();
        assert_eq!(out.shape_vec(), vec![1, 3, 8]);
    }

    #[test]
    fn test_cross_attention() {
        let config = MultiHeadAttentionConfig {
            attn_mask_type: AttnMaskType::Padding,
            return_layernorm_output: true,
            ..MultiHeadAttentionConfig::new(4, 2)
        };
        let mha = MultiHeadAttention::new(config, 8, Some(6), &mut rng()).unwrap();
        assert!(!mha.is_self_attention());
        let q = Array::randn(vec![2, 3, 8], Some(2));
        let kv = Array::randn(vec![2, 7, 6], Some(3));
        let mut mode = ApplyMode::eval();
        let (out, ln_out) = mha.forward(&q, Some(&kv), None, None, None, &mut mode).unwrap();
        assert_eq!(out.shape_vec(), vec![2, 3, 8]);
        assert_eq!(ln_out.unwrap().shape_vec(), vec![2, 3, 8]);
        assert!(mha.forward(&q, None, None, None, None, &mut mode).is_err());
        let mut cache = mha.init_cache(2, 4);
        assert!(mha.forward(&q, Some(&kv), None, None, Some(&mut cache), &mut mode).is_err());
    }

    #[test]
    fn test_scaled_query_init() {
        let scaled = MultiHeadAttention::new(MultiHeadAttentionConfig::new(4, 2), 8, None, &mut rng()).unwrap();
        let plain = MultiHeadAttention::new(
            MultiHeadAttentionConfig {
                scaled_query_init: false,
                ..MultiHeadAttentionConfig::new(4, 2)
            },
            8,
            None,
            &mut rng(),
        )
        .unwrap();
        let ks = &scaled.state_dict()["qkv/kernel"];
        let kp = &plain.state_dict()["qkv/kernel"];
        let q_ratio = kp.get(&[0, 0, 0]).unwrap() / ks.get(&[0, 0, 0]).unwrap();
        assert!((q_ratio - 2.0).abs() < 1e-5);
        assert_eq!(ks.get(&[3, 1, 5]).unwrap(), kp.get(&[3, 1, 5]).unwrap());
    }

    #[test]
    fn test_decode_matches_full_causal_pass() {
        let config = MultiHeadAttentionConfig {
            enable_rotary_pos_emb: true,
            num_gqa_groups: Some(1),
            ..MultiHeadAttentionConfig::new(4, 2)
        };
        let mha = MultiHeadAttention::new(config, 8, None, &mut rng()).unwrap();
        let x = Array::randn(vec![2, 4, 8], Some(5));
        let mut mode = ApplyMode::eval();
        let (full, _) = mha.forward(&x, None, None, None, None, &mut mode).unwrap();

        let mut cache = mha.init_cache(2, 4);
        for t in 0..4 {
            let step = x.narrow(1, t, 1).unwrap();
            let (out, _) = mha.forward(&step, None, None, None, Some(&mut cache), &mut mode).unwrap();
            assert_close(&out, &full.narrow(1, t, 1).unwrap());
        }
        assert_eq!(cache.cache_index, 4);
        let extra = x.narrow(1, 0, 1).unwrap();
        assert!(mha.forward(&extra, None, None, None, Some(&mut cache), &mut mode).is_err());
    }

    #[test]
    fn test_failed_decode_step_keeps_cache() {
        let mha = MultiHeadAttention::new(MultiHeadAttentionConfig::new(4, 2), 8, None, &mut rng()).unwrap();
        let x = Array::randn(vec![1, 3, 8], Some(11));
        let mut mode = ApplyMode::eval();
        let mut cache = mha.init_cache(1, 3);
        mha.forward(&x.narrow(1, 0, 1).unwrap(), None, None, None, Some(&mut cache), &mut mode)
            .unwrap();
        let before = cache.clone();

        let bad_mask = Array::zeros(vec![1, 1, 2, 5]);
        let step = x.narrow(1, 1, 1).unwrap();
        assert!(mha
            .forward(&step, None, Some(&bad_mask), None, Some(&mut cache), &mut mode)
            .is_err());
        assert_eq!(cache.cache_index, 1);
        assert_eq!(cache.cached_key, before.cached_key);
        assert_eq!(cache.cached_value, before.cached_value);

        // the step can be retried once the mask is fixed
        mha.forward(&step, None, None, None, Some(&mut cache), &mut mode).unwrap();
        assert_eq!(cache.cache_index, 2);
    }

    #[test]
    fn test_low_rank_inputs_are_errors() {
        let mut mode = ApplyMode::eval();
        let seq_first = MultiHeadAttention::new(
            MultiHeadAttentionConfig {
                transpose_batch_sequence: true,
                ..MultiHeadAttentionConfig::new(4, 2)
            },
            8,
            None,
            &mut rng(),
        )
        .unwrap();
        let flat = Array::ones(vec![8]);
        assert!(matches!(
            seq_first.forward(&flat, None, None, None, None, &mut mode),
            Err(LayerError::InvalidConfig(_))
        ));

        let cross = MultiHeadAttention::new(MultiHeadAttentionConfig::new(4, 2), 8, Some(6), &mut rng()).unwrap();
        let q = Array::ones(vec![1, 2, 8]);
        assert!(matches!(
            cross.forward(&q, Some(&Array::ones(vec![6])), None, None, None, &mut mode),
            Err(LayerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_decode_slices_full_length_bias() {
        let mha = MultiHeadAttention::new(MultiHeadAttentionConfig::new(4, 2), 8, None, &mut rng()).unwrap();
        let x = Array::randn(vec![1, 3, 8], Some(6));
        let bias = Array::randn(vec![1, 2, 3, 3], Some(7));
        let mut mode = ApplyMode::eval();
        let (full, _) = mha.forward(&x, None, None, Some(&bias), None, &mut mode).unwrap();

        let mut cache = mha.init_cache(1, 3);
        let (head, _) = mha
            .forward(&x.narrow(1, 0, 2).unwrap(), None, None, Some(&bias), Some(&mut cache), &mut mode)
            .unwrap();
        let (tail, _) = mha
            .forward(&x.narrow(1, 2, 1).unwrap(), None, None, Some(&bias), Some(&mut cache), &mut mode)
            .unwrap();
        assert_close(&head, &full.narrow(1, 0, 2).unwrap());
        assert_close(&tail, &full.narrow(1, 2, 1).unwrap());
    }

    #[test]
    fn test_sequence_first_layout() {
        let base = MultiHeadAttentionConfig {
            return_layernorm_output: true,
            ..MultiHeadAttentionConfig::new(4, 2)
        };
        let batch_first = MultiHeadAttention::new(base.clone(), 8, None, &mut rng()).unwrap();
        let seq_first = MultiHeadAttention::new(
            MultiHeadAttentionConfig {
                transpose_batch_sequence: true,
                ..base
            },
            8,
            None,
            &mut rng(),
        )
        .unwrap();
        let x = Array::randn(vec![2, 3, 8], Some(8));
        let mut mode = ApplyMode::eval();
        let (a, ln_a) = batch_first.forward(&x, None, None, None, None, &mut mode).unwrap();
        let xt = swap_batch_sequence(&x).unwrap();
        let (b, ln_b) = seq_first.forward(&xt, None, None, None, None, &mut mode).unwrap();
        assert_eq!(swap_batch_sequence(&b).unwrap(), a);
        assert_eq!(swap_batch_sequence(&ln_b.unwrap()).unwrap(), ln_a.unwrap());
    }

    #[test]
    fn test_config_from_json() {
        let config: MultiHeadAttentionConfig = serde_json::from_str(
            r#"{"head_dim": 16, "num_attention_heads": 4, "attn_mask_type": "padding_causal",
                "enable_low_rank_adaptation": true, "low_rank_adaptation_dim": 4}"#,
        )
        .unwrap();
        assert_eq!(config.attn_mask_type, AttnMaskType::PaddingCausal);
        assert!(config.lora.enable_low_rank_adaptation);
        assert!(config.scaled_query_init);
        let mha = MultiHeadAttention::new(config, 32, None, &mut rng()).unwrap();
        assert!(names(&mha).contains(&"qkv/lora_a_kernel".to_string()));
    }

    #[test]
    fn test_rotary_needs_even_head_dim() {
        let config = MultiHeadAttentionConfig {
            enable_rotary_pos_emb: true,
            ..MultiHeadAttentionConfig::new(3, 2)
        };
        assert!(MultiHeadAttention::new(config, 6, None, &mut rng()).is_err());
    }
}
