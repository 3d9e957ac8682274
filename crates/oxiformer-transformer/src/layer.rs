use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use oxiformer_module::dropout::{ApplyMode, Dropout};
use oxiformer_module::initializers::Initializer;
use oxiformer_module::params::{scoped, scoped_mut};
use oxiformer_module::sharding::{W_FSDP_AXES, W_JOINED_AXES, W_NO_SHARD_AXES, W_TP_AXES};
use oxiformer_module::{
    Activation, Array, LayerError, LayerNorm, LayerNormConfig, LayerNormMLP, LayerNormMLPConfig,
    LayerNormType, LayerResult, LoraConfig, Module, Param,
};

use crate::multihead::{axes, DecodeCache, MultiHeadAttention, MultiHeadAttentionConfig};
use crate::relative::{RelativePositionBiases, RelativePositionBiasesConfig};
use crate::types::{AttnBiasType, AttnMaskType, RotaryGroupMethod, TransformerLayerType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerLayerConfig {
    pub hidden_size: usize,
    pub mlp_hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_gqa_groups: Option<usize>,
    pub layernorm_type: LayerNormType,
    pub layernorm_epsilon: f32,
    pub zero_centered_gamma: bool,
    pub hidden_dropout: f32,
    pub hidden_dropout_dims: Vec<isize>,
    pub attention_dropout: f32,
    pub intermediate_dropout: f32,
    pub intermediate_dropout_dims: Vec<isize>,
    pub mlp_activations: Vec<Activation>,
    pub use_bias: bool,
    pub kernel_init: Initializer,
    pub bias_init: Initializer,
    /// Residual branches start from the normalized input.
    pub apply_residual_connection_post_layernorm: bool,
    /// Normalize the layer output instead of the attention input.
    pub output_layernorm: bool,
    pub layer_type: TransformerLayerType,
    pub self_attn_mask_type: AttnMaskType,
    pub self_attn_bias_type: Option<AttnBiasType>,
    pub enable_relative_embedding: bool,
    /// Defaults to 32 buckets and a max distance of 128.
    pub relative_embedding: Option<RelativePositionBiasesConfig>,
    pub enable_rotary_pos_emb: bool,
    pub rotary_pos_emb_windows: (f32, f32),
    pub rotary_pos_emb_group_method: RotaryGroupMethod,
    /// Per-sample rate of skipping the residual branches.
    pub drop_path: f32,
    pub fuse_qkv_params: bool,
    pub transpose_batch_sequence: bool,
    pub scaled_query_init: bool,
    pub scale_attn_logits: bool,
    pub window_size: Option<(i64, i64)>,
    #[serde(flatten)]
    pub lora: LoraConfig,
}

impl Default for TransformerLayerConfig {
    fn default() -> Self {
        TransformerLayerConfig {
            hidden_size: 512,
            mlp_hidden_size: 2048,
            num_attention_heads: 8,
            num_gqa_groups: None,
            layernorm_type: LayerNormType::LayerNorm,
            layernorm_epsilon: 1e-6,
            zero_centered_gamma: false,
            hidden_dropout: 0.1,
            hidden_dropout_dims: Vec::new(),
            attention_dropout: 0.1,
            intermediate_dropout: 0.1,
            intermediate_dropout_dims: Vec::new(),
            mlp_activations: vec![Activation::Relu],
            use_bias: false,
            kernel_init: Initializer::kernel_default(),
            bias_init: Initializer::Zeros,
            apply_residual_connection_post_layernorm: false,
            output_layernorm: false,
            layer_type: TransformerLayerType::Encoder,
            self_attn_mask_type: AttnMaskType::Causal,
            self_attn_bias_type: None,
            enable_relative_embedding: true,
            relative_embedding: None,
            enable_rotary_pos_emb: false,
            rotary_pos_emb_windows: (1.0, 10000.0),
            rotary_pos_emb_group_method: RotaryGroupMethod::Consecutive,
            drop_path: 0.0,
            fuse_qkv_params: true,
            transpose_batch_sequence: false,
            scaled_query_init: true,
            scale_attn_logits: false,
            window_size: None,
            lora: LoraConfig::default(),
        }
    }
}

impl TransformerLayerConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
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

    fn attention_config(&self) -> MultiHeadAttentionConfig {
        MultiHeadAttentionConfig {
            head_dim: self.head_dim(),
            num_attention_heads: self.num_attention_heads,
            num_gqa_groups: self.num_gqa_groups,
            attention_dropout: self.attention_dropout,
            input_layernorm: !self.output_layernorm,
            layernorm_type: self.layernorm_type,
            layernorm_epsilon: self.layernorm_epsilon,
            zero_centered_gamma: self.zero_centered_gamma,
            return_layernorm_output: self.apply_residual_connection_post_layernorm,
            use_bias: self.use_bias,
            kernel_init: self.kernel_init.clone(),
            bias_init: self.bias_init.clone(),
            attn_mask_type: self.self_attn_mask_type,
            attn_bias_type: self.self_attn_bias_type,
            enable_rotary_pos_emb: self.enable_rotary_pos_emb,
            rotary_pos_emb_windows: self.rotary_pos_emb_windows,
            rotary_pos_emb_group_method: self.rotary_pos_emb_group_method,
            fuse_qkv_params: self.fuse_qkv_params,
            transpose_batch_sequence: self.transpose_batch_sequence,
            scale_attn_logits: self.scale_attn_logits,
            scaled_query_init: self.scaled_query_init,
            window_size: self.window_size,
            lora: self.lora.clone(),
        }
    }

    fn encoder_decoder_attention_config(&self) -> MultiHeadAttentionConfig {
        MultiHeadAttentionConfig {
            input_layernorm: true,
            attn_mask_type: AttnMaskType::Padding,
            attn_bias_type: None,
            enable_rotary_pos_emb: false,
            window_size: None,
            ..self.attention_config()
        }
    }

    fn mlp_config(&self) -> LayerNormMLPConfig {
        LayerNormMLPConfig {
            enable_layernorm: true,
            layernorm: self.layernorm_config(),
            intermediate_dim: self.mlp_hidden_size,
            activations: self.mlp_activations.clone(),
            intermediate_dropout_rate: self.intermediate_dropout,
            intermediate_hidden_dropout_dims: self.intermediate_dropout_dims.clone(),
            use_bias: self.use_bias,
            kernel_init: self.kernel_init.clone(),
            kernel_axes_1: axes(&[W_FSDP_AXES, W_JOINED_AXES, W_TP_AXES]),
            kernel_axes_2: axes(&[W_TP_AXES, W_FSDP_AXES]),
            bias_init: self.bias_init.clone(),
            bias_axes_1: axes(&[W_JOINED_AXES, W_TP_AXES]),
            bias_axes_2: axes(&[W_NO_SHARD_AXES]),
            return_layernorm_output: self.apply_residual_connection_post_layernorm,
            lora: self.lora.clone(),
        }
    }

    pub fn validate(&self) -> LayerResult<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(LayerError::InvalidConfig(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        for (name, rate) in [
            ("hidden_dropout", self.hidden_dropout),
            ("drop_path", self.drop_path),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(LayerError::InvalidConfig(format!(
                    "{} must be in [0, 1], got {}",
                    name, rate
                )));
            }
        }
        Ok(())
    }
}

/// One encoder or decoder block: self attention, optional cross attention
/// over the encoder output, and an MLP, each with a residual connection.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    pub config: TransformerLayerConfig,
    pub relpos_bias: Option<RelativePositionBiases>,
    pub attention: MultiHeadAttention,
    pub encoder_decoder_attention: Option<MultiHeadAttention>,
    pub mlp: LayerNormMLP,
    pub output_layernorm: Option<LayerNorm>,
    hidden_dropout: Dropout,
    drop_path: Dropout,
}

impl TransformerLayer {
    pub fn new<R: Rng>(config: TransformerLayerConfig, rng: &mut R) -> LayerResult<Self> {
        config.validate()?;
        let hidden = config.hidden_size;

        let relpos_bias = if config.enable_relative_embedding {
            let rel_config = match &config.relative_embedding {
                Some(rel) if rel.num_attention_heads != config.num_attention_heads => {
                    return Err(LayerError::InvalidConfig(format!(
                        "relative embedding has {} heads, layer has {}",
                        rel.num_attention_heads, config.num_attention_heads
                    )))
                }
                Some(rel) => rel.clone(),
                None => RelativePositionBiasesConfig {
                    num_buckets: 32,
                    max_distance: 128,
                    num_attention_heads: config.num_attention_heads,
                    ..RelativePositionBiasesConfig::default()
                },
            };
            Some(RelativePositionBiases::new(rel_config, rng)?)
        } else {
            None
        };

        let attention = MultiHeadAttention::new(config.attention_config(), hidden, None, rng)?;
        let encoder_decoder_attention = match config.layer_type {
            TransformerLayerType::Decoder => Some(MultiHeadAttention::new(
                config.encoder_decoder_attention_config(),
                hidden,
                Some(hidden),
                rng,
            )?),
            TransformerLayerType::Encoder => None,
        };
        let mlp = LayerNormMLP::new(config.mlp_config(), hidden, rng)?;
        let output_layernorm = if config.output_layernorm {
            Some(LayerNorm::new(config.layernorm_config(), hidden, rng)?)
        } else {
            None
        };

        let hidden_dropout =
            Dropout::with_broadcast_dims(config.hidden_dropout, &config.hidden_dropout_dims);
        // one draw per sample: share the mask over every axis but batch
        let drop_path = if config.transpose_batch_sequence {
            Dropout::with_broadcast_dims(config.drop_path, &[0, 2])
        } else {
            Dropout::with_broadcast_dims(config.drop_path, &[1, 2])
        };

        let layer = TransformerLayer {
            config,
            relpos_bias,
            attention,
            encoder_decoder_attention,
            mlp,
            output_layernorm,
            hidden_dropout,
            drop_path,
        };
        debug!(
            "TransformerLayer({}, hidden={}, heads={}, params={})",
            layer.config.layer_type,
            hidden,
            layer.config.num_attention_heads,
            layer.param_count()
        );
        Ok(layer)
    }

    fn attention_scope(&self) -> &'static str {
        match self.config.layer_type {
            TransformerLayerType::Encoder => "attention",
            TransformerLayerType::Decoder => "self_attention",
        }
    }

    /// Cache for autoregressive decoding with this (decoder) layer.
    pub fn init_cache(&self, batch: usize, max_length: usize) -> DecodeCache {
        self.attention.init_cache(batch, max_length)
    }

    fn residual_source(&self, ln_out: Option<Array>, input: &Array) -> LayerResult<Array> {
        if self.config.apply_residual_connection_post_layernorm {
            ln_out.ok_or_else(|| {
                LayerError::InvalidConfig("normalized input missing for the residual".to_string())
            })
        } else {
            Ok(input.clone())
        }
    }

    /// `inputs` is `[b, s, hidden]` (`[s, b, hidden]` with
    /// `transpose_batch_sequence`). Decoders need `encoded`; a decode `cache`
    /// makes `inputs` the next positions of the sequence.
    pub fn forward(
        &self,
        inputs: &Array,
        encoded: Option<&Array>,
        attention_mask: Option<&Array>,
        encoder_decoder_mask: Option<&Array>,
        cache: Option<&mut DecodeCache>,
        mode: &mut ApplyMode,
    ) -> LayerResult<Array> {
        trace!("TransformerLayer forward {}", inputs.shape());
        if inputs.ndim() != 3 {
            return Err(LayerError::InvalidConfig(format!(
                "transformer layer input must be 3-D, got {}",
                inputs.shape()
            )));
        }
        let is_decoder = self.config.layer_type == TransformerLayerType::Decoder;
        if cache.is_some() && !is_decoder {
            return Err(LayerError::InvalidConfig(
                "decode cache is only supported for decoder layers".to_string(),
            ));
        }

        let bias = match &self.relpos_bias {
            Some(relpos) => {
                let seq_axis = if self.config.transpose_batch_sequence { 0 } else { 1 };
                let len = match &cache {
                    Some(c) => c.max_length(),
                    None => inputs.shape().dims()[seq_axis],
                };
                Some(relpos.forward(len, len, !is_decoder)?)
            }
            None => None,
        };

        let (x, ln_out) = self.attention.forward(
            inputs,
            None,
            attention_mask,
            bias.as_ref(),
            cache,
            mode,
        )?;
        let residual = self.residual_source(ln_out, inputs)?;
        let x = self.hidden_dropout.apply(&x, mode)?;
        let x = self.drop_path.apply(&x, mode)?;
        let x = x.add(&residual)?;

        let mlp_input = match &self.encoder_decoder_attention {
            Some(cross) => {
                let encoded = encoded.ok_or_else(|| {
                    LayerError::InvalidConfig("decoder layers need the encoder output".to_string())
                })?;
                let (y, ln_out) =
                    cross.forward(&x, Some(encoded), encoder_decoder_mask, None, None, mode)?;
                let residual = self.residual_source(ln_out, &x)?;
                let y = self.hidden_dropout.apply(&y, mode)?;
                y.add(&residual)?
            }
            None => x,
        };

        let (z, ln_out) = self.mlp.forward(&mlp_input, mode)?;
        let residual = self.residual_source(ln_out, &mlp_input)?;
        let z = self.hidden_dropout.apply(&z, mode)?;
        let z = self.drop_path.apply(&z, mode)?;
        let z = z.add(&residual)?;

        match &self.output_layernorm {
            Some(ln) => ln.forward(&z),
            None => Ok(z),
        }
    }
}

impl Module for TransformerLayer {
    fn named_params(&self) -> Vec<(String, &Param)> {
        let mut params = Vec::new();
        if let Some(relpos) = &self.relpos_bias {
            params.extend(scoped("relpos_bias", relpos.named_params()));
        }
        params.extend(scoped(self.attention_scope(), self.attention.named_params()));
        if let Some(cross) = &self.encoder_decoder_attention {
            params.extend(scoped("encoder_decoder_attention", cross.named_params()));
        }
        params.extend(scoped("mlp", self.mlp.named_params()));
        if let Some(ln) = &self.output_layernorm {
            params.extend(scoped("output_layernorm", ln.named_params()));
        }
        params
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Param)> {
        let scope = self.attention_scope();
        let mut params = Vec::new();
        if let Some(relpos) = &mut self.relpos_bias {
            params.extend(scoped_mut("relpos_bias", relpos.named_params_mut()));
        }
        params.extend(scoped_mut(scope, self.attention.named_params_mut()));
        if let Some(cross) = &mut self.encoder_decoder_attention {
            params.extend(scoped_mut("encoder_decoder_attention", cross.named_params_mut()));
        }
        params.extend(scoped_mut("mlp", self.mlp.named_params_mut()));
        if let Some(ln) = &mut self.output_layernorm {
            params.extend(scoped_mut("output_layernorm", ln.named_params_mut()));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(31)
    }

    fn small(layer_type: TransformerLayerType) -> TransformerLayerConfig {
        TransformerLayerConfig {
            hidden_size: 8,
            mlp_hidden_size: 16,
            num_attention_heads: 2,
            hidden_dropout: 0.0,
            attention_dropout: 0.0,
            intermediate_dropout: 0.0,
            layer_type,
            ..TransformerLayerConfig::default()
        }
    }

    fn names(layer: &TransformerLayer) -> Vec<String> {
        layer.named_params().into_iter().map(|(n, _)| n).collect()
    }

    fn assert_close(a: &Array, b: &Array) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.data().iter().zip(b.data()) {
            assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_encoder_forward_and_names() {
        let layer = TransformerLayer::new(small(TransformerLayerType::Encoder), &mut rng()).unwrap();
        let x = Array::randn(vec![2, 5, 8], Some(0));
        let y = layer.forward(&x, None, None, None, None, &mut ApplyMode::eval()).unwrap();
        assert_eq!(y.shape_vec(), vec![2, 5, 8]);

        let n = names(&layer);
        assert_eq!(n[0], "relpos_bias/rel_embedding");
        assert!(n.contains(&"attention/qkv/kernel".to_string()));
        assert!(n.contains(&"mlp/wi_kernel".to_string()));
        assert!(!n.iter().any(|p| p.starts_with("encoder_decoder_attention")));
        assert_eq!(layer.state_dict()["relpos_bias/rel_embedding"].shape_vec(), vec![2, 32]);
    }

    #[test]
    fn test_decoder_needs_encoded() {
        let layer = TransformerLayer::new(small(TransformerLayerType::Decoder), &mut rng()).unwrap();
        let n = names(&layer);
        assert!(n.contains(&"self_attention/qkv/kernel".to_string()));
        assert!(n.contains(&"encoder_decoder_attention/query/kernel".to_string()));
        assert!(n.contains(&"encoder_decoder_attention/kv/kernel".to_string()));

        let x = Array::randn(vec![2, 3, 8], Some(1));
        let enc = Array::randn(vec![2, 6, 8], Some(2));
        let mut mode = ApplyMode::eval();
        assert!(layer.forward(&x, None, None, None, None, &mut mode).is_err());
        let y = layer.forward(&x, Some(&enc), None, None, None, &mut mode).unwrap();
        assert_eq!(y.shape_vec(), vec![2, 3, 8]);
    }

    #[test]
    fn test_decoder_incremental_decode_matches_full_pass() {
        let config = TransformerLayerConfig {
            enable_rotary_pos_emb: true,
            ..small(TransformerLayerType::Decoder)
        };
        let layer = TransformerLayer::new(config, &mut rng()).unwrap();
        let x = Array::randn(vec![1, 4, 8], Some(3));
        let enc = Array::randn(vec![1, 5, 8], Some(4));
        let mut mode = ApplyMode::eval();
        let full = layer.forward(&x, Some(&enc), None, None, None, &mut mode).unwrap();

        let mut cache = layer.init_cache(1, 4);
        for t in 0..4 {
            let step = x.narrow(1, t, 1).unwrap();
            let y = layer
                .forward(&step, Some(&enc), None, None, Some(&mut cache), &mut mode)
                .unwrap();
            assert_close(&y, &full.narrow(1, t, 1).unwrap());
        }

        let encoder = TransformerLayer::new(small(TransformerLayerType::Encoder), &mut rng()).unwrap();
        let mut cache = encoder.init_cache(1, 4);
        assert!(encoder
            .forward(&x, None, None, None, Some(&mut cache), &mut mode)
            .is_err());
    }

    #[test]
    fn test_output_layernorm_moves_normalization() {
        let config = TransformerLayerConfig {
            output_layernorm: true,
            enable_relative_embedding: false,
            ..small(TransformerLayerType::Encoder)
        };
        let layer = TransformerLayer::new(config, &mut rng()).unwrap();
        let n = names(&layer);
        assert!(!n.contains(&"attention/qkv/scale".to_string()));
        assert!(n.contains(&"output_layernorm/scale".to_string()));
        assert!(!n.iter().any(|p| p.starts_with("relpos_bias")));

        let y = layer
            .forward(&Array::randn(vec![1, 3, 8], Some(5)), None, None, None, None, &mut ApplyMode::eval())
            .unwrap();
        for row in y.lanes() {
            assert!((row.iter().sum::<f32>() / 8.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_post_layernorm_residual_and_sequence_first() {
        let base = TransformerLayerConfig {
            apply_residual_connection_post_layernorm: true,
            ..small(TransformerLayerType::Encoder)
        };
        let batch_first = TransformerLayer::new(base.clone(), &mut rng()).unwrap();
        let seq_first = TransformerLayer::new(
            TransformerLayerConfig {
                transpose_batch_sequence: true,
                ..base
            },
            &mut rng(),
        )
        .unwrap();
        let x = Array::randn(vec![2, 3, 8], Some(6));
        let mut mode = ApplyMode::eval();
        let a = batch_first.forward(&x, None, None, None, None, &mut mode).unwrap();
        let b = seq_first
            .forward(&x.permute(&[1, 0, 2]).unwrap(), None, None, None, None, &mut mode)
            .unwrap();
        assert_close(&b.permute(&[1, 0, 2]).unwrap(), &a);
    }

    #[test]
    fn test_training_mode_is_reproducible() {
        let config = TransformerLayerConfig {
            hidden_dropout: 0.2,
            attention_dropout: 0.2,
            intermediate_dropout: 0.2,
            drop_path: 0.1,
            ..small(TransformerLayerType::Encoder)
        };
        let layer = TransformerLayer::new(config, &mut rng()).unwrap();
        let x = Array::randn(vec![4, 3, 8], Some(7));
        let a = layer.forward(&x, None, None, None, None, &mut ApplyMode::train(3)).unwrap();
        let b = layer.forward(&x, None, None, None, None, &mut ApplyMode::train(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_drop_path_is_per_sample() {
        let config = TransformerLayerConfig {
            drop_path: 0.75,
            ..small(TransformerLayerType::Encoder)
        };
        let layer = TransformerLayer::new(config, &mut rng()).unwrap();
        let sample = Array::randn(vec![1, 3, 8], Some(12));
        let copies: Vec<&Array> = std::iter::repeat(&sample).take(32).collect();
        let x = Array::concatenate(&copies, 0).unwrap();

        let out = layer.forward(&x, None, None, None, None, &mut ApplyMode::train(5)).unwrap();
        let rows: Vec<Array> = (0..32).map(|b| out.narrow(0, b, 1).unwrap()).collect();
        // both residual branches dropped leaves the sample untouched
        assert!(rows.iter().any(|r| *r == sample));
        assert!(rows.iter().any(|r| *r != sample));
        // each sample keeps or drops a branch as a whole: at most 4 outcomes
        let mut outcomes: Vec<&Array> = Vec::new();
        for r in &rows {
            if !outcomes.contains(&r) {
                outcomes.push(r);
            }
        }
        assert!(outcomes.len() <= 4, "{} distinct samples", outcomes.len());
    }

    #[test]
    fn test_invalid_configs() {
        let config = TransformerLayerConfig {
            hidden_size: 10,
            num_attention_heads: 3,
            ..TransformerLayerConfig::default()
        };
        assert!(TransformerLayer::new(config, &mut rng()).is_err());

        let config = TransformerLayerConfig {
            relative_embedding: Some(RelativePositionBiasesConfig {
                num_attention_heads: 4,
                ..RelativePositionBiasesConfig::default()
            }),
            ..small(TransformerLayerType::Encoder)
        };
        assert!(TransformerLayer::new(config, &mut rng()).is_err());
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: TransformerLayerConfig =
            serde_json::from_str(r#"{"layer_type": "decoder", "mlp_activations": ["gelu", "linear"]}"#).unwrap();
        assert_eq!(config.layer_type, TransformerLayerType::Decoder);
        assert_eq!(config.hidden_size, 512);
        assert_eq!(config.head_dim(), 64);
        assert_eq!(config.mlp_activations, vec![Activation::Gelu, Activation::Linear]);
        assert!(config.enable_relative_embedding);
    }
}
