use log::{debug, trace};
use rand::Rng;
use serde::{Deserialize, Serialize};

use oxiformer_module::initializers::{Distribution, FanMode, Fans, Initializer};
use oxiformer_module::{Array, LayerError, LayerResult, Module, Param};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelativePositionBiasesConfig {
    pub num_buckets: usize,
    pub max_distance: usize,
    pub num_attention_heads: usize,
    pub embedding_init: Initializer,
    pub embedding_axes: Vec<String>,
}

impl Default for RelativePositionBiasesConfig {
    fn default() -> Self {
        RelativePositionBiasesConfig {
            num_buckets: 32,
            max_distance: 128,
            num_attention_heads: 8,
            embedding_init: Initializer::VarianceScaling {
                scale: 1.0,
                mode: FanMode::FanIn,
                distribution: Distribution::Normal,
            },
            embedding_axes: vec!["heads".to_string(), "relpos_buckets".to_string()],
        }
    }
}

/// T5-style learned attention bias indexed by bucketed relative distance.
#[derive(Debug, Clone)]
pub struct RelativePositionBiases {
    pub config: RelativePositionBiasesConfig,
    /// `[heads, num_buckets]`
    pub rel_embedding: Param,
}

/// Bucket of `relative_position = key_pos - query_pos`.
///
/// Half the buckets hold exact small distances, the rest grow
/// logarithmically up to `max_distance`. Bidirectional buckets reserve the
/// upper half for keys after the query.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> usize {
    let mut buckets = num_buckets as i64;
    let mut ret = 0i64;
    let mut n = -relative_position;
    if bidirectional {
        buckets /= 2;
        if n < 0 {
            ret += buckets;
        }
        n = n.abs();
    } else {
        n = n.max(0);
    }
    let max_exact = buckets / 2;
    let bucket = if n < max_exact {
        n
    } else {
        let n = n as f32;
        let max_exact_f = max_exact as f32;
        let ratio = (n / max_exact_f + f32::EPSILON).ln()
            / (max_distance as f32 / max_exact_f).ln();
        let large = max_exact + (ratio * (buckets - max_exact) as f32) as i64;
        large.min(buckets - 1)
    };
    (ret + bucket) as usize
}

impl RelativePositionBiases {
    pub fn new<R: Rng>(config: RelativePositionBiasesConfig, rng: &mut R) -> LayerResult<Self> {
        if config.num_buckets < 4 || config.num_attention_heads == 0 {
            return Err(LayerError::InvalidConfig(format!(
                "need at least 4 buckets and one head, got {} buckets, {} heads",
                config.num_buckets, config.num_attention_heads
            )));
        }
        if config.max_distance <= config.num_buckets / 2 {
            return Err(LayerError::InvalidConfig(format!(
                "max_distance {} is too small for {} buckets",
                config.max_distance, config.num_buckets
            )));
        }
        let shape = [config.num_attention_heads, config.num_buckets];
        let fans = Fans {
            fan_in: config.num_buckets,
            fan_out: config.num_attention_heads,
        };
        let rel_embedding = Param::new(
            config.embedding_init.init(&shape, fans, rng),
            &config.embedding_axes,
        )?;
        debug!(
            "RelativePositionBiases(heads={}, buckets={}, max_distance={})",
            config.num_attention_heads, config.num_buckets, config.max_distance
        );
        Ok(RelativePositionBiases {
            config,
            rel_embedding,
        })
    }

    /// Attention bias `[1, heads, q_seqlen, k_seqlen]`.
    pub fn forward(&self, q_seqlen: usize, k_seqlen: usize, bidirectional: bool) -> LayerResult<Array> {
        trace!("RelativePositionBiases q={} k={}", q_seqlen, k_seqlen);
        let heads = self.config.num_attention_heads;
        let buckets = self.config.num_buckets;
        let table = self.rel_embedding.value.data();

        let mut bucket_ids = Vec::with_capacity(q_seqlen * k_seqlen);
        for q in 0..q_seqlen {
            for k in 0..k_seqlen {
                bucket_ids.push(relative_position_bucket(
                    k as i64 - q as i64,
                    bidirectional,
                    buckets,
                    self.config.max_distance,
                ));
            }
        }

        let mut data = Vec::with_capacity(heads * bucket_ids.len());
        for h in 0..heads {
            let row = &table[h * buckets..(h + 1) * buckets];
            data.extend(bucket_ids.iter().map(|&b| row[b]));
        }
        Ok(Array::new(data, vec![1, heads, q_seqlen, k_seqlen])?)
    }
}

impl Module for RelativePositionBiases {
    fn named_params(&self) -> Vec<(String, &Param)> {
        vec![("rel_embedding".to_string(), &self.rel_embedding)]
    }

    fn named_params_mut(&mut self) -> Vec<(String, &mut Param)> {
        vec![("rel_embedding".to_string(), &mut self.rel_embedding)]
    }
}
