//! Rotary position embeddings.

use oxiformer_module::{Array, LayerError, LayerResult};

use crate::types::RotaryGroupMethod;

/// Rotate `x: [b, s, heads, d]` by the position of each sequence entry,
/// starting at `offset`. `windows` is `(min_timescale, max_timescale)`.
pub fn apply_rotary_pos_emb(
    x: &Array,
    offset: usize,
    windows: (f32, f32),
    method: RotaryGroupMethod,
) -> LayerResult<Array> {
    let dims = x.shape().dims();
    if dims.len() != 4 {
        return Err(LayerError::InvalidConfig(format!(
            "rotary embedding expects [b, s, heads, d], got {}",
            x.shape()
        )));
    }
    let (seq, heads, d) = (dims[1], dims[2], dims[3]);
    if d % 2 != 0 {
        return Err(LayerError::InvalidConfig(format!(
            "rotary embedding needs an even head dim, got {}",
            d
        )));
    }
    let (min_scale, max_scale) = windows;
    if min_scale <= 0.0 || max_scale <= 0.0 {
        return Err(LayerError::InvalidConfig(format!(
            "rotary timescales must be positive, got {:?}",
            windows
        )));
    }

    let half = d / 2;
    let timescales: Vec<f32> = (0..half)
        .map(|i| min_scale * (max_scale / min_scale).powf(2.0 * i as f32 / d as f32))
        .collect();

    let mut out = x.clone();
    if seq == 0 || heads == 0 || d == 0 {
        return Ok(out);
    }
    for (lane_idx, lane) in out.lanes_mut().enumerate() {
        let position = (offset + (lane_idx / heads) % seq) as f32;
        for (i, timescale) in timescales.iter().enumerate() {
            let (sin, cos) = (position / timescale).sin_cos();
            let (a, b) = match method {
                RotaryGroupMethod::Alternate => (i, i + half),
                RotaryGroupMethod::Consecutive => (2 * i, 2 * i + 1),
            };
            let (xa, xb) = (lane[a], lane[b]);
            lane[a] = xa * cos - xb * sin;
            lane[b] = xb * cos + xa * sin;
        }
    }
    Ok(out)
}
