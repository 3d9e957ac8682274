pub mod attention;
pub mod axis_rules;
pub mod layer;
pub mod multihead;
pub mod relative;
pub mod rotary;
pub mod types;

pub use attention::{DotProductAttention, DotProductAttentionConfig, MASK_FILL};
pub use axis_rules::{extend_logical_axis_rules, extend_logical_axis_rules_with};
pub use layer::{TransformerLayer, TransformerLayerConfig};
pub use multihead::{DecodeCache, MultiHeadAttention, MultiHeadAttentionConfig};
pub use relative::{relative_position_bucket, RelativePositionBiases, RelativePositionBiasesConfig};
pub use rotary::apply_rotary_pos_emb;
pub use types::{AttnBiasType, AttnMaskType, QkvLayout, RotaryGroupMethod, TransformerLayerType};
