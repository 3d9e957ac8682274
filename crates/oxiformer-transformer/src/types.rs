use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use oxiformer_module::LayerError;

macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:tt),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = LayerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(LayerError::InvalidConfig(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

named_enum!(
    /// Which positions a query may not attend to.
    AttnMaskType {
        NoMask => "no_mask",
        Padding => "padding",
        Causal => "causal",
        PaddingCausal => "padding_causal",
        /// Causal with the diagonal aligned to the last key.
        CausalBottomRight => "causal_bottom_right",
        PaddingCausalBottomRight => "padding_causal_bottom_right",
    }
);

impl AttnMaskType {
    pub fn is_causal(&self) -> bool {
        !matches!(self, AttnMaskType::NoMask | AttnMaskType::Padding)
    }

    pub fn is_bottom_right(&self) -> bool {
        matches!(
            self,
            AttnMaskType::CausalBottomRight | AttnMaskType::PaddingCausalBottomRight
        )
    }

    /// The same mask with the causal diagonal moved to the bottom right.
    pub fn to_bottom_right(self) -> Self {
        match self {
            AttnMaskType::Causal => AttnMaskType::CausalBottomRight,
            AttnMaskType::PaddingCausal => AttnMaskType::PaddingCausalBottomRight,
            other => other,
        }
    }
}

impl Default for AttnMaskType {
    fn default() -> Self {
        AttnMaskType::Causal
    }
}

named_enum!(
    /// Where an attention bias is added relative to the softmax scale.
    AttnBiasType {
        NoBias => "no_bias",
        PreScaleBias => "pre_scale_bias",
        PostScaleBias => "post_scale_bias",
    }
);

impl AttnBiasType {
    /// An unset bias type means post-scale when a bias is given, none otherwise.
    pub fn resolve(configured: Option<AttnBiasType>, has_bias: bool) -> AttnBiasType {
        match configured {
            Some(t) => t,
            None if has_bias => AttnBiasType::PostScaleBias,
            None => AttnBiasType::NoBias,
        }
    }
}

named_enum!(
    /// Packing of query, key and value.
    QkvLayout {
        /// One `[b, s, 3, h, d]` array.
        Bs3hd => "bs3hd",
        /// Query plus a packed `[b, s, 2, g, d]` key/value array.
        BshdBs2hd => "bshd_bs2hd",
        BshdBshdBshd => "bshd_bshd_bshd",
    }
);

impl Default for QkvLayout {
    fn default() -> Self {
        QkvLayout::BshdBshdBshd
    }
}

named_enum!(
    /// How rotary embeddings pair up the features of a head.
    RotaryGroupMethod {
        /// Rotate `(2i, 2i + 1)`.
        Consecutive => "consecutive",
        /// Rotate `(i, i + d / 2)`.
        Alternate => "alternate",
    }
);

impl Default for RotaryGroupMethod {
    fn default() -> Self {
        RotaryGroupMethod::Consecutive
    }
}

named_enum!(
    TransformerLayerType {
        Encoder => "encoder",
        Decoder => "decoder",
    }
);

impl Default for TransformerLayerType {
    fn default() -> Self {
        TransformerLayerType::Encoder
    }
}
