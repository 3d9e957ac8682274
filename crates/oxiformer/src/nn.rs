//! Public layer API.
//!
//! [`EXPORTS`] lists every name re-exported here, in declaration order. Both
//! come from one `exports!` invocation so the list cannot drift from the items.

macro_rules! exports {
    ($($krate:ident :: { $($name:ident),+ $(,)? });+ $(;)?) => {
        $($(pub use $krate::$name;)+)+

        /// Names re-exported by this module.
        pub const EXPORTS: [&str; [$($(stringify!($name)),+),+].len()] =
            [$($(stringify!($name)),+),+];
    };
}

exports! {
    oxiformer_module::{DenseGeneral, LayerNorm, LayerNormDenseGeneral, LayerNormMLP};
    oxiformer_transformer::{
        extend_logical_axis_rules,
        DotProductAttention,
        MultiHeadAttention,
        RelativePositionBiases,
        TransformerLayer,
        TransformerLayerType,
    };
}
