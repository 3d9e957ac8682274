use std::fmt::{Debug, Display};
use std::iter::Sum;
use std::ops::{AddAssign, MulAssign};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Scalar stored in a [`Tensor`](crate::Tensor): `f32` or `f64`.
///
/// Arithmetic and the transcendental functions come from [`num_traits::Float`].
pub trait Float:
    num_traits::Float
    + AddAssign
    + MulAssign
    + Sum
    + Default
    + Debug
    + Display
    + Send
    + Sync
    + Serialize
    + DeserializeOwned
    + 'static
{
    /// Lossy conversion, used for sampling and constants.
    fn from_f64(v: f64) -> Self;

    fn from_usize(v: usize) -> Self {
        Self::from_f64(v as f64)
    }
}

impl Float for f32 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Float for f64 {
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
}
