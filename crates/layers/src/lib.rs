//! Building blocks for the BLOOM decoder layers.
//!
//! Everything here works on `(batch, seq, hidden)` tensors and returns
//! `candle_core::Result` so the model crate can propagate with `?`. Dropout
//! masks are drawn from the seeded generator in [`runtime::rng`], which keeps
//! training runs reproducible after [`runtime::set_seed`].

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod norm;
pub mod residual;

use thiserror::Error;

pub use activations::gelu_tanh;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig};
pub use norm::{LayerNorm, NormConfig};
pub use residual::{dropout, dropout_add, Dropout};

/// Construction-time failures for layer components.
///
/// Forward passes report these through `candle_core::Error::Wrapped`, so
/// callers only deal with one error type on the hot path.
#[derive(Debug, Error)]
pub enum LayerError {
    /// Dropout probability outside `[0, 1)`.
    #[error("dropout probability must be in [0, 1), got {0}")]
    InvalidProbability(f32),
    /// The input features cannot be split evenly into tensor-parallel slices.
    #[error("cannot split {features} input features into {slices} slices")]
    IndivisibleSlices { features: usize, slices: usize },
    /// A parameter does not match the configured layer dimensions.
    #[error("{name}: expected shape {expected:?}, got {actual:?}")]
    ParameterShape {
        name: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl From<LayerError> for candle_core::Error {
    fn from(err: LayerError) -> Self {
        candle_core::Error::wrap(err)
    }
}
