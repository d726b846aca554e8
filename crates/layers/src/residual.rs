//! Dropout and the fused dropout-add used on every residual branch.
//!
//! Keep/drop masks are sampled on the host from the dropout generator in
//! [`runtime::rng`], so [`runtime::set_seed`] makes them reproducible. Kept
//! activations are scaled by `1 / (1 - p)`.

use candle_core::{DType, Result, Tensor};
use rand::Rng;

use crate::{dtypes::PrecisionPolicy, LayerError};

/// Dropout with a validated probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    probability: f32,
}

impl Dropout {
    pub fn new(probability: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(LayerError::InvalidProbability(probability).into());
        }
        Ok(Self { probability })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Identity unless `training` is set and the probability is non-zero.
    pub fn forward(&self, input: &Tensor, training: bool) -> Result<Tensor> {
        if !training || self.probability == 0.0 {
            return Ok(input.clone());
        }
        let keep = 1.0 - self.probability;
        let total = input.elem_count();
        let mask: Vec<f32> = runtime::rng::with_dropout_rng(|rng| {
            (0..total)
                .map(|_| if rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 })
                .collect()
        });
        let mask = Tensor::from_vec(mask, input.dims(), input.device())?;
        let dtype = input.dtype();
        let compute = if dtype == DType::F64 { dtype } else { DType::F32 };
        input
            .to_dtype(compute)?
            .mul(&mask.to_dtype(compute)?)?
            .to_dtype(dtype)
    }
}

/// Functional form of [`Dropout::forward`].
pub fn dropout(input: &Tensor, probability: f32, training: bool) -> Result<Tensor> {
    Dropout::new(probability)?.forward(input, training)
}

/// `residual + dropout(input)`, computed with `policy` and cast to storage.
pub fn dropout_add(
    input: &Tensor,
    residual: &Tensor,
    probability: f32,
    training: bool,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    if input.dims() != residual.dims() {
        candle_core::bail!(
            "dropout_add: branch {:?} and residual {:?} differ",
            input.dims(),
            residual.dims()
        );
    }
    let dropped = dropout(input, probability, training)?;
    let sum = policy
        .cast_for_matmul(&dropped)?
        .add(&policy.cast_for_matmul(residual)?)?;
    policy.cast_to_storage(&sum)
}
