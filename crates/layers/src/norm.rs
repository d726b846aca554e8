//! Layer normalisation over the trailing axis.
//!
//! Mean and variance are computed in [`PrecisionPolicy::reduction`]; the affine
//! parameters are applied in the compute dtype before casting back to storage.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
        }
    }
}

/// LayerNorm with learnable scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    pub fn new(config: NormConfig, weight: Tensor, bias: Tensor) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_shape("norm.bias", &bias, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::PARAMETER_DTYPES)?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Loads `weight`/`bias`, initialising them to ones/zeros when absent.
    pub fn load(config: NormConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(config.hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(config.hidden_size, "bias", Init::Const(0.0))?;
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;
        let hidden_size = self.config.hidden_size as f64;

        let stats = policy.cast_for_reduction(hidden)?;
        let mean = (stats.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = stats.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = policy.cast_for_matmul(&centered.broadcast_div(&denom)?)?;

        let weight = policy.cast_for_matmul(&self.weight)?;
        let bias = policy.cast_for_matmul(&self.bias)?;
        let output = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&output)
    }
}
