//! Activation used by the BLOOM feed-forward block.
//!
//! BLOOM uses the tanh approximation of GELU:
//! `0.5 * x * (1 + tanh(0.79788456 * x * (1 + 0.044715 * x^2)))`.
//! candle's `gelu` kernel implements exactly this formula (the erf variant is
//! `gelu_erf`), so the activation promotes to the compute dtype, applies the
//! kernel, and casts back to storage.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Tanh-approximated GELU in the policy's compute dtype.
pub fn gelu_tanh(input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    let compute = policy.cast_for_matmul(input)?;
    policy.cast_to_storage(&compute.gelu()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn bloom_gelu(x: f32) -> f32 {
        x * 0.5 * (1.0 + (0.797_884_56 * x * (1.0 + 0.044_715 * x * x)).tanh())
    }

    #[test]
    fn matches_tanh_formula() -> Result<()> {
        let values = [-3.0f32, -1.0, -0.25, 0.0, 0.5, 1.0, 2.5];
        let input = Tensor::new(&values, &Device::Cpu)?.reshape((1, 1, values.len()))?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = gelu_tanh(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;
        for (x, y) in values.iter().zip(out) {
            assert!((bloom_gelu(*x) - y).abs() < 1e-5, "gelu({x}) = {y}");
        }
        Ok(())
    }

    #[test]
    fn keeps_storage_dtype() -> Result<()> {
        let input = Tensor::ones((2, 3, 4), DType::F16, &Device::Cpu)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let out = gelu_tanh(&input, &policy)?;
        assert_eq!(out.dtype(), DType::F16);
        assert_eq!(out.dims(), &[2, 3, 4]);
        Ok(())
    }
}
