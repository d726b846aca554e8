//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a label naming the tensor being checked so errors point
//! at the offending parameter or input.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected,
            tensor.dims()
        )))
    }
}

/// Ensures the tensor has exactly `rank` dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Validates that the trailing (feature) axis has the expected size.
pub fn expect_last_dim(label: &str, tensor: &Tensor, features: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&actual) if actual == features => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected trailing dim {features}, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Floating point dtypes accepted for parameters.
pub const PARAMETER_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn errors_carry_the_label() -> Result<()> {
        let t = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?;
        expect_shape("x", &t, &[2, 3, 4])?;
        expect_batch_seq_hidden("x", &t, 4)?;
        expect_last_dim("x", &t, 4)?;
        let err = expect_rank("dense.weight", &t, 2).unwrap_err();
        assert!(err.to_string().contains("dense.weight"));
        assert!(expect_dtype_in("x", &t, &[DType::F16]).is_err());
        Ok(())
    }
}
