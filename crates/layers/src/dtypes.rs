//! Precision policy shared by the projection and normalisation layers.
//!
//! Parameters usually live in `f16`/`bf16`; matmuls and activations are
//! promoted to `f32` and the result is cast back to the storage dtype.
//! Normalisation statistics always use `f32`.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, compute, reduction)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
