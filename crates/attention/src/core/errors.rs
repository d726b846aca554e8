//! Error types emitted by the attention crate.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A write would run past the end of a preallocated cache.
    #[error("kv cache overflow: writing {len} positions at {position} exceeds capacity {capacity}")]
    CacheOverflow {
        position: usize,
        len: usize,
        capacity: usize,
    },
    /// A cache write left a gap after the filled prefix.
    #[error("kv cache position {position} is past the filled length {filled}")]
    PositionOutOfRange { position: usize, filled: usize },
    /// Heads cannot be sharded with the requested rank and world size.
    #[error("invalid tensor-parallel topology: {context}")]
    InvalidTopology { context: String },
    /// A backend-specific failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}
