//! Core traits and types shared across the attention crate.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{Config, TensorParallel};
pub use errors::AttentionError;

/// Tensors consumed by one attention call, in BLOOM's fused-head layout.
///
/// * `query`: `[batch * heads, q_len, head_dim]`
/// * `key`: `[batch * heads, head_dim, kv_len]`
/// * `value`: `[batch * heads, kv_len, head_dim]`
/// * `alibi`: `[batch * heads, 1, kv_len]`
/// * `mask`: boolean `[batch, 1, q_len, kv_len]`, `1` = masked
/// * `head_mask`: broadcastable to `[batch, heads, q_len, kv_len]`
#[derive(Debug, Clone, Copy)]
pub struct AttentionInputs<'a> {
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
    pub alibi: &'a Tensor,
    pub mask: &'a Tensor,
    pub head_mask: Option<&'a Tensor>,
}

/// Context vectors and the probabilities that produced them.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[batch * heads, q_len, head_dim]`
    pub context: Tensor,
    /// `[batch, heads, q_len, kv_len]`, after dropout and head masking.
    pub probs: Tensor,
}

/// Unified interface for attention kernels.
pub trait Attention {
    fn attend(
        &self,
        inputs: &AttentionInputs<'_>,
        training: bool,
    ) -> Result<AttentionOutput, AttentionError>;
}
