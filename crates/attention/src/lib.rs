//! ALiBi self-attention primitives for the BLOOM decoder.
//!
//! Tensors follow BLOOM's fused-head layout: queries and values are
//! `[batch * n_heads, seq_len, head_dim]`, keys are stored transposed as
//! `[batch * n_heads, head_dim, kv_len]`. Position information enters only
//! through the per-head linear bias built in [`alibi`]; there are no positional
//! embeddings.
//!
//! Masks are boolean (`u8`, `1` = masked) and shaped
//! `[batch, 1, q_len, kv_len]`. The kernel fills masked scores with the
//! dtype's finite minimum before a softmax evaluated in `f32`.
//!
//! Key/value caches live in [`kv_cache`]: a growing concatenation cache and a
//! preallocated cache updated in place, which keeps tensor shapes static across
//! decoding steps.

pub mod alibi;
pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use crate::core::{
    Attention, AttentionError, AttentionInputs, AttentionOutput, Config, TensorParallel,
};
pub use alibi::{alibi_slope_tensor, alibi_slopes, build_alibi_tensor};
pub use kv_cache::{BloomCache, CacheLayout, ConcatCache, KeyValueCache, LayerCache, PreallocatedCache};
pub use reference::AlibiAttention;
