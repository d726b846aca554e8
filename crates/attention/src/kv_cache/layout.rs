//! Layout definitions for preallocated key/value caches.

use candle_core::{DType, Device};

/// Dimensions of the buffers backing one layer's cache.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    pub batch: usize,
    /// Heads stored on this rank.
    pub num_heads: usize,
    pub head_dim: usize,
    /// Maximum sequence length captured by the cache.
    pub max_seq_len: usize,
    pub dtype: DType,
    pub device: Device,
}

impl CacheLayout {
    /// `[batch * heads, head_dim, max_seq_len]`
    pub fn key_shape(&self) -> (usize, usize, usize) {
        (self.batch * self.num_heads, self.head_dim, self.max_seq_len)
    }

    /// `[batch * heads, max_seq_len, head_dim]`
    pub fn value_shape(&self) -> (usize, usize, usize) {
        (self.batch * self.num_heads, self.max_seq_len, self.head_dim)
    }
}
