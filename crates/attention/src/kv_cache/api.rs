//! Public traits describing key/value cache behaviour.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Per-layer store of projected keys and values across decoding steps.
///
/// Inputs use BLOOM's layout: `key` is `[batch * heads, head_dim, n]` and
/// `value` is `[batch * heads, n, head_dim]` for `n` new positions. Caches are
/// owned by one decoding loop; every mutation goes through `&mut self`.
pub trait KeyValueCache: Send {
    /// Stores the new positions after the filled prefix and returns every
    /// cached key and value.
    fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor), AttentionError>;

    /// Stores the new positions starting at `position` and returns the full
    /// backing keys and values (the whole buffer for fixed-size caches).
    fn write_at(
        &mut self,
        position: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError>;

    /// Filled prefix, `None` while nothing has been written.
    fn view(&self) -> Result<Option<(Tensor, Tensor)>, AttentionError>;

    /// Number of filled positions.
    fn seq_len(&self) -> usize;

    /// Maximum number of positions, `None` when the cache grows on demand.
    fn capacity(&self) -> Option<usize>;

    /// Forgets every stored position.
    fn reset(&mut self);
}
