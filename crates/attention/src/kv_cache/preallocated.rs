//! Fixed-size cache written in place.
//!
//! Buffers are allocated once for `max_seq_len` positions and never change
//! shape. [`KeyValueCache::write_at`] copies the new positions into the
//! buffers with `slice_set` and hands back the whole buffers, so every decoding
//! step sees the same `kv_len`. Positions past the filled length hold stale or
//! zero data and must be masked by the caller.
//!
//! The buffers are shared with every tensor returned from the cache: a later
//! write is visible through them. The type is deliberately not `Clone`.

use candle_core::Tensor;

use super::{api::KeyValueCache, concat::new_positions, layout::CacheLayout, KEY_SEQ_DIM, VALUE_SEQ_DIM};
use crate::core::AttentionError;

#[derive(Debug)]
pub struct PreallocatedCache {
    layout: CacheLayout,
    key: Tensor,
    value: Tensor,
    len: usize,
}

impl PreallocatedCache {
    pub fn new(layout: CacheLayout) -> Result<Self, AttentionError> {
        if layout.max_seq_len == 0 || layout.batch == 0 || layout.num_heads == 0 {
            return Err(AttentionError::shape(format!(
                "preallocated cache needs non-zero dimensions, got {layout:?}"
            )));
        }
        let key = Tensor::zeros(layout.key_shape(), layout.dtype, &layout.device)?;
        let value = Tensor::zeros(layout.value_shape(), layout.dtype, &layout.device)?;
        Ok(Self {
            layout,
            key,
            value,
            len: 0,
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    fn store(&mut self, position: usize, key: &Tensor, value: &Tensor) -> Result<(), AttentionError> {
        let len = new_positions(key, value)?;
        let (rows, head_dim, _) = self.layout.key_shape();
        if key.dims()[0] != rows || key.dims()[1] != head_dim {
            return Err(AttentionError::shape(format!(
                "key {:?} does not fit cache rows {rows} x head_dim {head_dim}",
                key.dims()
            )));
        }
        let capacity = self.layout.max_seq_len;
        if position + len > capacity {
            return Err(AttentionError::CacheOverflow {
                position,
                len,
                capacity,
            });
        }
        if position > self.len {
            return Err(AttentionError::PositionOutOfRange {
                position,
                filled: self.len,
            });
        }
        let key = key.to_dtype(self.layout.dtype)?.contiguous()?;
        let value = value.to_dtype(self.layout.dtype)?.contiguous()?;
        self.key.slice_set(&key, KEY_SEQ_DIM, position)?;
        self.value.slice_set(&value, VALUE_SEQ_DIM, position)?;
        self.len = self.len.max(position + len);
        Ok(())
    }
}

impl KeyValueCache for PreallocatedCache {
    fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
        self.store(self.len, key, value)?;
        self.view()?
            .ok_or_else(|| AttentionError::shape("append stored no positions"))
    }

    fn write_at(
        &mut self,
        position: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        self.store(position, key, value)?;
        Ok((self.key.clone(), self.value.clone()))
    }

    fn view(&self) -> Result<Option<(Tensor, Tensor)>, AttentionError> {
        if self.len == 0 {
            return Ok(None);
        }
        Ok(Some((
            self.key.narrow(KEY_SEQ_DIM, 0, self.len)?,
            self.value.narrow(VALUE_SEQ_DIM, 0, self.len)?,
        )))
    }

    fn seq_len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.layout.max_seq_len)
    }

    fn reset(&mut self) {
        self.len = 0;
    }
}
