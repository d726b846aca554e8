//! Cache that grows by concatenation along the sequence axis.

use candle_core::Tensor;

use super::{api::KeyValueCache, KEY_SEQ_DIM, VALUE_SEQ_DIM};
use crate::core::AttentionError;

#[derive(Debug, Clone, Default)]
pub struct ConcatCache {
    entries: Option<(Tensor, Tensor)>,
}

impl ConcatCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from already projected keys and values.
    pub fn from_tensors(key: Tensor, value: Tensor) -> Result<Self, AttentionError> {
        new_positions(&key, &value)?;
        Ok(Self {
            entries: Some((key, value)),
        })
    }
}

/// Validates a key/value pair and returns how many positions it holds.
pub(crate) fn new_positions(key: &Tensor, value: &Tensor) -> Result<usize, AttentionError> {
    let (kb, kd, kn) = key
        .dims3()
        .map_err(|_| AttentionError::shape("key must be [batch * heads, head_dim, seq]"))?;
    let (vb, vn, vd) = value
        .dims3()
        .map_err(|_| AttentionError::shape("value must be [batch * heads, seq, head_dim]"))?;
    if kb != vb || kd != vd || kn != vn {
        return Err(AttentionError::shape(format!(
            "key {:?} and value {:?} disagree",
            key.dims(),
            value.dims()
        )));
    }
    Ok(kn)
}

impl KeyValueCache for ConcatCache {
    fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
        new_positions(key, value)?;
        let merged = match self.entries.take() {
            Some((past_key, past_value)) => (
                Tensor::cat(&[&past_key, key], KEY_SEQ_DIM)?,
                Tensor::cat(&[&past_value, value], VALUE_SEQ_DIM)?,
            ),
            None => (key.clone(), value.clone()),
        };
        self.entries = Some(merged.clone());
        Ok(merged)
    }

    fn write_at(
        &mut self,
        position: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let filled = self.seq_len();
        if position == filled {
            return self.append(key, value);
        }
        if position > filled {
            return Err(AttentionError::PositionOutOfRange { position, filled });
        }
        let len = new_positions(key, value)?;
        let Some((past_key, past_value)) = self.entries.take() else {
            return Err(AttentionError::PositionOutOfRange { position, filled });
        };
        let end = position + len;
        let splice = |past: &Tensor, new: &Tensor, dim: usize| -> candle_core::Result<Tensor> {
            let mut parts = vec![past.narrow(dim, 0, position)?, new.clone()];
            if end < filled {
                parts.push(past.narrow(dim, end, filled - end)?);
            }
            Tensor::cat(&parts, dim)
        };
        let merged = (
            splice(&past_key, key, KEY_SEQ_DIM)?,
            splice(&past_value, value, VALUE_SEQ_DIM)?,
        );
        self.entries = Some(merged.clone());
        Ok(merged)
    }

    fn view(&self) -> Result<Option<(Tensor, Tensor)>, AttentionError> {
        Ok(self.entries.clone())
    }

    fn seq_len(&self) -> usize {
        self.entries
            .as_ref()
            .map(|(key, _)| key.dims()[KEY_SEQ_DIM])
            .unwrap_or(0)
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn reset(&mut self) {
        self.entries = None;
    }
}
