//! Conversions between BLOOM's cache layout and the standard
//! `[batch, heads, seq, head_dim]` layout used by generic decoding utilities.

use candle_core::Tensor;

use crate::core::AttentionError;

/// `[b * h, d, s]` keys and `[b * h, s, d]` values to `[b, h, s, d]` pairs.
pub fn to_standard_layout(
    key: &Tensor,
    value: &Tensor,
    num_heads: usize,
) -> Result<(Tensor, Tensor), AttentionError> {
    let (rows, head_dim, seq) = key.dims3()?;
    if num_heads == 0 || rows % num_heads != 0 {
        return Err(AttentionError::shape(format!(
            "{rows} cache rows are not a multiple of {num_heads} heads"
        )));
    }
    let batch = rows / num_heads;
    let key = key
        .reshape((batch, num_heads, head_dim, seq))?
        .transpose(2, 3)?
        .contiguous()?;
    let value = value.reshape((batch, num_heads, seq, head_dim))?;
    Ok((key, value))
}

/// Inverse of [`to_standard_layout`].
pub fn from_standard_layout(key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
    let (batch, heads, seq, head_dim) = key
        .dims4()
        .map_err(|_| AttentionError::shape("standard key must be [batch, heads, seq, head_dim]"))?;
    if value.dims() != key.dims() {
        return Err(AttentionError::shape(format!(
            "standard key {:?} and value {:?} disagree",
            key.dims(),
            value.dims()
        )));
    }
    let key = key
        .transpose(2, 3)?
        .contiguous()?
        .reshape((batch * heads, head_dim, seq))?;
    let value = value.reshape((batch * heads, seq, head_dim))?;
    Ok((key, value))
}
