//! Boolean attention masks.
//!
//! Every mask produced here has dtype [`MASK_DTYPE`] (`u8`) and shape
//! `[batch, 1, q_len, kv_len]`; `1` marks a score that must be discarded. The
//! kernel broadcasts the head axis and applies [`masked_fill`].

pub mod causal;
pub mod padding;

use candle_core::{DType, Result, Tensor};

/// Dtype shared by all boolean masks.
pub const MASK_DTYPE: DType = DType::U8;

pub use causal::make_causal_mask;
pub use padding::expand_padding_mask;

/// Combines padding and causal masking for a forward call.
///
/// `attention_mask` is `[batch, past_len + seq]` with `1` for real tokens.
/// The causal part is only built when more than one query is processed; a
/// single query may see every unpadded key.
pub fn prepare_attention_mask(
    attention_mask: &Tensor,
    input_shape: (usize, usize),
    past_len: usize,
) -> Result<Tensor> {
    let (batch, seq) = input_shape;
    let expanded = expand_padding_mask(attention_mask, seq)?;
    if seq <= 1 {
        return Ok(expanded);
    }
    let causal = make_causal_mask(batch, seq, past_len, attention_mask.device())?;
    if causal.dims() != expanded.dims() {
        candle_core::bail!(
            "attention mask covers {:?} keys but {} past + {} new tokens were given",
            attention_mask.dims(),
            past_len,
            seq
        );
    }
    // logical or on {0, 1}
    expanded.maximum(&causal)
}

/// Replaces every masked score with `value`.
///
/// `mask` must broadcast to `scores` (typically `[batch, 1, q, kv]` against
/// `[batch, heads, q, kv]`).
pub fn masked_fill(scores: &Tensor, mask: &Tensor, value: f64) -> Result<Tensor> {
    let shape = scores.shape();
    let fill = Tensor::new(value, scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(shape)?;
    mask.broadcast_as(shape)?.where_cond(&fill, scores)
}

/// Most negative finite value representable in `dtype`.
pub fn dtype_min(dtype: DType) -> Result<f64> {
    Ok(match dtype {
        DType::F16 => -65504.0,
        DType::BF16 => -3.389_531_389_251_535_5e38,
        DType::F32 => f32::MIN as f64,
        DType::F64 => f64::MIN,
        other => candle_core::bail!("no finite minimum for non-float dtype {other:?}"),
    })
}

#[cfg(test)]
mod tests;
