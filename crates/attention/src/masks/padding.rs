use candle_core::{DType, Result, Tensor};

/// Expands a `[batch, src_len]` keep-mask (`1` = token, `0` = padding) to a
/// boolean `[batch, 1, tgt_len, src_len]` mask marking the padding.
pub fn expand_padding_mask(attention_mask: &Tensor, tgt_len: usize) -> Result<Tensor> {
    let (batch, src_len) = attention_mask.dims2()?;
    attention_mask
        .to_dtype(DType::F32)?
        .eq(0f32)?
        .reshape((batch, 1, 1, src_len))?
        .broadcast_as((batch, 1, tgt_len, src_len))?
        .contiguous()
}
