use candle_core::{Device, Result, Tensor};

/// `[batch, 1, tgt_len, past_len + tgt_len]` causal mask.
///
/// Cached positions are always visible. Within the new window, query `i`
/// cannot see key `past_len + j` for `j > i`.
pub fn make_causal_mask(
    batch: usize,
    tgt_len: usize,
    past_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let kv_len = past_len + tgt_len;
    let row: Vec<u8> = (0..tgt_len)
        .flat_map(|i| (0..kv_len).map(move |j| u8::from(j > past_len + i)))
        .collect();
    Tensor::from_vec(row, (1, 1, tgt_len, kv_len), device)?
        .broadcast_as((batch, 1, tgt_len, kv_len))?
        .contiguous()
}
