//! Attention with Linear Biases.
//!
//! Each head `h` adds `slope[h] * j` to the score of key position `j`. Slopes
//! form a geometric sequence starting at `2^(-8 / n)` for a power-of-two head
//! count `n`. Other head counts take the sequence for the closest smaller power
//! of two and append the odd powers of the sequence for twice that count, so
//! every head gets a distinct slope. The full vector is therefore only sorted
//! for power-of-two counts; each of the two runs is strictly decreasing.

use candle_core::{DType, Device, Tensor};

use crate::core::{AttentionError, TensorParallel};

/// First term of the sequence, rounded to `f32` before any power is taken.
fn geometric_base(count: usize) -> f32 {
    let exponent = (count as f64).log2() - 3.0;
    2f64.powf(-(2f64.powf(-exponent))) as f32
}

/// Per-head slopes, exactly `n_head` values in `(0, 1)`.
pub fn alibi_slopes(n_head: usize) -> Result<Vec<f32>, AttentionError> {
    if n_head == 0 {
        return Err(AttentionError::shape("alibi slopes need at least one head"));
    }
    let closest = 1usize << n_head.ilog2();
    let base = geometric_base(closest);
    let mut slopes: Vec<f32> = (1..=closest)
        .map(|power| base.powf(power as f32))
        .collect();

    if closest != n_head {
        let extra_base = geometric_base(2 * closest);
        let remaining = closest.min(n_head - closest);
        slopes.extend(
            (0..remaining).map(|i| extra_base.powf((2 * i + 1) as f32)),
        );
    }
    Ok(slopes)
}

/// [`alibi_slopes`] as an `f32` tensor of shape `[n_head]`.
pub fn alibi_slope_tensor(n_head: usize, device: &Device) -> Result<Tensor, AttentionError> {
    let slopes = alibi_slopes(n_head)?;
    Ok(Tensor::from_vec(slopes, n_head, device)?)
}

/// Builds the bias added to the attention scores of this rank's heads.
///
/// `attention_mask` is `[batch, kv_len]` and only contributes its shape: the
/// bias uses plain key positions `0..kv_len`. The `[num_heads, 1, kv_len]`
/// bias is split into `world_size` equal groups of heads, the group at
/// `rank` is kept and repeated per batch item, giving
/// `[batch * num_heads / world_size, 1, kv_len]` in `dtype`.
pub fn build_alibi_tensor(
    attention_mask: &Tensor,
    slopes: &Tensor,
    num_heads: usize,
    dtype: DType,
    topology: TensorParallel,
) -> Result<Tensor, AttentionError> {
    let (batch, kv_len) = attention_mask
        .dims2()
        .map_err(|_| AttentionError::shape("attention mask must be [batch, kv_len]"))?;
    if slopes.dims() != &[num_heads] {
        return Err(AttentionError::shape(format!(
            "expected {num_heads} slopes, got {:?}",
            slopes.dims()
        )));
    }
    topology.validate_for(num_heads)?;
    let local_heads = topology.local_heads(num_heads);

    let positions = Tensor::arange(0u32, kv_len as u32, slopes.device())?
        .to_dtype(DType::F32)?
        .reshape((1, 1, kv_len))?;
    let alibi = slopes
        .to_dtype(DType::F32)?
        .reshape((num_heads, 1, 1))?
        .broadcast_mul(&positions)?;

    let local = alibi
        .reshape((topology.world_size, local_heads, 1, kv_len))?
        .get(topology.rank)?;
    let repeated = local
        .unsqueeze(0)?
        .broadcast_as((batch, local_heads, 1, kv_len))?
        .reshape((batch * local_heads, 1, kv_len))?;
    Ok(repeated.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_strictly_decreasing(values: &[f32]) -> bool {
        values.windows(2).all(|w| w[0] > w[1])
    }

    #[test]
    fn slope_count_and_range() {
        for n in 1..=64 {
            let slopes = alibi_slopes(n).unwrap();
            assert_eq!(slopes.len(), n);
            assert!(slopes.iter().all(|s| *s > 0.0 && *s < 1.0), "n = {n}");
        }
        assert!(alibi_slopes(0).is_err());
    }

    #[test]
    fn power_of_two_slopes_are_geometric() {
        let slopes = alibi_slopes(8).unwrap();
        let expected: Vec<f32> = (1..=8).map(|i| 0.5f32.powi(i)).collect();
        assert_eq!(slopes, expected);
        for n in [1, 2, 4, 16, 32] {
            assert!(is_strictly_decreasing(&alibi_slopes(n).unwrap()));
        }
    }

    #[test]
    fn extra_slopes_decrease_within_their_sequence() {
        let slopes = alibi_slopes(12).unwrap();
        let (base, extra) = slopes.split_at(8);
        assert!(is_strictly_decreasing(base));
        assert!(is_strictly_decreasing(extra));
        let first_extra = 2f32.powf(-0.5);
        assert!((extra[0] - first_extra).abs() < 1e-6);
        assert!((extra[1] - first_extra.powi(3)).abs() < 1e-6);
    }

    #[test]
    fn powers_are_taken_in_single_precision() {
        let base = 2f64.powf(-1.0) as f32;
        let extra_base = 2f64.powf(-0.5) as f32;
        let slopes = alibi_slopes(12).unwrap();
        let expected: Vec<f32> = (1..=8)
            .map(|p| base.powf(p as f32))
            .chain([1, 3, 5, 7].map(|p| extra_base.powf(p as f32)))
            .collect();
        assert_eq!(slopes, expected);
    }

    #[test]
    fn bias_is_slope_times_position() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let slopes = alibi_slope_tensor(4, &device)?;
        let mask = Tensor::new(&[[1u32, 1, 1], [0, 1, 1]], &device)?;
        let alibi = build_alibi_tensor(&mask, &slopes, 4, DType::F32, TensorParallel::single())?;
        assert_eq!(alibi.dims(), &[8, 1, 3]);

        let values = alibi.to_vec3::<f32>()?;
        let raw = alibi_slopes(4)?;
        for b in 0..2 {
            for h in 0..4 {
                for j in 0..3 {
                    let expected = raw[h] * j as f32;
                    assert!((values[b * 4 + h][0][j] - expected).abs() < 1e-7);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn rank_selects_its_head_group() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let slopes = alibi_slope_tensor(8, &device)?;
        let mask = Tensor::ones((3, 5), DType::U32, &device)?;
        let full = build_alibi_tensor(&mask, &slopes, 8, DType::F32, TensorParallel::single())?
            .reshape((3, 8, 1, 5))?;

        let world = 4;
        for rank in 0..world {
            let shard = build_alibi_tensor(
                &mask,
                &slopes,
                8,
                DType::F32,
                TensorParallel::new(rank, world),
            )?;
            assert_eq!(shard.dims(), &[3 * 2, 1, 5]);
            let expected = full.narrow(1, rank * 2, 2)?.reshape((6, 1, 5))?;
            let diff = shard.sub(&expected)?.abs()?.flatten_all()?.max(0)?;
            assert_eq!(diff.to_vec0::<f32>()?, 0.0);
        }

        let bad = build_alibi_tensor(&mask, &slopes, 8, DType::F32, TensorParallel::new(0, 3));
        assert!(matches!(bad, Err(AttentionError::InvalidTopology { .. })));
        Ok(())
    }
}
