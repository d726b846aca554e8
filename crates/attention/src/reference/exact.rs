//! Reference ALiBi kernel.
//!
//! For every fused batch-head row:
//!
//! ```text
//! scores = beta * alibi + inv_norm_factor * (query @ key)
//! probs  = softmax_f32(masked_fill(scores, mask, dtype_min))
//! context = dropout(probs) * head_mask @ value
//! ```

use std::sync::OnceLock;

use candle_core::DType;
use candle_nn::ops::softmax_last_dim;
use layers::Dropout;

use crate::core::{Attention, AttentionError, AttentionInputs, AttentionOutput, Config};
use crate::masks::{dtype_min, masked_fill, MASK_DTYPE};

/// ALiBi attention over caller-provided keys and values.
#[derive(Debug)]
pub struct AlibiAttention {
    config: Config,
    dropout: Dropout,
    first_call: OnceLock<()>,
}

impl AlibiAttention {
    pub fn new(config: Config) -> Result<Self, AttentionError> {
        if config.num_heads == 0 || config.head_dim == 0 {
            return Err(AttentionError::shape(format!(
                "attention needs heads and head_dim, got {config:?}"
            )));
        }
        let dropout = Dropout::new(config.dropout_p)?;
        Ok(Self {
            config,
            dropout,
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Checks the fused-head layout and returns `(batch, q_len, kv_len)`.
    fn validate(&self, inputs: &AttentionInputs<'_>) -> Result<(usize, usize, usize), AttentionError> {
        let heads = self.config.num_heads;
        let head_dim = self.config.head_dim;
        let (rows, q_len, qd) = inputs
            .query
            .dims3()
            .map_err(|_| AttentionError::shape("query must be [batch * heads, q_len, head_dim]"))?;
        let (kr, kd, kv_len) = inputs
            .key
            .dims3()
            .map_err(|_| AttentionError::shape("key must be [batch * heads, head_dim, kv_len]"))?;
        let (vr, vk, vd) = inputs
            .value
            .dims3()
            .map_err(|_| AttentionError::shape("value must be [batch * heads, kv_len, head_dim]"))?;

        if rows % heads != 0 || qd != head_dim {
            return Err(AttentionError::shape(format!(
                "query {:?} does not match {heads} heads of size {head_dim}",
                inputs.query.dims()
            )));
        }
        if kr != rows || kd != head_dim || vr != rows || vk != kv_len || vd != head_dim {
            return Err(AttentionError::shape(format!(
                "key {:?} / value {:?} do not match query {:?}",
                inputs.key.dims(),
                inputs.value.dims(),
                inputs.query.dims()
            )));
        }
        if inputs.alibi.dims() != &[rows, 1, kv_len] {
            return Err(AttentionError::shape(format!(
                "alibi {:?} should be [{rows}, 1, {kv_len}]",
                inputs.alibi.dims()
            )));
        }
        let batch = rows / heads;
        if inputs.mask.dims() != &[batch, 1, q_len, kv_len] {
            return Err(AttentionError::shape(format!(
                "mask {:?} should be [{batch}, 1, {q_len}, {kv_len}]",
                inputs.mask.dims()
            )));
        }
        if inputs.mask.dtype() != MASK_DTYPE {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("mask dtype {:?}, expected {MASK_DTYPE:?}", inputs.mask.dtype()),
            });
        }
        Ok((batch, q_len, kv_len))
    }
}

impl Attention for AlibiAttention {
    fn attend(
        &self,
        inputs: &AttentionInputs<'_>,
        training: bool,
    ) -> Result<AttentionOutput, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::alibi init heads={} head_dim={} dropout={} beta={}",
                self.config.num_heads,
                self.config.head_dim,
                self.config.dropout_p,
                self.config.beta
            );
        }

        let dtype = inputs.query.dtype();
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        let (batch, q_len, kv_len) = self.validate(inputs)?;
        let heads = self.config.num_heads;

        let key = inputs.key.to_dtype(dtype)?.contiguous()?;
        let value = inputs.value.to_dtype(dtype)?.contiguous()?;
        let query = inputs.query.contiguous()?;

        // baddbmm
        let product = (query.matmul(&key)? * self.config.inv_norm_factor())?;
        let bias = inputs.alibi.to_dtype(dtype)?;
        let bias = if self.config.beta == 1.0 {
            bias
        } else {
            (bias * self.config.beta)?
        };
        let scores = product
            .broadcast_add(&bias)?
            .reshape((batch, heads, q_len, kv_len))?;

        let filled = masked_fill(&scores, inputs.mask, dtype_min(dtype)?)?;
        let probs = softmax_last_dim(&filled.to_dtype(DType::F32)?)?.to_dtype(dtype)?;
        let probs = self.dropout.forward(&probs, training)?;
        let probs = match inputs.head_mask {
            Some(head_mask) => probs.broadcast_mul(&head_mask.to_dtype(dtype)?)?,
            None => probs,
        };

        let context = probs
            .reshape((batch * heads, q_len, kv_len))?
            .matmul(&value)?;
        Ok(AttentionOutput { context, probs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alibi::{alibi_slope_tensor, build_alibi_tensor};
    use crate::core::TensorParallel;
    use crate::masks::prepare_attention_mask;
    use candle_core::{Device, Result as CandleResult, Tensor};

    const HEADS: usize = 2;
    const HEAD_DIM: usize = 4;

    struct Case {
        query: Tensor,
        key: Tensor,
        value: Tensor,
        alibi: Tensor,
        mask: Tensor,
    }

    fn build_case(device: &Device, keep: &[u32]) -> CandleResult<Case> {
        let seq = keep.len();
        let data = |offset: f32, n: usize| -> Vec<f32> {
            (0..n).map(|i| ((i as f32) * 0.37 + offset).sin()).collect()
        };
        let rows = HEADS;
        let query = Tensor::from_vec(data(0.1, rows * seq * HEAD_DIM), (rows, seq, HEAD_DIM), device)?;
        let key = Tensor::from_vec(data(0.7, rows * HEAD_DIM * seq), (rows, HEAD_DIM, seq), device)?;
        let value = Tensor::from_vec(data(1.3, rows * seq * HEAD_DIM), (rows, seq, HEAD_DIM), device)?;
        let keep = Tensor::from_vec(keep.to_vec(), (1, seq), device)?;
        let slopes = alibi_slope_tensor(HEADS, device).map_err(candle_core::Error::wrap)?;
        let alibi = build_alibi_tensor(&keep, &slopes, HEADS, DType::F32, TensorParallel::single())
            .map_err(candle_core::Error::wrap)?;
        let mask = prepare_attention_mask(&keep, (1, seq), 0)?;
        Ok(Case {
            query,
            key,
            value,
            alibi,
            mask,
        })
    }

    fn inputs(case: &Case) -> AttentionInputs<'_> {
        AttentionInputs {
            query: &case.query,
            key: &case.key,
            value: &case.value,
            alibi: &case.alibi,
            mask: &case.mask,
            head_mask: None,
        }
    }

    /// Scalar loop over the same formula.
    fn naive(case: &Case) -> CandleResult<Vec<f32>> {
        let q = case.query.to_vec3::<f32>()?;
        let k = case.key.to_vec3::<f32>()?;
        let v = case.value.to_vec3::<f32>()?;
        let alibi = case.alibi.to_vec3::<f32>()?;
        let mask = case.mask.get(0)?.get(0)?.to_vec2::<u8>()?;
        let seq = q[0].len();
        let scale = 1.0 / (HEAD_DIM as f32).sqrt();
        let mut out = Vec::new();
        for h in 0..HEADS {
            for i in 0..seq {
                let scores: Vec<f32> = (0..seq)
                    .map(|j| {
                        if mask[i][j] == 1 {
                            return f32::MIN;
                        }
                        let dot: f32 = (0..HEAD_DIM).map(|d| q[h][i][d] * k[h][d][j]).sum();
                        alibi[h][0][j] + scale * dot
                    })
                    .collect();
                let max = scores.iter().copied().fold(f32::MIN, f32::max);
                let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
                let denom: f32 = exp.iter().sum();
                for d in 0..HEAD_DIM {
                    out.push((0..seq).map(|j| exp[j] / denom * v[h][j][d]).sum());
                }
            }
        }
        Ok(out)
    }

    #[test]
    fn alibi_attention_matches_naive() -> anyhow::Result<()> {
        let case = build_case(&Device::Cpu, &[1, 1, 1, 1, 1])?;
        let attention = AlibiAttention::new(Config::new(HEADS, HEAD_DIM))?;
        let output = attention.attend(&inputs(&case), false)?;
        assert_eq!(output.context.dims(), &[HEADS, 5, HEAD_DIM]);
        assert_eq!(output.probs.dims(), &[1, HEADS, 5, 5]);

        let got = output.context.flatten_all()?.to_vec1::<f32>()?;
        for (a, b) in got.iter().zip(naive(&case)?) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
        Ok(())
    }

    #[test]
    fn masked_keys_get_zero_probability() -> anyhow::Result<()> {
        let case = build_case(&Device::Cpu, &[0, 1, 1, 1])?;
        let attention = AlibiAttention::new(Config::new(HEADS, HEAD_DIM))?;
        let probs = attention.attend(&inputs(&case), false)?.probs;
        let rows = probs.get(0)?.get(1)?.to_vec2::<f32>()?;
        for (i, row) in rows.iter().enumerate().skip(1) {
            assert_eq!(row[0], 0.0);
            for (j, p) in row.iter().enumerate() {
                if j > i {
                    assert_eq!(*p, 0.0);
                }
            }
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn head_mask_zeroes_a_head() -> anyhow::Result<()> {
        let case = build_case(&Device::Cpu, &[1, 1, 1])?;
        let head_mask = Tensor::new(&[1f32, 0.0], &Device::Cpu)?.reshape((1, HEADS, 1, 1))?;
        let attention = AlibiAttention::new(Config::new(HEADS, HEAD_DIM))?;
        let output = attention.attend(
            &AttentionInputs {
                head_mask: Some(&head_mask),
                ..inputs(&case)
            },
            false,
        )?;
        let silenced = output.context.get(1)?.abs()?.flatten_all()?.max(0)?;
        assert_eq!(silenced.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() -> anyhow::Result<()> {
        let case = build_case(&Device::Cpu, &[1, 1, 1])?;
        let wrong_key = case.key.narrow(2, 0, 2)?;
        let attention = AlibiAttention::new(Config::new(HEADS, HEAD_DIM))?;
        let err = attention
            .attend(
                &AttentionInputs {
                    key: &wrong_key,
                    ..inputs(&case)
                },
                false,
            )
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
        Ok(())
    }

    #[test]
    fn reduced_precision_stays_close() -> anyhow::Result<()> {
        let case = build_case(&Device::Cpu, &[1, 1, 1, 1])?;
        let attention = AlibiAttention::new(Config::new(HEADS, HEAD_DIM))?;
        let reference = attention.attend(&inputs(&case), false)?.context;
        for dtype in [DType::F16, DType::BF16] {
            let cast = Case {
                query: case.query.to_dtype(dtype)?,
                key: case.key.to_dtype(dtype)?,
                value: case.value.to_dtype(dtype)?,
                alibi: case.alibi.to_dtype(dtype)?,
                mask: case.mask.clone(),
            };
            let out = attention.attend(&inputs(&cast), false)?.context;
            assert_eq!(out.dtype(), dtype);
            let diff = out
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .flatten_all()?
                .max(0)?
                .to_vec0::<f32>()?;
            assert!(diff < 5e-2, "{dtype:?} diverged by {diff}");
        }
        Ok(())
    }
}
