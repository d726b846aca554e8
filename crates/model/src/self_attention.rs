//! Self-attention of one decoder layer.

use std::sync::Arc;

use attention::{
    Attention, AlibiAttention, AttentionInputs, Config as KernelConfig, KeyValueCache, LayerCache,
};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{dropout_add, Linear, LinearConfig, PrecisionPolicy};

use crate::{
    block::LayerInputs,
    config::{BloomConfig, TensorParallel},
    parallel::{load_column_parallel, load_row_parallel, AllReduce},
    ModelError,
};

#[derive(Debug)]
pub struct BloomAttention {
    /// Heads on this rank.
    num_heads: usize,
    head_dim: usize,
    pretraining_tp: usize,
    slow_but_exact: bool,
    hidden_dropout: f32,
    query_key_value: Linear,
    dense: Linear,
    kernel: AlibiAttention,
    reduce: Arc<dyn AllReduce>,
    policy: PrecisionPolicy,
}

impl BloomAttention {
    pub fn load(
        config: &BloomConfig,
        topology: TensorParallel,
        reduce: Arc<dyn AllReduce>,
        policy: PrecisionPolicy,
        vb: VarBuilder,
    ) -> Result<Self, ModelError> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let num_heads = topology.local_heads(config.n_head);
        let query_key_value = load_column_parallel(
            LinearConfig::new(hidden, 3 * hidden),
            config.initializer_range,
            topology,
            vb.pp("query_key_value"),
        )?;
        let dense = load_row_parallel(
            LinearConfig::new(hidden, hidden),
            config.initializer_range,
            topology,
            vb.pp("dense"),
        )?;
        let kernel = AlibiAttention::new(
            KernelConfig::new(num_heads, head_dim).with_dropout(config.attention_dropout),
        )?;
        Ok(Self {
            num_heads,
            head_dim,
            pretraining_tp: config.pretraining_tp,
            slow_but_exact: config.slow_but_exact,
            hidden_dropout: config.hidden_dropout,
            query_key_value,
            dense,
            kernel,
            reduce,
            policy,
        })
    }

    /// Splits the fused projection `[b, q, heads * 3 * d]` into
    /// query `[b*h, q, d]`, key `[b*h, d, q]` and value `[b*h, q, d]`.
    fn split_heads(&self, fused: &Tensor) -> Result<(Tensor, Tensor, Tensor), ModelError> {
        let (batch, q_len, _) = fused.dims3()?;
        let (h, d) = (self.num_heads, self.head_dim);
        let fused = fused.reshape((batch, q_len, h, 3, d))?;
        let part = |i: usize| fused.narrow(3, i, 1).and_then(|t| t.squeeze(3));

        let query = part(0)?.transpose(1, 2)?.reshape((batch * h, q_len, d))?;
        let key = part(1)?.permute((0, 2, 3, 1))?.reshape((batch * h, d, q_len))?;
        let value = part(2)?.transpose(1, 2)?.reshape((batch * h, q_len, d))?;
        Ok((query, key, value))
    }

    /// `[b*h, q, d]` back to `[b, q, h*d]`.
    fn merge_heads(&self, context: &Tensor) -> Result<Tensor, ModelError> {
        let (rows, q_len, d) = context.dims3()?;
        let batch = rows / self.num_heads;
        Ok(context
            .reshape((batch, self.num_heads, q_len, d))?
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * d))?)
    }

    /// Returns the new hidden state (residual included) and, when requested,
    /// the attention probabilities `[b, h, q, kv]`.
    ///
    /// With `token_idx` the new key/value are written in place at
    /// `token_idx - 1` and attention runs over the whole cache buffer. With
    /// `use_cache` they are appended. Otherwise a cached prefix, if any, is
    /// only concatenated for this call.
    pub fn forward(
        &self,
        hidden: &Tensor,
        residual: &Tensor,
        inputs: &LayerInputs<'_>,
        cache: Option<&mut LayerCache>,
    ) -> Result<(Tensor, Option<Tensor>), ModelError> {
        let fused = self.query_key_value.forward(hidden, &self.policy)?;
        let (query, key, value) = self.split_heads(&fused)?;

        let (key, value) = match (cache, inputs.token_idx) {
            (Some(cache), Some(token_idx)) => {
                let position = token_idx
                    .checked_sub(1)
                    .ok_or_else(|| ModelError::input("token_idx is 1-based"))?;
                cache.write_at(position, &key, &value)?
            }
            (Some(cache), None) if inputs.use_cache => cache.append(&key, &value)?,
            (Some(cache), None) => match cache.view()? {
                Some((past_key, past_value)) => (
                    Tensor::cat(&[&past_key, &key], 2)?,
                    Tensor::cat(&[&past_value, &value], 1)?,
                ),
                None => (key, value),
            },
            (None, Some(_)) => return Err(ModelError::input("token_idx requires a kv cache")),
            (None, None) => (key, value),
        };

        let output = self.kernel.attend(
            &AttentionInputs {
                query: &query,
                key: &key,
                value: &value,
                alibi: inputs.alibi,
                mask: inputs.mask,
                head_mask: inputs.head_mask,
            },
            inputs.training,
        )?;
        let context = self.merge_heads(&output.context)?;

        // The chunked projection sums weight slices only and never adds the bias.
        let projected = if self.pretraining_tp > 1 && self.slow_but_exact {
            let partial = self
                .dense
                .forward_sliced_no_bias(&context, self.pretraining_tp, &self.policy)?;
            self.reduce.all_reduce_sum(&partial)?
        } else {
            let partial = self.dense.forward_no_bias(&context, &self.policy)?;
            self.dense.add_bias(&self.reduce.all_reduce_sum(&partial)?, &self.policy)?
        };
        let hidden = dropout_add(
            &projected,
            residual,
            self.hidden_dropout,
            inputs.training,
            &self.policy,
        )?;
        let probs = inputs.output_attentions.then_some(output.probs);
        Ok((hidden, probs))
    }
}
