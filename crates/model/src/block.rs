use std::sync::Arc;

use attention::LayerCache;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{checks, LayerNorm, NormConfig, PrecisionPolicy};

use crate::{
    config::{BloomConfig, TensorParallel},
    mlp::BloomMlp,
    parallel::AllReduce,
    self_attention::BloomAttention,
    ModelError,
};

/// Per-call state shared by every layer of one forward pass.
#[derive(Debug, Clone, Copy)]
pub struct LayerInputs<'a> {
    /// `[batch * local_heads, 1, kv_len]`
    pub alibi: &'a Tensor,
    /// Boolean `[batch, 1, q_len, kv_len]`.
    pub mask: &'a Tensor,
    /// This layer's head mask, broadcastable to `[batch, heads, q, kv]`.
    pub head_mask: Option<&'a Tensor>,
    pub use_cache: bool,
    pub output_attentions: bool,
    pub token_idx: Option<usize>,
    pub training: bool,
}

/// Pre-norm decoder layer.
#[derive(Debug)]
pub struct BloomBlock {
    input_layernorm: LayerNorm,
    self_attention: BloomAttention,
    post_attention_layernorm: LayerNorm,
    mlp: BloomMlp,
    residual_post_layernorm: bool,
    policy: PrecisionPolicy,
}

impl BloomBlock {
    pub fn load(
        config: &BloomConfig,
        topology: TensorParallel,
        reduce: Arc<dyn AllReduce>,
        policy: PrecisionPolicy,
        vb: VarBuilder,
    ) -> Result<Self, ModelError> {
        let norm = NormConfig::new(config.hidden_size, config.layer_norm_epsilon);
        Ok(Self {
            input_layernorm: LayerNorm::load(norm, vb.pp("input_layernorm"))?,
            self_attention: BloomAttention::load(
                config,
                topology,
                reduce.clone(),
                policy,
                vb.pp("self_attention"),
            )?,
            post_attention_layernorm: LayerNorm::load(norm, vb.pp("post_attention_layernorm"))?,
            mlp: BloomMlp::load(config, topology, reduce, policy, vb.pp("mlp"))?,
            residual_post_layernorm: config.apply_residual_connection_post_layernorm,
            policy,
        })
    }

    /// Returns the layer output and, when requested, its attention probabilities.
    pub fn forward(
        &self,
        hidden: &Tensor,
        inputs: &LayerInputs<'_>,
        cache: Option<&mut LayerCache>,
    ) -> Result<(Tensor, Option<Tensor>), ModelError> {
        checks::expect_batch_seq_hidden("block.hidden", hidden, self.input_layernorm.config().hidden_size)?;
        let normed = self.input_layernorm.forward(hidden, &self.policy)?;
        let residual = if self.residual_post_layernorm {
            &normed
        } else {
            hidden
        };
        let (attended, probs) = self.self_attention.forward(&normed, residual, inputs, cache)?;

        let normed = self.post_attention_layernorm.forward(&attended, &self.policy)?;
        let residual = if self.residual_post_layernorm {
            &normed
        } else {
            &attended
        };
        let output = self.mlp.forward(&normed, residual, inputs.training)?;
        Ok((output, probs))
    }
}
