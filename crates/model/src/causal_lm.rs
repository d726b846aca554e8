//! Decoder with the tied language-model head.

use std::sync::Arc;

use attention::BloomCache;
use candle_core::Tensor;
use candle_nn::{VarBuilder, VarMap};
use embedding::{LmHead, LM_HEAD_CHUNKS};

use crate::{
    args::ForwardArgs,
    config::{BloomConfig, ModelOptions},
    loss::{CrossEntropyLoss, LossMetrics},
    model::BloomModel,
    parallel::AllReduce,
    ModelError,
};

/// Result of [`BloomForCausalLM::forward`].
#[derive(Debug, Clone)]
pub struct CausalLmOutput {
    /// `[batch, seq, vocab]`
    pub logits: Tensor,
    /// Scalar shifted cross entropy, present when labels were given.
    pub loss: Option<Tensor>,
    pub loss_metrics: Option<LossMetrics>,
    pub hidden_states: Option<Vec<Tensor>>,
    pub attentions: Option<Vec<Tensor>>,
    pub past_len: Option<usize>,
}

#[derive(Debug)]
pub struct BloomForCausalLM {
    transformer: BloomModel,
    lm_head: LmHead,
    loss: CrossEntropyLoss,
}

impl BloomForCausalLM {
    /// Loads from a checkpoint whose tensors may sit under `transformer.`.
    pub fn load(config: BloomConfig, options: ModelOptions, vb: VarBuilder) -> Result<Self, ModelError> {
        let transformer = BloomModel::load(config, options, Self::transformer_scope(vb))?;
        Ok(Self::from_transformer(transformer))
    }

    /// [`BloomForCausalLM::load`] for one rank of a tensor-parallel group.
    pub fn load_with_reduce(
        config: BloomConfig,
        options: ModelOptions,
        reduce: Arc<dyn AllReduce>,
        vb: VarBuilder,
    ) -> Result<Self, ModelError> {
        let transformer =
            BloomModel::load_with_reduce(config, options, reduce, Self::transformer_scope(vb))?;
        Ok(Self::from_transformer(transformer))
    }

    fn transformer_scope(vb: VarBuilder) -> VarBuilder {
        if vb.contains_tensor("transformer.word_embeddings.weight") {
            vb.pp("transformer")
        } else {
            vb
        }
    }

    /// Randomly initialised model; the returned map owns the parameters.
    pub fn random(config: BloomConfig, options: ModelOptions) -> Result<(Self, VarMap), ModelError> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, options.dtype, &options.device);
        let model = Self::load(config, options, vb)?;
        Ok((model, varmap))
    }

    pub fn from_transformer(transformer: BloomModel) -> Self {
        let lm_head = LmHead::tied(transformer.word_embeddings());
        Self {
            transformer,
            lm_head,
            loss: CrossEntropyLoss::new(),
        }
    }

    pub fn transformer(&self) -> &BloomModel {
        &self.transformer
    }

    pub fn config(&self) -> &BloomConfig {
        self.transformer.config()
    }

    pub fn set_training(&mut self, training: bool) {
        self.transformer.set_training(training);
    }

    /// Computes logits in [`LM_HEAD_CHUNKS`] vocabulary chunks from now on.
    pub fn split_lm_head(&mut self) -> Result<(), ModelError> {
        if !self.lm_head.is_split() {
            self.lm_head.split(LM_HEAD_CHUNKS)?;
        }
        Ok(())
    }

    pub fn forward(
        &self,
        args: &ForwardArgs,
        cache: Option<&mut BloomCache>,
    ) -> Result<CausalLmOutput, ModelError> {
        let output = self.transformer.forward(args, cache)?;
        let logits = self
            .lm_head
            .forward(&output.last_hidden_state, self.transformer.policy())?;

        let (loss, loss_metrics) = match &args.labels {
            Some(labels) => {
                let computed = self.loss.shifted(&logits, labels)?;
                (Some(computed.loss), Some(computed.metrics))
            }
            None => (None, None),
        };

        Ok(CausalLmOutput {
            logits,
            loss,
            loss_metrics,
            hidden_states: output.hidden_states,
            attentions: output.attentions,
            past_len: output.past_len,
        })
    }

    /// Arguments for the next decoding step.
    ///
    /// Once the cache holds positions, only the token at `token_idx - 1` (or
    /// the last token) is fed.
    pub fn prepare_inputs_for_generation(
        &self,
        input_ids: &Tensor,
        cache: Option<&BloomCache>,
        attention_mask: Option<Tensor>,
        token_idx: Option<usize>,
    ) -> Result<ForwardArgs, ModelError> {
        let (_, seq) = input_ids.dims2()?;
        let has_past = cache.map(|cache| !cache.is_empty()).unwrap_or(false);
        let input_ids = match (has_past, token_idx) {
            (true, Some(token_idx)) => {
                if token_idx == 0 || token_idx > seq {
                    return Err(ModelError::input(format!(
                        "token_idx {token_idx} outside 1..={seq}"
                    )));
                }
                input_ids.narrow(1, token_idx - 1, 1)?
            }
            (true, None) => {
                let last = seq
                    .checked_sub(1)
                    .ok_or_else(|| ModelError::input("input_ids has no positions to decode from"))?;
                input_ids.narrow(1, last, 1)?
            }
            (false, _) => input_ids.clone(),
        };
        Ok(ForwardArgs {
            input_ids: Some(input_ids),
            attention_mask,
            use_cache: Some(self.config().use_cache),
            token_idx: token_idx.filter(|_| has_past),
            ..ForwardArgs::default()
        })
    }
}
