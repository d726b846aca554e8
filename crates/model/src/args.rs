//! Inputs of a forward call.

use std::collections::BTreeMap;

use candle_core::Tensor;
use runtime::NestedTensors;

use crate::ModelError;

/// Arguments accepted by [`crate::BloomModel::forward`] and
/// [`crate::BloomForCausalLM::forward`].
///
/// `None` for the boolean switches means "use the configuration default".
/// `extra` collects named arguments that have no dedicated field; only the
/// deprecated `position_ids` is tolerated there.
#[derive(Debug, Clone, Default)]
pub struct ForwardArgs {
    /// `[batch, seq]` integer token ids.
    pub input_ids: Option<Tensor>,
    /// `[batch, seq, hidden]`, mutually exclusive with `input_ids`.
    pub inputs_embeds: Option<Tensor>,
    /// `[batch, kv_len]` with `1` for tokens that may be attended to.
    pub attention_mask: Option<Tensor>,
    /// `[n_head]` or `[n_layer, n_head]` multiplicative head mask.
    pub head_mask: Option<Tensor>,
    /// `[batch, seq]` targets, `-100` marks ignored positions.
    pub labels: Option<Tensor>,
    pub use_cache: Option<bool>,
    pub output_attentions: Option<bool>,
    pub output_hidden_states: Option<bool>,
    /// 1-based position of the single new token in a preallocated cache.
    pub token_idx: Option<usize>,
    pub extra: BTreeMap<String, NestedTensors>,
}

impl ForwardArgs {
    pub fn from_input_ids(input_ids: Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Self::default()
        }
    }

    pub fn from_inputs_embeds(inputs_embeds: Tensor) -> Self {
        Self {
            inputs_embeds: Some(inputs_embeds),
            ..Self::default()
        }
    }

    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn with_head_mask(mut self, head_mask: Tensor) -> Self {
        self.head_mask = Some(head_mask);
        self
    }

    pub fn with_labels(mut self, labels: Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = Some(use_cache);
        self
    }

    pub fn with_output_attentions(mut self, enabled: bool) -> Self {
        self.output_attentions = Some(enabled);
        self
    }

    pub fn with_output_hidden_states(mut self, enabled: bool) -> Self {
        self.output_hidden_states = Some(enabled);
        self
    }

    pub fn with_token_idx(mut self, token_idx: usize) -> Self {
        self.token_idx = Some(token_idx);
        self
    }

    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<NestedTensors>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// Rejects unknown named arguments; `position_ids` only warns.
    pub fn check_extra(&self) -> Result<(), ModelError> {
        let mut unexpected = Vec::new();
        for name in self.extra.keys() {
            if name == "position_ids" {
                log::warn!(
                    "`position_ids` have no functionality in BLOOM and will be removed in a future release; you can safely stop passing them"
                );
            } else {
                unexpected.push(name.clone());
            }
        }
        if unexpected.is_empty() {
            Ok(())
        } else {
            Err(ModelError::UnexpectedArguments(unexpected))
        }
    }

    /// The token ids or embeddings, exactly one of which must be set.
    pub(crate) fn input(&self) -> Result<ModelInput<'_>, ModelError> {
        match (&self.input_ids, &self.inputs_embeds) {
            (Some(_), Some(_)) => Err(ModelError::input(
                "cannot specify both input_ids and inputs_embeds at the same time",
            )),
            (Some(ids), None) => Ok(ModelInput::Ids(ids)),
            (None, Some(embeds)) => Ok(ModelInput::Embeds(embeds)),
            (None, None) => Err(ModelError::input(
                "either input_ids or inputs_embeds must be specified",
            )),
        }
    }
}

pub(crate) enum ModelInput<'a> {
    Ids(&'a Tensor),
    Embeds(&'a Tensor),
}
