use std::sync::Arc;

use attention::{
    alibi_slope_tensor, build_alibi_tensor, masks::prepare_attention_mask, BloomCache,
    CacheLayout,
};
use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use embedding::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{LayerNorm, NormConfig, PrecisionPolicy};

use crate::{
    args::{ForwardArgs, ModelInput},
    block::{BloomBlock, LayerInputs},
    config::{BloomConfig, ModelOptions},
    parallel::{AllReduce, LocalReduce},
    ModelError,
};

/// Result of [`BloomModel::forward`].
#[derive(Debug, Clone)]
pub struct BloomModelOutput {
    /// `[batch, seq, hidden]` after the final layer norm.
    pub last_hidden_state: Tensor,
    /// Input of every layer followed by the final output.
    pub hidden_states: Option<Vec<Tensor>>,
    /// `[batch, heads, seq, kv_len]` per layer.
    pub attentions: Option<Vec<Tensor>>,
    /// Positions held by the cache after the call.
    pub past_len: Option<usize>,
}

/// BLOOM decoder stack without the language-model head.
#[derive(Debug)]
pub struct BloomModel {
    config: BloomConfig,
    options: ModelOptions,
    word_embeddings: TokenEmbedding,
    word_embeddings_layernorm: LayerNorm,
    h: Vec<BloomBlock>,
    ln_f: LayerNorm,
    slopes: Tensor,
    policy: PrecisionPolicy,
    training: bool,
}

impl BloomModel {
    /// Loads every parameter from `vb` with the upstream names.
    ///
    /// Runs a single rank only: a multi-rank topology would leave the
    /// row-parallel projections as partial sums.
    pub fn load(config: BloomConfig, options: ModelOptions, vb: VarBuilder) -> Result<Self, ModelError> {
        let world_size = options.tensor_parallel.world_size;
        if world_size > 1 {
            log::error!(
                "refusing to load rank {} of {world_size} without a cross-rank reduction",
                options.tensor_parallel.rank
            );
            return Err(ModelError::MissingReduction { world_size });
        }
        Self::load_with_reduce(config, options, Arc::new(LocalReduce), vb)
    }

    /// Same as [`BloomModel::load`] with a custom cross-rank reduction.
    pub fn load_with_reduce(
        config: BloomConfig,
        options: ModelOptions,
        reduce: Arc<dyn AllReduce>,
        vb: VarBuilder,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        let topology = options.tensor_parallel;
        config.validate_topology(topology)?;
        let policy = PrecisionPolicy::from_parameter_dtype(options.dtype);
        let norm = NormConfig::new(config.hidden_size, config.layer_norm_epsilon);

        let word_embeddings = TokenEmbedding::load(
            TokenEmbeddingConfig {
                vocab_size: config.vocab_size,
                hidden_dim: config.hidden_size,
            },
            config.initializer_range,
            vb.pp("word_embeddings"),
        )?;
        let word_embeddings_layernorm = LayerNorm::load(norm, vb.pp("word_embeddings_layernorm"))?;
        let h = (0..config.n_layer)
            .map(|i| BloomBlock::load(&config, topology, reduce.clone(), policy, vb.pp(format!("h.{i}"))))
            .collect::<Result<Vec<_>, _>>()?;
        let ln_f = LayerNorm::load(norm, vb.pp("ln_f"))?;
        let slopes = alibi_slope_tensor(config.n_head, &options.device)?;

        log::info!(
            "bloom init: layers={} hidden={} heads={} vocab={} dtype={:?} rank={}/{}",
            config.n_layer,
            config.hidden_size,
            config.n_head,
            config.vocab_size,
            options.dtype,
            topology.rank,
            topology.world_size
        );
        Ok(Self {
            config,
            options,
            word_embeddings,
            word_embeddings_layernorm,
            h,
            ln_f,
            slopes,
            policy,
            training: false,
        })
    }

    pub fn config(&self) -> &BloomConfig {
        &self.config
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn word_embeddings(&self) -> &TokenEmbedding {
        &self.word_embeddings
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Buffer layout for a preallocated cache holding `max_seq_len` positions.
    pub fn cache_layout(&self, batch: usize, max_seq_len: usize) -> CacheLayout {
        CacheLayout {
            batch,
            num_heads: self.options.tensor_parallel.local_heads(self.config.n_head),
            head_dim: self.config.head_dim(),
            max_seq_len,
            dtype: self.options.dtype,
            device: self.options.device.clone(),
        }
    }

    /// Expands `[n_head]` or `[n_layer, n_head]` into one `[1, heads, 1, 1]`
    /// mask per layer, restricted to this rank's heads.
    fn layer_head_masks(&self, head_mask: Option<&Tensor>) -> Result<Vec<Option<Tensor>>, ModelError> {
        let n_layer = self.config.n_layer;
        let Some(head_mask) = head_mask else {
            return Ok(vec![None; n_layer]);
        };
        let n_head = self.config.n_head;
        let per_layer = match head_mask.dims() {
            [heads] if *heads == n_head => head_mask
                .unsqueeze(0)?
                .broadcast_as((n_layer, n_head))?
                .contiguous()?,
            [layers, heads] if *layers == n_layer && *heads == n_head => head_mask.clone(),
            dims => {
                return Err(ModelError::input(format!(
                    "head_mask must be [{n_head}] or [{n_layer}, {n_head}], got {dims:?}"
                )))
            }
        };
        let topology = self.options.tensor_parallel;
        let local = topology.local_heads(n_head);
        let per_layer = per_layer
            .narrow(1, topology.rank * local, local)?
            .to_dtype(self.options.dtype)?;
        (0..n_layer)
            .map(|i| Ok(Some(per_layer.get(i)?.reshape((1, local, 1, 1))?)))
            .collect()
    }

    fn embed(&self, args: &ForwardArgs) -> Result<Tensor, ModelError> {
        match args.input()? {
            ModelInput::Ids(ids) => Ok(self.word_embeddings.forward(ids)?),
            ModelInput::Embeds(embeds) => match embeds.dims() {
                [_, seq, hidden] if *seq > 0 && *hidden == self.config.hidden_size => {
                    Ok(embeds.to_dtype(self.options.dtype)?)
                }
                dims => Err(ModelError::input(format!(
                    "inputs_embeds must be [batch, seq, {}], got {dims:?}",
                    self.config.hidden_size
                ))),
            },
        }
    }

    /// `[batch, capacity]` keep-mask covering positions `0..token_idx`.
    fn token_idx_mask(&self, batch: usize, capacity: usize, token_idx: usize) -> Result<Tensor, ModelError> {
        Ok(Tensor::arange(0u32, capacity as u32, &self.options.device)?
            .lt(token_idx as u32)?
            .unsqueeze(0)?
            .broadcast_as((batch, capacity))?
            .contiguous()?)
    }

    /// Runs the decoder stack.
    ///
    /// With a cache, new keys and values are appended (`use_cache`) or, when
    /// `token_idx` is set, written in place at `token_idx - 1`. The in-place
    /// path needs a preallocated cache and exactly one new token; the
    /// attention mask then spans the whole cache capacity.
    pub fn forward(
        &self,
        args: &ForwardArgs,
        mut cache: Option<&mut BloomCache>,
    ) -> Result<BloomModelOutput, ModelError> {
        args.check_extra()?;
        let output_attentions = args.output_attentions.unwrap_or(self.config.output_attentions);
        let output_hidden_states = args
            .output_hidden_states
            .unwrap_or(self.config.output_hidden_states);
        let mut use_cache = args.use_cache.unwrap_or(self.config.use_cache);

        let embeds = self.embed(args)?;
        let (batch, seq, _) = embeds.dims3()?;

        if use_cache && self.training && self.options.gradient_checkpointing {
            log::warn!("`use_cache` is incompatible with gradient checkpointing, disabling the cache");
            use_cache = false;
        }

        if let Some(cache) = cache.as_deref() {
            if cache.num_layers() != self.config.n_layer {
                return Err(ModelError::input(format!(
                    "cache has {} layers, model has {}",
                    cache.num_layers(),
                    self.config.n_layer
                )));
            }
        }
        let past_len = cache.as_deref().map(BloomCache::past_len).unwrap_or(0);
        let kv_len = match args.token_idx {
            Some(token_idx) => {
                if seq != 1 {
                    return Err(ModelError::input(format!(
                        "token_idx decoding takes one token per step, got {seq}"
                    )));
                }
                let capacity = cache
                    .as_deref()
                    .and_then(BloomCache::capacity)
                    .ok_or_else(|| ModelError::input("token_idx requires a preallocated cache"))?;
                if token_idx == 0 || token_idx > capacity {
                    return Err(ModelError::input(format!(
                        "token_idx {token_idx} outside 1..={capacity}"
                    )));
                }
                capacity
            }
            None => past_len + seq,
        };

        let attention_mask = match (&args.attention_mask, args.token_idx) {
            (Some(mask), _) => {
                if mask.dims() != &[batch, kv_len] {
                    return Err(ModelError::input(format!(
                        "attention_mask must be [{batch}, {kv_len}], got {:?}",
                        mask.dims()
                    )));
                }
                mask.clone()
            }
            (None, Some(token_idx)) => self.token_idx_mask(batch, kv_len, token_idx)?,
            (None, None) => Tensor::ones((batch, kv_len), DType::U32, &self.options.device)?,
        };

        let alibi = build_alibi_tensor(
            &attention_mask,
            &self.slopes,
            self.config.n_head,
            self.options.dtype,
            self.options.tensor_parallel,
        )?;
        let causal_mask = prepare_attention_mask(&attention_mask, (batch, seq), kv_len - seq)?;
        let head_masks = self.layer_head_masks(args.head_mask.as_ref())?;

        let mut hidden = self
            .word_embeddings_layernorm
            .forward(&embeds, &self.policy)?;
        let mut all_hidden_states = output_hidden_states.then(Vec::new);
        let mut all_attentions = output_attentions.then(Vec::new);

        for (i, (block, head_mask)) in self.h.iter().zip(&head_masks).enumerate() {
            if let Some(states) = all_hidden_states.as_mut() {
                states.push(hidden.clone());
            }
            let inputs = LayerInputs {
                alibi: &alibi,
                mask: &causal_mask,
                head_mask: head_mask.as_ref(),
                use_cache,
                output_attentions,
                token_idx: args.token_idx,
                training: self.training,
            };
            let layer_cache = cache.as_deref_mut().and_then(|cache| cache.layer_mut(i));
            let (next, probs) = block.forward(&hidden, &inputs, layer_cache)?;
            hidden = next;
            if let (Some(attentions), Some(probs)) = (all_attentions.as_mut(), probs) {
                attentions.push(probs);
            }
        }

        let last_hidden_state = self.ln_f.forward(&hidden, &self.policy)?;
        if let Some(states) = all_hidden_states.as_mut() {
            states.push(last_hidden_state.clone());
        }

        Ok(BloomModelOutput {
            last_hidden_state,
            hidden_states: all_hidden_states,
            attentions: all_attentions,
            past_len: cache.as_deref().map(BloomCache::past_len),
        })
    }
}
