//! Greedy decoding.

use std::{collections::BTreeMap, time::Instant};

use attention::BloomCache;
use candle_core::{DType, Tensor, D};
use runtime::speed_metrics;

use crate::{causal_lm::BloomForCausalLM, ModelError};

/// How keys and values are kept between decoding steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Caches grow by concatenation every step.
    #[default]
    Concat,
    /// Buffers sized for the whole generation are allocated after the prompt
    /// and every step writes one position in place, addressed by `token_idx`.
    Preallocated,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    /// Prompt followed by the generated ids, `[batch, prompt + new]` `i64`.
    pub tokens: Tensor,
    pub new_tokens: usize,
    /// `generate_*` speed metrics; the prompt step counts as warmup.
    pub metrics: BTreeMap<String, f64>,
}

fn new_cache(
    model: &BloomForCausalLM,
    strategy: CacheStrategy,
    batch: usize,
    max_seq_len: usize,
) -> Result<BloomCache, ModelError> {
    let n_layer = model.config().n_layer;
    Ok(match strategy {
        CacheStrategy::Concat => BloomCache::concat(n_layer),
        CacheStrategy::Preallocated => {
            let layout = model.transformer().cache_layout(batch, max_seq_len);
            BloomCache::preallocated(n_layer, &layout)?
        }
    })
}

/// Appends `max_new_tokens` argmax tokens to `input_ids` (`[batch, prompt]`).
///
/// Both strategies produce the same tokens. The model should be in
/// inference mode; with dropout active the result is sampled noise.
pub fn generate_greedy(
    model: &BloomForCausalLM,
    input_ids: &Tensor,
    max_new_tokens: usize,
    strategy: CacheStrategy,
) -> Result<GenerationOutput, ModelError> {
    let (batch, prompt_len) = input_ids.dims2()?;
    if prompt_len == 0 {
        return Err(ModelError::input("generation needs a non-empty prompt"));
    }
    let mut tokens = input_ids.to_dtype(DType::I64)?;
    let mut cache = new_cache(model, strategy, batch, prompt_len + max_new_tokens)?;

    let start = Instant::now();
    let mut after_prompt = None;
    for step in 0..max_new_tokens {
        let seq = tokens.dim(1)?;
        let token_idx = match strategy {
            CacheStrategy::Preallocated if !cache.is_empty() => Some(seq),
            _ => None,
        };
        let mut args = model.prepare_inputs_for_generation(&tokens, Some(&cache), None, token_idx)?;
        args.use_cache = Some(true);

        let output = model.forward(&args, Some(&mut cache))?;
        let q_len = output.logits.dim(1)?;
        let next = output
            .logits
            .narrow(1, q_len - 1, 1)?
            .squeeze(1)?
            .argmax(D::Minus1)?
            .to_dtype(DType::I64)?
            .unsqueeze(1)?;
        tokens = Tensor::cat(&[&tokens, &next], 1)?;

        if step == 0 {
            after_prompt = Some(Instant::now());
        }
        log::debug!("generated step {step}, cache holds {} positions", cache.past_len());
    }

    let metrics = speed_metrics(
        "generate",
        start,
        Some(batch * max_new_tokens),
        Some(max_new_tokens),
        after_prompt,
    );
    Ok(GenerationOutput {
        tokens,
        new_tokens: max_new_tokens,
        metrics,
    })
}
