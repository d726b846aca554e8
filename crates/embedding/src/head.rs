//! Language-model head tied to the word embeddings.
//!
//! The head projects hidden states onto the vocabulary with the transpose of
//! the embedding table. [`LmHead::split`] cuts the table along the vocabulary
//! into chunks stored pre-transposed; logits are then produced chunk by chunk
//! and concatenated, which bounds the size of each matmul on accelerators with
//! limited per-op memory.

use candle_core::{bail, Result, Tensor, D};
use layers::PrecisionPolicy;

use crate::token::TokenEmbedding;

/// Number of chunks used by the split head.
pub const LM_HEAD_CHUNKS: usize = 2;

#[derive(Debug, Clone)]
pub struct LmHead {
    weight: Tensor,
    /// `[hidden, vocab_chunk]` slices, present once the head is split.
    chunks: Option<Vec<Tensor>>,
}

impl LmHead {
    /// Head sharing the embedding table.
    pub fn tied(embedding: &TokenEmbedding) -> Self {
        Self {
            weight: embedding.weight().clone(),
            chunks: None,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn is_split(&self) -> bool {
        self.chunks.is_some()
    }

    /// Splits the vocabulary axis into `n` chunks (the last one may be smaller).
    pub fn split(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            bail!("lm head needs at least one chunk");
        }
        let chunks = self
            .weight
            .chunk(n, 0)?
            .into_iter()
            .map(|chunk| chunk.t()?.contiguous())
            .collect::<Result<Vec<_>>>()?;
        log::debug!("lm head split into {} chunks", chunks.len());
        self.chunks = Some(chunks);
        Ok(())
    }

    /// `hidden [.., hidden_dim]` to logits `[.., vocab_size]`.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (vocab, hidden_dim) = self.weight.dims2()?;
        let dims = hidden.dims();
        if dims.last() != Some(&hidden_dim) {
            bail!("lm head expected hidden dim {hidden_dim}, got {dims:?}");
        }
        let rows = hidden.elem_count() / hidden_dim;
        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(vocab);

        let input = policy.cast_for_matmul(hidden)?.reshape((rows, hidden_dim))?;
        let logits = match &self.chunks {
            Some(chunks) => {
                let parts = chunks
                    .iter()
                    .map(|chunk| input.matmul(&policy.cast_for_matmul(chunk)?))
                    .collect::<Result<Vec<_>>>()?;
                Tensor::cat(&parts, D::Minus1)?
            }
            None => input.matmul(&policy.cast_for_matmul(&self.weight)?.t()?)?,
        };
        policy.cast_to_storage(&logits.reshape(out_dims)?)
    }
}
