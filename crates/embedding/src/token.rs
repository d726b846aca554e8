//! Token embedding table.

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Configuration for building a token embedding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEmbeddingConfig {
    /// Size of the vocabulary (number of distinct tokens).
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub hidden_dim: usize,
}

/// Token embedding table `[vocab_size, hidden_dim]`.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Tensor,
}

impl TokenEmbedding {
    pub fn new(config: TokenEmbeddingConfig, weight: Tensor) -> Result<Self> {
        if config.vocab_size == 0 || config.hidden_dim == 0 {
            bail!("token embedding requires vocab_size > 0 and hidden_dim > 0, got {config:?}");
        }
        if weight.dims() != &[config.vocab_size, config.hidden_dim] {
            bail!(
                "token embedding weight {:?} does not match [{}, {}]",
                weight.dims(),
                config.vocab_size,
                config.hidden_dim
            );
        }
        Ok(Self { config, weight })
    }

    /// Loads `weight` from `vb`, sampling `N(0, init_std)` when absent.
    pub fn load(config: TokenEmbeddingConfig, init_std: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (config.vocab_size, config.hidden_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: init_std,
            },
        )?;
        Self::new(config, weight)
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Looks up embeddings for `(batch, seq)` integer token ids.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = match token_ids.dims() {
            [batch, seq] if *batch > 0 && *seq > 0 => (*batch, *seq),
            dims => bail!("token_ids must be a non-empty [batch, seq], got {dims:?}"),
        };
        if !token_ids.dtype().is_int() {
            bail!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            );
        }

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;
        let gathered = self.weight.index_select(&flat, 0)?;
        gathered.reshape((batch, seq, self.config.hidden_dim))
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let min_id = flat_ids.min(0)?.to_scalar::<i64>()?;
        if min_id < 0 {
            bail!("encountered negative token id {min_id}");
        }
        let max_id = flat_ids.max(0)?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            bail!("token id {max_id} exceeds vocab size {vocab}");
        }
        Ok(())
    }
}
