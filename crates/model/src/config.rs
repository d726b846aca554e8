//! Model configuration in the upstream `config.json` schema.
//!
//! Unknown keys (`architectures`, token ids, ...) are ignored. Runtime choices
//! that are not part of the schema live in [`ModelOptions`].

use std::{fs, path::Path};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

pub use attention::TensorParallel;

use crate::ModelError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    pub vocab_size: usize,
    #[serde(alias = "n_embed")]
    pub hidden_size: usize,
    #[serde(alias = "num_hidden_layers")]
    pub n_layer: usize,
    #[serde(alias = "num_attention_heads")]
    pub n_head: usize,
    pub layer_norm_epsilon: f64,
    /// Standard deviation of freshly initialised weights.
    pub initializer_range: f64,
    pub use_cache: bool,
    pub apply_residual_connection_post_layernorm: bool,
    pub hidden_dropout: f32,
    pub attention_dropout: f32,
    /// Tensor-parallel degree used during pretraining.
    pub pretraining_tp: usize,
    /// Reproduce the pretraining reduction order with slice-and-sum projections.
    pub slow_but_exact: bool,
    pub output_attentions: bool,
    pub output_hidden_states: bool,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            vocab_size: 250_880,
            hidden_size: 64,
            n_layer: 2,
            n_head: 8,
            layer_norm_epsilon: 1e-5,
            initializer_range: 0.02,
            use_cache: true,
            apply_residual_connection_post_layernorm: false,
            hidden_dropout: 0.0,
            attention_dropout: 0.0,
            pretraining_tp: 1,
            slow_but_exact: false,
            output_attentions: false,
            output_hidden_states: false,
        }
    }
}

impl BloomConfig {
    /// Reads a JSON or TOML file, chosen by extension, and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: BloomConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") | None => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ModelError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_head.max(1)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let mut errors = Vec::new();

        if self.vocab_size == 0 {
            errors.push("vocab_size must be greater than zero".to_string());
        }
        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than zero".to_string());
        }
        if self.n_layer == 0 {
            errors.push("n_layer must be greater than zero".to_string());
        }
        if self.n_head == 0 {
            errors.push("n_head must be greater than zero".to_string());
        } else if self.hidden_size % self.n_head != 0 {
            errors.push(format!(
                "hidden_size ({}) must be divisible by n_head ({})",
                self.hidden_size, self.n_head
            ));
        }
        if !(self.layer_norm_epsilon > 0.0) {
            errors.push("layer_norm_epsilon must be positive".to_string());
        }
        if !(self.initializer_range >= 0.0) {
            errors.push("initializer_range must be non-negative".to_string());
        }
        for (name, p) in [
            ("hidden_dropout", self.hidden_dropout),
            ("attention_dropout", self.attention_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("{name} must be in [0, 1), got {p}"));
            }
        }
        if self.pretraining_tp == 0 {
            errors.push("pretraining_tp must be at least 1".to_string());
        } else if self.hidden_size % self.pretraining_tp != 0 {
            errors.push(format!(
                "hidden_size ({}) must be divisible by pretraining_tp ({})",
                self.hidden_size, self.pretraining_tp
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::InvalidConfig(errors))
        }
    }

    /// Checks that `topology` can shard this model's heads and projections.
    pub fn validate_topology(&self, topology: TensorParallel) -> Result<(), ModelError> {
        topology.validate_for(self.n_head)?;
        let local_hidden = self.hidden_size / topology.world_size;
        if self.slow_but_exact && local_hidden % self.pretraining_tp != 0 {
            return Err(ModelError::InvalidConfig(vec![format!(
                "per-rank hidden size {local_hidden} must be divisible by pretraining_tp ({})",
                self.pretraining_tp
            )]));
        }
        Ok(())
    }
}

/// Runtime choices for building a model.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    /// Parameter and activation dtype.
    pub dtype: DType,
    pub device: Device,
    pub tensor_parallel: TensorParallel,
    /// Disables the KV cache while training, see [`crate::BloomModel::forward`].
    pub gradient_checkpointing: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            dtype: DType::F32,
            device: Device::Cpu,
            tensor_parallel: TensorParallel::single(),
            gradient_checkpointing: false,
        }
    }
}

impl ModelOptions {
    pub fn new(dtype: DType, device: Device) -> Self {
        Self {
            dtype,
            device,
            ..Self::default()
        }
    }

    pub fn with_tensor_parallel(mut self, tensor_parallel: TensorParallel) -> Self {
        self.tensor_parallel = tensor_parallel;
        self
    }

    pub fn with_gradient_checkpointing(mut self, enabled: bool) -> Self {
        self.gradient_checkpointing = enabled;
        self
    }
}
