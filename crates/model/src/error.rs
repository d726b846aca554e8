use attention::AttentionError;
use thiserror::Error;

/// Failures raised while configuring or running the decoder.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),
    /// Keyword arguments the forward pass does not understand.
    #[error("got unexpected arguments: {}", .0.join(", "))]
    UnexpectedArguments(Vec<String>),
    /// Missing, conflicting or badly shaped forward inputs.
    #[error("invalid inputs: {0}")]
    InvalidInput(String),
    /// A multi-rank topology was requested without a cross-rank reduction.
    #[error("world_size {world_size} needs a cross-rank AllReduce, load with `load_with_reduce`")]
    MissingReduction { world_size: usize },
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl ModelError {
    pub fn input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}

impl From<toml::de::Error> for ModelError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigFormat(err.to_string())
    }
}
