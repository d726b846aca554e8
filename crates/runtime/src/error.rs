use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while probing the host or moving tensors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("command `{command}` could not be launched: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {what}: {message}")]
    Parse { what: &'static str, message: String },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl RuntimeError {
    pub(crate) fn parse(what: &'static str, message: impl Into<String>) -> Self {
        Self::Parse {
            what,
            message: message.into(),
        }
    }
}
