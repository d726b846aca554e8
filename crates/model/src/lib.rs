//! BLOOM decoder assembled from the workspace crates.
//!
//! [`BloomModel`] is the embedding, decoder stack and final norm;
//! [`BloomForCausalLM`] adds the tied vocabulary head, the shifted loss and
//! the generation helpers. Parameters use the upstream checkpoint names.

pub mod args;
pub mod block;
pub mod causal_lm;
pub mod config;
pub mod error;
pub mod generation;
pub mod loss;
pub mod mlp;
pub mod model;
pub mod parallel;
pub mod self_attention;

pub use args::ForwardArgs;
pub use block::{BloomBlock, LayerInputs};
pub use causal_lm::{BloomForCausalLM, CausalLmOutput};
pub use config::{BloomConfig, ModelOptions, TensorParallel};
pub use error::ModelError;
pub use generation::{generate_greedy, CacheStrategy, GenerationOutput};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput, IGNORE_INDEX};
pub use mlp::BloomMlp;
pub use model::{BloomModel, BloomModelOutput};
pub use parallel::{AllReduce, LocalReduce};
pub use self_attention::BloomAttention;
