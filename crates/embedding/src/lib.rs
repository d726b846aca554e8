//! Embedding crate
//!
//! BLOOM has no positional embeddings: the token table is the only input
//! embedding, and its transpose doubles as the language-model head.

pub mod head;
pub mod token;

pub use head::{LmHead, LM_HEAD_CHUNKS};
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
