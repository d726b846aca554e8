//! Run-time knobs for the attention kernel and the tensor-parallel topology.

use super::AttentionError;

/// Configuration driving the ALiBi kernel on one rank.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Heads handled by this rank (`n_head / world_size`).
    pub num_heads: usize,
    pub head_dim: usize,
    /// Probability for dropout applied to attention weights during training.
    pub dropout_p: f32,
    /// Weight of the ALiBi term in the fused `beta * alibi + alpha * q @ k`.
    pub beta: f64,
}

impl Config {
    pub fn new(num_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            head_dim,
            dropout_p: 0.0,
            beta: 1.0,
        }
    }

    pub fn with_dropout(mut self, dropout_p: f32) -> Self {
        self.dropout_p = dropout_p;
        self
    }

    /// `1 / sqrt(head_dim)`, the scale applied to `q @ k`.
    pub fn inv_norm_factor(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }
}

/// Position of this process in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorParallel {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for TensorParallel {
    fn default() -> Self {
        Self::single()
    }
}

impl TensorParallel {
    /// A single process owning every head.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }

    /// Reads `WORLD_SIZE` (default 1) and `RANK` (default 0).
    pub fn from_env() -> Result<Self, AttentionError> {
        Self::from_values(
            std::env::var("RANK").ok().as_deref(),
            std::env::var("WORLD_SIZE").ok().as_deref(),
        )
    }

    fn from_values(rank: Option<&str>, world_size: Option<&str>) -> Result<Self, AttentionError> {
        let read = |name: &str, value: Option<&str>, default: usize| match value {
            Some(value) => value.trim().parse().map_err(|err| AttentionError::InvalidTopology {
                context: format!("{name}={value:?}: {err}"),
            }),
            None => Ok(default),
        };
        Ok(Self {
            rank: read("RANK", rank, 0)?,
            world_size: read("WORLD_SIZE", world_size, 1)?,
        })
    }

    /// Checks that `num_heads` splits evenly and the rank is in range.
    pub fn validate_for(&self, num_heads: usize) -> Result<(), AttentionError> {
        if self.world_size == 0 {
            return Err(AttentionError::InvalidTopology {
                context: "world_size must be at least 1".into(),
            });
        }
        if self.rank >= self.world_size {
            return Err(AttentionError::InvalidTopology {
                context: format!("rank {} >= world_size {}", self.rank, self.world_size),
            });
        }
        if num_heads % self.world_size != 0 {
            return Err(AttentionError::InvalidTopology {
                context: format!(
                    "{num_heads} heads cannot be split across {} ranks",
                    self.world_size
                ),
            });
        }
        Ok(())
    }

    /// Heads handled by this rank.
    pub fn local_heads(&self, num_heads: usize) -> usize {
        num_heads / self.world_size.max(1)
    }
}
