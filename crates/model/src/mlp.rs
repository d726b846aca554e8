use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{dropout_add, gelu_tanh, Linear, LinearConfig, PrecisionPolicy};

use crate::{
    config::{BloomConfig, TensorParallel},
    parallel::{load_column_parallel, load_row_parallel, AllReduce},
    ModelError,
};

/// `hidden -> 4 * hidden -> hidden` feed-forward with tanh-GELU.
#[derive(Debug)]
pub struct BloomMlp {
    dense_h_to_4h: Linear,
    dense_4h_to_h: Linear,
    pretraining_tp: usize,
    slow_but_exact: bool,
    hidden_dropout: f32,
    reduce: Arc<dyn AllReduce>,
    policy: PrecisionPolicy,
}

impl BloomMlp {
    pub fn load(
        config: &BloomConfig,
        topology: TensorParallel,
        reduce: Arc<dyn AllReduce>,
        policy: PrecisionPolicy,
        vb: VarBuilder,
    ) -> Result<Self, ModelError> {
        let hidden = config.hidden_size;
        let dense_h_to_4h = load_column_parallel(
            LinearConfig::new(hidden, 4 * hidden),
            config.initializer_range,
            topology,
            vb.pp("dense_h_to_4h"),
        )?;
        let dense_4h_to_h = load_row_parallel(
            LinearConfig::new(4 * hidden, hidden),
            config.initializer_range,
            topology,
            vb.pp("dense_4h_to_h"),
        )?;
        Ok(Self {
            dense_h_to_4h,
            dense_4h_to_h,
            pretraining_tp: config.pretraining_tp,
            slow_but_exact: config.slow_but_exact,
            hidden_dropout: config.hidden_dropout,
            reduce,
            policy,
        })
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        residual: &Tensor,
        training: bool,
    ) -> Result<Tensor, ModelError> {
        let expanded = self.dense_h_to_4h.forward(hidden, &self.policy)?;
        let activated = gelu_tanh(&expanded, &self.policy)?;
        let projected = if self.pretraining_tp > 1 && self.slow_but_exact {
            let partial = self.dense_4h_to_h.forward_sliced_no_bias(
                &activated,
                self.pretraining_tp,
                &self.policy,
            )?;
            self.reduce.all_reduce_sum(&partial)?
        } else {
            let partial = self.dense_4h_to_h.forward_no_bias(&activated, &self.policy)?;
            self.dense_4h_to_h
                .add_bias(&self.reduce.all_reduce_sum(&partial)?, &self.policy)?
        };
        Ok(dropout_add(
            &projected,
            residual,
            self.hidden_dropout,
            training,
            &self.policy,
        )?)
    }
}
