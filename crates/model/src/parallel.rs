//! Tensor-parallel plumbing.
//!
//! Each rank keeps `1 / world_size` of the heads. Projections into the heads
//! (`query_key_value`, `dense_h_to_4h`) are split by output rows; projections
//! back to the hidden size (`dense`, `dense_4h_to_h`) are split by input
//! columns and produce partial sums that are combined with [`AllReduce`]
//! before their bias is added once. The `pretraining_tp` slice loop adds no
//! bias.

use std::fmt;

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};
use layers::{Linear, LinearConfig};

use crate::config::TensorParallel;

/// Sums partial results across the ranks of a tensor-parallel group.
pub trait AllReduce: fmt::Debug + Send + Sync {
    fn all_reduce_sum(&self, partial: &Tensor) -> Result<Tensor>;
}

/// Single-process group: the partial sum already is the total.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReduce;

impl AllReduce for LocalReduce {
    fn all_reduce_sum(&self, partial: &Tensor) -> Result<Tensor> {
        Ok(partial.clone())
    }
}

fn load_full_weight(config: LinearConfig, init_std: f64, vb: &VarBuilder) -> Result<Tensor> {
    vb.get_with_hints(
        (config.output_dim, config.input_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: init_std,
        },
    )
}

fn load_full_bias(config: LinearConfig, vb: &VarBuilder) -> Result<Option<Tensor>> {
    if config.bias {
        Ok(Some(vb.get_with_hints(config.output_dim, "bias", Init::Const(0.0))?))
    } else {
        Ok(None)
    }
}

/// Loads `full` and keeps this rank's block of output rows (and bias).
pub(crate) fn load_column_parallel(
    full: LinearConfig,
    init_std: f64,
    topology: TensorParallel,
    vb: VarBuilder,
) -> Result<Linear> {
    if topology.world_size == 1 {
        return Linear::load(full, init_std, vb);
    }
    let rows = full.output_dim / topology.world_size;
    let start = topology.rank * rows;
    let weight = load_full_weight(full, init_std, &vb)?
        .narrow(0, start, rows)?
        .contiguous()?;
    let bias = load_full_bias(full, &vb)?
        .map(|bias| bias.narrow(0, start, rows)?.contiguous())
        .transpose()?;
    let local = LinearConfig {
        output_dim: rows,
        ..full
    };
    Linear::new(local, weight, bias)
}

/// Loads `full` and keeps this rank's block of input columns. The bias stays
/// whole and is added after the reduction.
pub(crate) fn load_row_parallel(
    full: LinearConfig,
    init_std: f64,
    topology: TensorParallel,
    vb: VarBuilder,
) -> Result<Linear> {
    if topology.world_size == 1 {
        return Linear::load(full, init_std, vb);
    }
    let cols = full.input_dim / topology.world_size;
    let weight = load_full_weight(full, init_std, &vb)?
        .narrow(1, topology.rank * cols, cols)?
        .contiguous()?;
    let bias = load_full_bias(full, &vb)?;
    let local = LinearConfig {
        input_dim: cols,
        ..full
    };
    Linear::new(local, weight, bias)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn shards_cover_the_full_projection() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let full = LinearConfig::new(4, 6);
        let dense = Linear::load(full, 0.5, vb.pp("proj"))?;

        let columns: Vec<Linear> = (0..2)
            .map(|rank| load_column_parallel(full, 0.5, TensorParallel::new(rank, 2), vb.pp("proj")))
            .collect::<Result<_>>()?;
        let stacked = Tensor::cat(&[columns[0].weight(), columns[1].weight()], 0)?;
        let diff = (stacked - dense.weight())?.abs()?.flatten_all()?.max(0)?;
        assert_eq!(diff.to_scalar::<f32>()?, 0.0);

        let rows = load_row_parallel(full, 0.5, TensorParallel::new(1, 2), vb.pp("proj"))?;
        assert_eq!(rows.weight().dims(), &[6, 2]);
        assert_eq!(rows.bias().map(|b| b.dims().to_vec()), Some(vec![6]));
        Ok(())
    }

    #[test]
    fn local_reduce_is_identity() -> Result<()> {
        let t = Tensor::new(&[1f32, 2.0], &Device::Cpu)?;
        let reduced = LocalReduce.all_reduce_sum(&t)?;
        assert_eq!(reduced.to_vec1::<f32>()?, vec![1.0, 2.0]);
        Ok(())
    }
}
