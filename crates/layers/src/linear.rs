//! Dense projections for the decoder.
//!
//! Weights follow the `[out_features, in_features]` layout of the upstream
//! checkpoints. Inputs may have any number of leading axes; the last axis must
//! equal `input_dim`. Matmuls run in [`PrecisionPolicy::compute`] and the
//! result is cast back to storage.
//!
//! [`Linear::forward_sliced`] reproduces the "slow but exact" tensor-parallel
//! reduction of models pretrained with `pretraining_tp > 1`: the input features
//! are split into equal slices and the partial products are summed in slice
//! order, which matches the numerics those checkpoints were trained with.

use candle_core::{Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy, LayerError};

/// Dimensions of a dense projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub bias: bool,
}

impl LinearConfig {
    /// Projection with a bias vector, the BLOOM default.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    pub fn without_bias(mut self) -> Self {
        self.bias = false;
        self
    }
}

/// Affine projection `x @ W^T + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a layer from existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_rank("linear.weight", &weight, 2)?;
        if weight.dims() != &[config.output_dim, config.input_dim] {
            return Err(LayerError::ParameterShape {
                name: "linear.weight",
                expected: vec![config.output_dim, config.input_dim],
                actual: weight.dims().to_vec(),
            }
            .into());
        }
        checks::expect_dtype_in("linear.weight", &weight, checks::PARAMETER_DTYPES)?;
        match (&bias, config.bias) {
            (Some(b), true) => checks::expect_shape("linear.bias", b, &[config.output_dim])?,
            (None, false) => {}
            (Some(_), false) => candle_core::bail!("linear: bias supplied but config disables bias"),
            (None, true) => candle_core::bail!("linear: config expects a bias but none supplied"),
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Loads `weight` (and `bias`) from `vb`.
    ///
    /// When `vb` is backed by a `VarMap`, missing parameters are created with a
    /// normal(0, `init_std`) weight and a zero bias.
    pub fn load(config: LinearConfig, init_std: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (config.output_dim, config.input_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: init_std,
            },
        )?;
        let bias = if config.bias {
            Some(vb.get_with_hints(config.output_dim, "bias", Init::Const(0.0))?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Full projection including the bias.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let projected = self.project(hidden, &self.weight, policy)?;
        let output = self.add_bias_compute(&projected, policy)?;
        policy.cast_to_storage(&output)
    }

    /// Projection without the bias, for callers that reduce partial results
    /// across ranks before adding it once.
    pub fn forward_no_bias(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let projected = self.project(hidden, &self.weight, policy)?;
        policy.cast_to_storage(&projected)
    }

    /// Slice-and-sum projection including the bias.
    pub fn forward_sliced(
        &self,
        hidden: &Tensor,
        slices: usize,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let summed = self.sliced_sum(hidden, slices, policy)?;
        let output = self.add_bias_compute(&summed, policy)?;
        policy.cast_to_storage(&output)
    }

    /// Slice-and-sum projection without the bias.
    pub fn forward_sliced_no_bias(
        &self,
        hidden: &Tensor,
        slices: usize,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let summed = self.sliced_sum(hidden, slices, policy)?;
        policy.cast_to_storage(&summed)
    }

    /// Adds the bias to an already projected tensor (no-op without a bias).
    pub fn add_bias(&self, projected: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.output", projected, self.config.output_dim)?;
        let compute = policy.cast_for_matmul(projected)?;
        let output = self.add_bias_compute(&compute, policy)?;
        policy.cast_to_storage(&output)
    }

    fn add_bias_compute(&self, projected: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match &self.bias {
            Some(bias) => projected.broadcast_add(&policy.cast_for_matmul(bias)?),
            None => Ok(projected.clone()),
        }
    }

    fn sliced_sum(&self, hidden: &Tensor, slices: usize, policy: &PrecisionPolicy) -> Result<Tensor> {
        let features = self.config.input_dim;
        if slices == 0 || features % slices != 0 {
            return Err(LayerError::IndivisibleSlices { features, slices }.into());
        }
        if slices == 1 {
            return self.project(hidden, &self.weight, policy);
        }
        let width = features / slices;
        let mut acc: Option<Tensor> = None;
        for i in 0..slices {
            let input = hidden.narrow(D::Minus1, i * width, width)?.contiguous()?;
            let weight = self.weight.narrow(1, i * width, width)?.contiguous()?;
            let partial = project_with(&input, &weight, width, self.config.output_dim, policy)?;
            acc = Some(match acc {
                Some(sum) => (sum + partial)?,
                None => partial,
            });
        }
        acc.ok_or_else(|| candle_core::Error::Msg("linear: empty slice loop".into()))
    }

    /// `hidden @ weight^T` in the compute dtype.
    fn project(&self, hidden: &Tensor, weight: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        project_with(
            hidden,
            weight,
            self.config.input_dim,
            self.config.output_dim,
            policy,
        )
    }
}

fn project_with(
    hidden: &Tensor,
    weight: &Tensor,
    input_dim: usize,
    output_dim: usize,
    policy: &PrecisionPolicy,
) -> Result<Tensor> {
    let dims = hidden.dims();
    let rows = hidden.elem_count() / input_dim;
    let mut out_dims = dims[..dims.len() - 1].to_vec();
    out_dims.push(output_dim);

    let input = policy.cast_for_matmul(hidden)?.reshape((rows, input_dim))?;
    let weight_t = policy.cast_for_matmul(weight)?.t()?;
    input.matmul(&weight_t)?.reshape(out_dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()
    }

    fn reference(input: &Tensor, weight: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (b, t, h) = input.dims3()?;
        input
            .reshape((b * t, h))?
            .matmul(&weight.t()?)?
            .broadcast_add(bias)?
            .reshape((b, t, weight.dim(0)?))
    }

    #[test]
    fn forward_matches_reference() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 6);
        let weight = Tensor::randn(0f32, 0.1, (6, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.1, 6, &device)?;
        let linear = Linear::new(config, weight.clone(), Some(bias.clone()))?;
        let input = Tensor::randn(0f32, 1.0, (2, 3, 8), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let out = linear.forward(&input, &policy)?;
        assert_eq!(out.dims(), &[2, 3, 6]);
        assert!(max_diff(&out, &reference(&input, &weight, &bias)?)? < 1e-5);

        let no_bias = linear.forward_no_bias(&input, &policy)?;
        let readded = linear.add_bias(&no_bias, &policy)?;
        assert!(max_diff(&out, &readded)? < 1e-6);
        Ok(())
    }

    #[test]
    fn sliced_projection_equals_dense() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::new(
            LinearConfig::new(12, 5),
            Tensor::randn(0f32, 0.2, (5, 12), &device)?,
            Some(Tensor::randn(0f32, 0.2, 5, &device)?),
        )?;
        let input = Tensor::randn(0f32, 1.0, (2, 4, 12), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let dense = linear.forward(&input, &policy)?;
        for slices in [1, 2, 3, 4] {
            let sliced = linear.forward_sliced(&input, slices, &policy)?;
            assert!(max_diff(&dense, &sliced)? < 1e-5, "slices = {slices}");
        }
        assert!(linear.forward_sliced(&input, 5, &policy).is_err());
        Ok(())
    }

    #[test]
    fn mismatched_parameters_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::zeros((4, 3), DType::F32, &device)?;
        let err = Linear::new(LinearConfig::new(4, 3), weight.clone(), None).unwrap_err();
        assert!(err.to_string().contains("linear.weight"));
        assert!(Linear::new(LinearConfig::new(3, 4).without_bias(), weight, None).is_ok());
        Ok(())
    }

    #[test]
    fn load_creates_missing_parameters() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let linear = Linear::load(LinearConfig::new(16, 32), 0.02, vb.pp("dense"))?;
        assert_eq!(linear.weight().dims(), &[32, 16]);
        let bias = linear.bias().map(|b| b.to_vec1::<f32>()).transpose()?;
        assert_eq!(bias, Some(vec![0.0; 32]));
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.contains(&"dense.weight".to_string()));
        Ok(())
    }
}
