use std::sync::{Arc, Mutex};

use anyhow::Result;
use attention::{alibi_slope_tensor, build_alibi_tensor, masks::prepare_attention_mask};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use layers::PrecisionPolicy;
use model::{
    AllReduce, BloomAttention, BloomConfig, BloomMlp, LayerInputs, LocalReduce, TensorParallel,
};

const WORLD: usize = 2;

fn build_config() -> BloomConfig {
    BloomConfig {
        vocab_size: 32,
        hidden_size: 16,
        n_layer: 1,
        n_head: 4,
        initializer_range: 0.5,
        ..BloomConfig::default()
    }
}

/// Keeps every partial sum it sees and passes it through unchanged.
#[derive(Debug, Default)]
struct Recorder {
    partials: Mutex<Vec<Tensor>>,
}

impl AllReduce for Recorder {
    fn all_reduce_sum(&self, partial: &Tensor) -> candle_core::Result<Tensor> {
        self.partials.lock().unwrap().push(partial.clone());
        Ok(partial.clone())
    }
}

impl Recorder {
    fn total(&self) -> Result<Tensor> {
        let partials = self.partials.lock().unwrap();
        assert_eq!(partials.len(), WORLD);
        let mut total = partials[0].clone();
        for partial in &partials[1..] {
            total = (total + partial)?;
        }
        Ok(total)
    }
}

/// Stands in for the group: every rank receives the summed partials.
#[derive(Debug)]
struct Summed(Tensor);

impl AllReduce for Summed {
    fn all_reduce_sum(&self, partial: &Tensor) -> candle_core::Result<Tensor> {
        assert_eq!(partial.dims(), self.0.dims());
        Ok(self.0.clone())
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

fn varying(len: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::arange(0f32, len as f32, device)?.affine(0.1, -0.4)?)
}

#[test]
fn mlp_partials_sum_to_the_single_rank_output() -> Result<()> {
    let device = Device::Cpu;
    let config = build_config();
    let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    BloomMlp::load(&config, TensorParallel::single(), Arc::new(LocalReduce), policy, vb.pp("mlp"))?;
    varmap.set_one("mlp.dense_h_to_4h.bias", varying(64, &device)?)?;
    varmap.set_one("mlp.dense_4h_to_h.bias", varying(16, &device)?)?;

    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let hidden = Tensor::randn(0f32, 1.0, (2, 3, 16), &device)?;
    let residual = Tensor::randn(0f32, 1.0, (2, 3, 16), &device)?;
    let expected = BloomMlp::load(&config, TensorParallel::single(), Arc::new(LocalReduce), policy, vb.pp("mlp"))?
        .forward(&hidden, &residual, false)?;

    let recorder = Arc::new(Recorder::default());
    for rank in 0..WORLD {
        let topology = TensorParallel::new(rank, WORLD);
        BloomMlp::load(&config, topology, recorder.clone(), policy, vb.pp("mlp"))?
            .forward(&hidden, &residual, false)?;
    }
    let total = recorder.total()?;

    for rank in 0..WORLD {
        let topology = TensorParallel::new(rank, WORLD);
        let reduce = Arc::new(Summed(total.clone()));
        let actual = BloomMlp::load(&config, topology, reduce, policy, vb.pp("mlp"))?
            .forward(&hidden, &residual, false)?;
        assert!(max_abs_diff(&expected, &actual)? < 1e-4, "rank {rank}");
    }
    Ok(())
}

#[test]
fn attention_partials_sum_to_the_single_rank_output() -> Result<()> {
    let device = Device::Cpu;
    let config = build_config();
    let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
    let (batch, seq) = (2, 3);
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let single = TensorParallel::single();
    BloomAttention::load(&config, single, Arc::new(LocalReduce), policy, vb.pp("self_attention"))?;
    varmap.set_one("self_attention.query_key_value.bias", varying(48, &device)?)?;
    varmap.set_one("self_attention.dense.bias", varying(16, &device)?)?;

    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let hidden = Tensor::randn(0f32, 1.0, (batch, seq, 16), &device)?;
    let residual = Tensor::randn(0f32, 1.0, (batch, seq, 16), &device)?;
    let keep = Tensor::new(&[[1u32, 1, 1], [0, 1, 1]], &device)?;
    let mask = prepare_attention_mask(&keep, (batch, seq), 0)?;
    let slopes = alibi_slope_tensor(config.n_head, &device)?;

    let run = |topology: TensorParallel, reduce: Arc<dyn AllReduce>| -> Result<Tensor> {
        let alibi = build_alibi_tensor(&keep, &slopes, config.n_head, DType::F32, topology)?;
        let inputs = LayerInputs {
            alibi: &alibi,
            mask: &mask,
            head_mask: None,
            use_cache: false,
            output_attentions: false,
            token_idx: None,
            training: false,
        };
        let attention = BloomAttention::load(&config, topology, reduce, policy, vb.pp("self_attention"))?;
        Ok(attention.forward(&hidden, &residual, &inputs, None)?.0)
    };

    let expected = run(single, Arc::new(LocalReduce))?;
    let recorder = Arc::new(Recorder::default());
    for rank in 0..WORLD {
        run(TensorParallel::new(rank, WORLD), recorder.clone() as Arc<dyn AllReduce>)?;
    }
    let total = recorder.total()?;
    for rank in 0..WORLD {
        let actual = run(TensorParallel::new(rank, WORLD), Arc::new(Summed(total.clone())))?;
        assert!(max_abs_diff(&expected, &actual)? < 1e-4, "rank {rank}");
    }
    Ok(())
}
