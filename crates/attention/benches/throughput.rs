//! Decode-step throughput of the ALiBi kernel with both cache kinds.
//! Run with: `cargo bench -p attention --bench throughput`

use std::error::Error;
use std::time::Instant;

use attention::core::{Attention, AttentionInputs, Config, TensorParallel};
use attention::kv_cache::{BloomCache, CacheLayout, KeyValueCache};
use attention::masks::prepare_attention_mask;
use attention::{alibi_slope_tensor, build_alibi_tensor, AlibiAttention};
use candle_core::{DType, Device, Tensor};

#[derive(Clone, Copy)]
struct Case {
    batch: usize,
    heads: usize,
    head_dim: usize,
    prompt: usize,
    steps: usize,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("throughput bench failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let device = Device::Cpu;
    let cases = [
        Case { batch: 1, heads: 8, head_dim: 64, prompt: 32, steps: 64 },
        Case { batch: 4, heads: 8, head_dim: 64, prompt: 128, steps: 64 },
    ];

    println!("| cache | (b,h,d) | prompt+steps | tokens/sec |");
    println!("| --- | --- | --- | --- |");
    for case in cases {
        for preallocated in [false, true] {
            let tokens_sec = decode(&device, case, preallocated)?;
            println!(
                "| {} | ({},{},{}) | {}+{} | {:.1} |",
                if preallocated { "preallocated" } else { "concat" },
                case.batch,
                case.heads,
                case.head_dim,
                case.prompt,
                case.steps,
                tokens_sec
            );
        }
    }
    Ok(())
}

fn decode(device: &Device, case: Case, preallocated: bool) -> Result<f64, Box<dyn Error>> {
    let rows = case.batch * case.heads;
    let capacity = case.prompt + case.steps;
    let mut cache = if preallocated {
        BloomCache::preallocated(
            1,
            &CacheLayout {
                batch: case.batch,
                num_heads: case.heads,
                head_dim: case.head_dim,
                max_seq_len: capacity,
                dtype: DType::F32,
                device: device.clone(),
            },
        )?
    } else {
        BloomCache::concat(1)
    };
    let layer = cache.layer_mut(0).ok_or("missing layer")?;
    let kernel = AlibiAttention::new(Config::new(case.heads, case.head_dim))?;
    let slopes = alibi_slope_tensor(case.heads, device)?;

    let key = Tensor::rand(0f32, 1.0, (rows, case.head_dim, case.prompt), device)?;
    let value = Tensor::rand(0f32, 1.0, (rows, case.prompt, case.head_dim), device)?;
    layer.append(&key, &value)?;

    let start = Instant::now();
    for step in 0..case.steps {
        let position = case.prompt + step;
        let query = Tensor::rand(0f32, 1.0, (rows, 1, case.head_dim), device)?;
        let key = Tensor::rand(0f32, 1.0, (rows, case.head_dim, 1), device)?;
        let value = Tensor::rand(0f32, 1.0, (rows, 1, case.head_dim), device)?;
        let (keys, values, kv_len) = if preallocated {
            let (k, v) = layer.write_at(position, &key, &value)?;
            (k, v, capacity)
        } else {
            let (k, v) = layer.append(&key, &value)?;
            (k, v, position + 1)
        };
        let keep: Vec<u32> = (0..kv_len).map(|j| u32::from(j <= position)).collect();
        let keep = Tensor::from_vec(keep, (1, kv_len), device)?
            .broadcast_as((case.batch, kv_len))?
            .contiguous()?;
        let alibi = build_alibi_tensor(&keep, &slopes, case.heads, DType::F32, TensorParallel::single())?;
        let mask = prepare_attention_mask(&keep, (case.batch, 1), kv_len - 1)?;
        kernel.attend(
            &AttentionInputs {
                query: &query,
                key: &keys,
                value: &values,
                alibi: &alibi,
                mask: &mask,
                head_mask: None,
            },
            false,
        )?;
    }
    let elapsed = start.elapsed().as_secs_f64();
    Ok((case.steps * case.batch) as f64 / elapsed)
}
