use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use attention::TensorParallel;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use clap::{Parser, Subcommand, ValueEnum};
use model::{generate_greedy, BloomConfig, BloomForCausalLM, CacheStrategy, ModelOptions};
use runtime::{check_runtime_versions, memory_stats, set_seed, ProbeConfig, ProcessMemory};
use tokenizers::Tokenizer;

#[derive(Parser, Debug)]
#[command(name = "bloom", about = "BLOOM decoder toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DTypeArg {
    F32,
    F16,
    Bf16,
}

impl From<DTypeArg> for DType {
    fn from(value: DTypeArg) -> DType {
        match value {
            DTypeArg::F32 => DType::F32,
            DTypeArg::F16 => DType::F16,
            DTypeArg::Bf16 => DType::BF16,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the installed runtime with the validated release and print memory usage.
    Check {
        /// Package whose version stands for the installed framework.
        #[arg(long)]
        package: Option<String>,
    },
    /// Greedy-decode from a prompt.
    Generate {
        /// `config.json` or TOML model configuration.
        #[arg(long)]
        config: PathBuf,
        /// Safetensors checkpoint; random weights when omitted.
        #[arg(long)]
        weights: Option<PathBuf>,
        /// Comma-separated prompt token ids.
        #[arg(long, value_delimiter = ',', conflicts_with = "prompt")]
        prompt_ids: Vec<u32>,
        /// Prompt text, encoded with `--tokenizer`.
        #[arg(long, requires = "tokenizer")]
        prompt: Option<String>,
        #[arg(long)]
        tokenizer: Option<PathBuf>,
        #[arg(long, default_value_t = 16)]
        max_new_tokens: usize,
        /// Decode with a fixed-size cache written in place.
        #[arg(long, default_value_t = false)]
        preallocated: bool,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, value_enum, default_value = "f32")]
        dtype: DTypeArg,
        /// Defaults to `WORLD_SIZE`, then 1.
        #[arg(long)]
        world_size: Option<usize>,
        /// Defaults to `RANK`, then 0.
        #[arg(long)]
        rank: Option<usize>,
    },
}

fn run_check(package: Option<String>) -> Result<()> {
    let mut probe = ProbeConfig::default();
    if let Some(package) = package {
        probe.package = package;
    }
    let report = check_runtime_versions(&probe);
    match (report.framework, report.driver) {
        (Some(framework), Some(driver)) => {
            log::info!("framework v{framework}, driver v{driver}, validated v{}", probe.validated)
        }
        _ => log::info!("runtime check finished with {} warning(s)", report.warnings.len()),
    }
    let stats = memory_stats(&ProcessMemory::default())?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

struct GenerateArgs {
    config: PathBuf,
    weights: Option<PathBuf>,
    prompt_ids: Vec<u32>,
    prompt: Option<String>,
    tokenizer: Option<PathBuf>,
    max_new_tokens: usize,
    preallocated: bool,
    seed: Option<u64>,
    dtype: DType,
    topology: TensorParallel,
}

/// Command-line values win over `RANK` / `WORLD_SIZE`.
fn resolve_topology(rank: Option<usize>, world_size: Option<usize>) -> Result<TensorParallel> {
    let env = TensorParallel::from_env()?;
    let topology = TensorParallel::new(rank.unwrap_or(env.rank), world_size.unwrap_or(env.world_size));
    if topology.world_size > 1 {
        bail!(
            "world size {} needs a cross-rank reduction between processes, which `bloom generate` does not provide",
            topology.world_size
        );
    }
    Ok(topology)
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let device = Device::Cpu;
    if let Some(seed) = args.seed {
        set_seed(seed, &device);
    }

    let config = BloomConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let options = ModelOptions::new(args.dtype, device.clone()).with_tensor_parallel(args.topology);
    let model = match &args.weights {
        Some(path) => {
            // SAFETY: the checkpoint is treated as read-only for the lifetime of the mapping.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], args.dtype, &device)? };
            BloomForCausalLM::load(config, options, vb)?
        }
        None => {
            log::warn!("no --weights given, generating with random parameters");
            BloomForCausalLM::random(config, options)?.0
        }
    };

    let tokenizer = args
        .tokenizer
        .as_ref()
        .map(|path| Tokenizer::from_file(path).map_err(anyhow::Error::msg))
        .transpose()?;
    let prompt_ids = match (&args.prompt, &tokenizer) {
        (Some(text), Some(tokenizer)) => tokenizer
            .encode(text.as_str(), false)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec(),
        _ => args.prompt_ids.clone(),
    };
    if prompt_ids.is_empty() {
        bail!("an empty prompt was given, pass --prompt-ids or --prompt");
    }

    let input = Tensor::new(prompt_ids.as_slice(), &device)?.unsqueeze(0)?;
    let strategy = if args.preallocated {
        CacheStrategy::Preallocated
    } else {
        CacheStrategy::Concat
    };
    let output = generate_greedy(&model, &input, args.max_new_tokens, strategy)?;

    let ids: Vec<u32> = output
        .tokens
        .get(0)?
        .to_vec1::<i64>()?
        .into_iter()
        .map(|id| id as u32)
        .collect();
    println!("{}", serde_json::to_string(&ids)?);
    if let Some(tokenizer) = &tokenizer {
        println!("{}", tokenizer.decode(&ids, true).map_err(anyhow::Error::msg)?);
    }
    println!("{}", serde_json::to_string_pretty(&output.metrics)?);
    Ok(())
}

fn main() -> Result<()> {
    runtime::init_logging();
    let cli = Cli::parse();
    match cli.command {
        Command::Check { package } => run_check(package),
        Command::Generate {
            config,
            weights,
            prompt_ids,
            prompt,
            tokenizer,
            max_new_tokens,
            preallocated,
            seed,
            dtype,
            world_size,
            rank,
        } => run_generate(GenerateArgs {
            config,
            weights,
            prompt_ids,
            prompt,
            tokenizer,
            max_new_tokens,
            preallocated,
            seed,
            dtype: dtype.into(),
            topology: resolve_topology(rank, world_size)?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_rank_generation_is_refused() {
        assert!(resolve_topology(Some(0), Some(2)).is_err());
        let single = resolve_topology(Some(0), Some(1)).unwrap();
        assert_eq!(single, TensorParallel::single());
    }
}
