//! VAR sampling CLI — class-conditional token pyramids.
//!
//! Loads a VAR transformer and its multi-scale codebook from safetensors and
//! samples one token pyramid per batch entry.
//!
//! # Output
//!
//! One JSON object per sample on stdout:
//!
//! ```json
//! {"sample":0,"label":207,"stages":[[1234],[5,6,7,8],...]}
//! ```
//!
//! With `--output` the same lines are written to that file instead.
//! Exit code 0 on success, non-zero on error.

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use var_rs::{
    codebook::VectorQuantizer,
    config::{CodebookConfig, VarConfig},
    manager::preferred_device,
    model::{GenerationParams, LabelSpec, OutputMode, VarModel},
};

#[derive(Parser, Debug)]
#[command(
    name = "var-sample",
    about = "Sample class-conditional token pyramids with a VAR model",
    long_about = "Generate coarse-to-fine code index pyramids from a pretrained VAR checkpoint.\n\
                  Each sample is printed as one JSON line."
)]
struct Args {
    /// VAR model config (JSON). Omit for the d16 defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model depth preset, used when --config is omitted.
    #[arg(long, default_value_t = 16)]
    depth: usize,

    /// VAR transformer weights (safetensors). Repeat for sharded checkpoints.
    #[arg(long, short = 'w', required = true)]
    weights: Vec<PathBuf>,

    /// Codebook config (JSON). Omit for the 4096×32 defaults.
    #[arg(long)]
    codebook_config: Option<PathBuf>,

    /// Codebook weights (safetensors).
    #[arg(long, required = true)]
    codebook: Vec<PathBuf>,

    /// Number of samples.
    #[arg(long, short = 'b', default_value_t = 1)]
    batch: usize,

    /// Class for every sample. Negative means unconditional; omit for random classes.
    #[arg(long, allow_hyphen_values = true)]
    class: Option<i64>,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 1.5)]
    cfg: f64,

    /// Keep only the k most likely codes (0 disables).
    #[arg(long, default_value_t = 0)]
    top_k: usize,

    /// Nucleus sampling mass (0 disables).
    #[arg(long, default_value_t = 0.0)]
    top_p: f64,

    /// Gumbel-softmax blend strength (0 samples hard indices).
    #[arg(long, default_value_t = 0.0)]
    gumbel: f64,

    /// Logit temperature.
    #[arg(long, default_value_t = 1.0)]
    temperature: f64,

    /// CUDA device ordinal.
    #[arg(long, default_value_t = 0)]
    cuda_device: usize,

    /// Write JSON lines here instead of stdout.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.batch == 0 {
        anyhow::bail!("batch must be at least 1");
    }
    if !(0.0..=1.0).contains(&args.top_p) {
        anyhow::bail!("top-p must be in [0, 1], got {}", args.top_p);
    }
    if args.temperature <= 0.0 {
        anyhow::bail!("temperature must be positive, got {}", args.temperature);
    }

    let config = match &args.config {
        Some(path) => VarConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to read model config: {e}"))?,
        None => VarConfig::for_depth(args.depth),
    };
    let codebook_config = match &args.codebook_config {
        Some(path) => CodebookConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to read codebook config: {e}"))?,
        None => CodebookConfig {
            vocab_size: config.vocab_size,
            codebook_dim: config.codebook_dim,
            patch_nums: config.patch_nums.clone(),
            ..CodebookConfig::default()
        },
    };

    let device = preferred_device(args.cuda_device);
    let dtype = candle_core::DType::F32;
    tracing::info!("Using device: {:?}", device);

    let mut model = VarModel::load(config, &args.weights, &device, dtype)
        .map_err(|e| anyhow::anyhow!("failed to load model: {e}"))?;
    let codebook = VectorQuantizer::load(&codebook_config, &args.codebook, &device, dtype)
        .map_err(|e| anyhow::anyhow!("failed to load codebook: {e}"))?;

    let params = GenerationParams {
        batch: args.batch,
        label: args.class.map_or(LabelSpec::Random, LabelSpec::Class),
        seed: args.seed,
        cfg: args.cfg,
        top_k: args.top_k,
        top_p: args.top_p,
        output: OutputMode::Indices,
        gumbel: args.gumbel,
        temperature: args.temperature,
    };

    tracing::info!(
        "Sampling {} pyramid(s) over {} stages...",
        params.batch,
        model.layout().num_stages()
    );
    let generation = model
        .generate(&codebook, &params)
        .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;
    let indices = generation.indices()?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            Box::new(std::io::BufWriter::new(std::fs::File::create(path)?))
        }
        None => Box::new(std::io::stdout().lock()),
    };
    for (sample, (label, stages)) in generation.labels.iter().zip(indices).enumerate() {
        let line = serde_json::json!({
            "sample": sample,
            "label": label,
            "stages": stages,
        });
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    Ok(())
}
