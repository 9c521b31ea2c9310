//! actbuf-rs CLI: stream a JSONL corpus through a model and sample activation batches

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::Parser;
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use actbuf_rs::{
    ActivationBuffer, Batch, BufferConfig, JsonlTextStream, LinearStack, LinearStackConfig,
    TapMode, TokenizedExtractor,
};

#[derive(Parser)]
#[command(name = "actbuf-rs")]
#[command(about = "Sample activation batches captured at a model layer")]
#[command(version)]
struct Cli {
    /// JSONL corpus with a "text" field per line
    #[arg(short, long, default_value = "corpus/pile.jsonl")]
    data: PathBuf,

    /// Local tokenizer.json, or a HuggingFace repo to download it from
    #[arg(short, long, default_value = "gpt2")]
    tokenizer: String,

    /// Directory with config.json and model.safetensors (random weights if omitted)
    #[arg(short, long)]
    model_dir: Option<PathBuf>,

    /// Hidden sizes for the random model
    #[arg(long, value_delimiter = ',', default_value = "256,256")]
    hidden_sizes: Vec<usize>,

    /// Extraction point
    #[arg(short, long, default_value = "layers.0")]
    point: String,

    /// Tap mode: in, out or in_to_out
    #[arg(long, default_value = "out")]
    io: String,

    /// Input width (inferred from the extraction point if omitted)
    #[arg(long)]
    in_feats: Option<usize>,

    /// Output width (inferred from the extraction point if omitted)
    #[arg(long)]
    out_feats: Option<usize>,

    /// Approximate number of contexts kept in the buffer
    #[arg(long, default_value_t = 30_000)]
    n_ctxs: usize,

    /// Tokens per context
    #[arg(long, default_value_t = 128)]
    ctx_len: usize,

    /// Texts per forward pass when refilling
    #[arg(long, default_value_t = 512)]
    in_batch_size: usize,

    /// Activations per sampled batch
    #[arg(long, default_value_t = 8192)]
    out_batch_size: usize,

    /// Number of batches to draw
    #[arg(short, long, default_value_t = 10)]
    batches: usize,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Write a JSON summary here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize)]
struct BatchStats {
    index: usize,
    rows: usize,
    mean_norm: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    mean_norm_out: Option<f32>,
}

#[derive(Serialize)]
struct Summary {
    point: String,
    io: TapMode,
    buffered: usize,
    unconsumed: usize,
    exhausted: bool,
    batches: Vec<BatchStats>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mode: TapMode = cli.io.parse()?;
    let device = select_device(cli.cpu);

    let tokenizer = load_tokenizer(&cli.tokenizer)?;
    let model = match &cli.model_dir {
        Some(dir) => LinearStack::from_dir(dir, &device)
            .with_context(|| format!("Failed to load model from {}", dir.display()))?,
        None => {
            info!("No model directory given, using random LinearStack weights");
            let config = LinearStackConfig {
                vocab_size: tokenizer.get_vocab_size(true),
                hidden_sizes: cli.hidden_sizes.clone(),
            };
            LinearStack::random(config, &device)?
        }
    };
    info!(
        "Model: {} layers, widths {:?}",
        model.n_layers(),
        model.config().hidden_sizes
    );

    let stream = JsonlTextStream::open(&cli.data)
        .with_context(|| format!("Failed to open corpus {}", cli.data.display()))?;

    let config = BufferConfig {
        point: cli.point.clone(),
        mode,
        in_feats: cli.in_feats,
        out_feats: cli.out_feats,
        n_ctxs: cli.n_ctxs,
        ctx_len: cli.ctx_len,
        in_batch_size: cli.in_batch_size,
        out_batch_size: cli.out_batch_size,
        device,
        seed: cli.seed,
    };
    let mut buffer =
        ActivationBuffer::new(stream, TokenizedExtractor::new(tokenizer, model), config)?;

    let mut stats = Vec::with_capacity(cli.batches);
    for (index, batch) in buffer.by_ref().take(cli.batches).enumerate() {
        let batch = batch?;
        let rows = batch.len();
        let (mean_norm, mean_norm_out) = match batch {
            Batch::Single(acts) => (mean_row_norm(&acts)?, None),
            Batch::Pair { input, output } => {
                (mean_row_norm(&input)?, Some(mean_row_norm(&output)?))
            }
        };
        println!("Batch {index:4}: {rows} rows, mean norm {mean_norm:.4}");
        stats.push(BatchStats {
            index,
            rows,
            mean_norm,
            mean_norm_out,
        });
    }
    if stats.len() < cli.batches {
        println!(
            "Corpus exhausted after {} of {} batches",
            stats.len(),
            cli.batches
        );
    }

    let summary = Summary {
        point: cli.point,
        io: mode,
        buffered: buffer.len(),
        unconsumed: buffer.unconsumed(),
        exhausted: buffer.is_exhausted(),
        batches: stats,
    };
    buffer.close()?;

    if let Some(path) = &cli.output {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&summary)?)?;
        info!("Summary saved to {}", path.display());
    }

    Ok(())
}

fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Load a tokenizer from a local file, falling back to a HuggingFace download
fn load_tokenizer(source: &str) -> Result<Tokenizer> {
    let path = if Path::new(source).is_file() {
        PathBuf::from(source)
    } else {
        info!("Downloading tokenizer from {}", source);
        let api = Api::new()?;
        let repo = api.repo(Repo::new(source.to_string(), RepoType::Model));
        repo.get("tokenizer.json")
            .context("Failed to download tokenizer.json")?
    };
    Tokenizer::from_file(&path).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))
}

/// Mean L2 norm over the rows of an `(n, d)` tensor
fn mean_row_norm(acts: &Tensor) -> Result<f32> {
    if acts.dims()[0] == 0 {
        return Ok(0.0);
    }
    Ok(acts.sqr()?.sum(1)?.sqrt()?.mean_all()?.to_scalar()?)
}
