//! grpo-train - GRPO fine-tuning of a causal language model on GSM8K.
//!
//! Reads a YAML training configuration, loads GSM8K and the policy model with a LoRA
//! adapter, runs group-relative policy optimization and saves the adapter, tokenizer
//! and a training manifest to the configured output directory.

mod pipeline;

use clap::Parser;
use grpo_training::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "grpo-train",
    author,
    version,
    about = "Fine-tune a language model on GSM8K with GRPO"
)]
struct Args {
    /// Path to the training configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let summary = pipeline::run(&args.config).await?;

    info!(
        job_id = %summary.job_id,
        global_step = summary.global_step,
        training_loss = summary.training_loss,
        manifest = %summary.manifest_path.display(),
        "Run complete"
    );
    println!("{}", summary.output_dir.display());
    Ok(())
}
