//! chunkferry command-line entry point.
//!
//! Uploads the given files and prints one line per status change. Ctrl-C
//! pauses running uploads so their progress survives for the next run.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chunkferry_transfer::{FileResumeStore, TransferStatus};
use chunkferry_uploader::{
    HttpRemote, TransferEvent, TransferRegistry, UploadConfig, default_config_path,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chunkferry", version, about = "Resumable chunked file uploads")]
struct Args {
    /// Files to upload.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Config file (defaults to the platform config directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base URL of the remote service.
    #[arg(long)]
    api_base: Option<String>,

    /// Chunk size in bytes.
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Chunk transfers in flight per file.
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    tracing::info!(api = %config.api_base, files = args.files.len(), "starting chunkferry");

    let rt = tokio::runtime::Runtime::new()?;
    let failed = rt.block_on(run(config, args.files))?;

    if failed > 0 {
        anyhow::bail!("{failed} upload(s) did not complete");
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<UploadConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path().context("no config directory available")?,
    };
    let mut config = UploadConfig::load_or_create(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    if let Some(api_base) = &args.api_base {
        config.api_base = api_base.clone();
    }
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent = concurrency;
    }
    config.validate()?;
    Ok(config)
}

/// Uploads `files` and returns how many did not succeed.
async fn run(config: UploadConfig, files: Vec<PathBuf>) -> anyhow::Result<usize> {
    let store = FileResumeStore::open(config.resume_path.clone())
        .with_context(|| format!("opening {}", config.resume_path.display()))?;
    let remote = HttpRemote::new(&config)?;

    let mut registry = TransferRegistry::new(config, Arc::new(remote), Arc::new(store))?;
    let mut events = registry
        .take_events()
        .context("event receiver already taken")?;

    let added = registry.add_many(&files).await?;
    let mut pending: HashSet<String> = added.iter().map(|t| t.id.clone()).collect();
    for transfer in &added {
        registry.start(&transfer.id)?;
    }

    let mut failed = 0;
    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match &event {
                    TransferEvent::StatusChanged(t) => {
                        println!("{:<24} {}", t.name, t.status);
                    }
                    TransferEvent::Succeeded { transfer, url } => {
                        println!("{:<24} stored at {url}", transfer.name);
                        pending.remove(&transfer.id);
                    }
                    TransferEvent::Failed { transfer, error } => {
                        println!("{:<24} failed: {error}", transfer.name);
                        pending.remove(&transfer.id);
                        failed += 1;
                    }
                    TransferEvent::Progress(_) | TransferEvent::HashProgress(_) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                for transfer in registry.list() {
                    if transfer.status == TransferStatus::Uploading {
                        registry.pause(&transfer.id)?;
                        println!("{:<24} paused at {}%", transfer.name, transfer.progress);
                    }
                }
                failed += pending.len();
                break;
            }
        }
    }

    registry.destroy();
    Ok(failed)
}
