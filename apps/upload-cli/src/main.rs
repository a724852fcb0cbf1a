//! chunkflow command-line entry point.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chunkflow_chunk_store::{ChunkStore, FsChunkStore, UploadService};
use chunkflow_protocol::{ChunkIndex, FileHash, UploadState};
use chunkflow_transfer::ProgressThrottle;
use chunkflow_uploader::{LocalBackend, UploadOrchestrator};

use config::Overrides;

#[derive(Parser)]
#[command(name = "chunkflow", version, about = "Resumable content-addressed uploads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a file into a chunk store, resuming any earlier attempt.
    Upload {
        file: PathBuf,
        /// Chunk store directory.
        #[arg(long)]
        store: PathBuf,
        /// JSON upload config (camelCase keys).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        chunk_size: Option<u64>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Retries per chunk before the upload fails.
        #[arg(long)]
        retries: Option<u32>,
    },
    /// Show what a chunk store holds for a file hash.
    Inspect {
        hash: String,
        #[arg(long)]
        store: PathBuf,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectReport {
    file_hash: FileHash,
    merged: bool,
    last_contiguous_index: Option<ChunkIndex>,
    artifact_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Upload {
            file,
            store,
            config,
            chunk_size,
            concurrency,
            retries,
        } => {
            let overrides = Overrides {
                chunk_size,
                concurrency,
                retries,
            };
            let config = config::load(config.as_deref(), &overrides)?;
            upload(&file, &store, config).await
        }
        Command::Inspect { hash, store } => inspect(&hash, &store).await,
    }
}

async fn upload(
    file: &Path,
    store_dir: &Path,
    config: chunkflow_uploader::UploadConfig,
) -> anyhow::Result<()> {
    let store = FsChunkStore::open(store_dir)
        .await
        .with_context(|| format!("opening store {}", store_dir.display()))?;
    let service = Arc::new(UploadService::new(Arc::new(store.clone())));
    let backend = Arc::new(LocalBackend::new(service));

    info!(
        file = %file.display(),
        chunk_size = config.chunk_size,
        concurrency = config.concurrency,
        "starting upload"
    );
    let orchestrator = UploadOrchestrator::new(file, backend, config)?;
    let throttle = ProgressThrottle::default();
    orchestrator.on_change(move |snapshot| {
        if throttle.should_emit(snapshot) {
            info!(
                state = %snapshot.state,
                progress = format_args!("{:.1}", snapshot.progress),
                completed = snapshot.completed_chunks,
                chunks = snapshot.chunk_count,
                "upload progress"
            );
        }
    });
    orchestrator.start().await?;

    let done = tokio::select! {
        result = orchestrator.wait_terminal() => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, stored chunks are kept for the next attempt");
            orchestrator.remove();
            bail!("upload interrupted");
        }
    };

    match done.state {
        UploadState::FastUploaded | UploadState::UploadSuccessfully => {
            let hash = done
                .file_hash
                .context("finished upload has no file hash")?;
            println!("{}", store.artifact_path(&hash).display());
            Ok(())
        }
        state => {
            let reason = done
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| state.to_string());
            bail!("upload failed: {reason}")
        }
    }
}

async fn inspect(hash: &str, store_dir: &Path) -> anyhow::Result<()> {
    let file_hash = FileHash::parse(hash)?;
    let store = FsChunkStore::open(store_dir)
        .await
        .with_context(|| format!("opening store {}", store_dir.display()))?;

    let report = InspectReport {
        merged: store.exists(&file_hash).await?,
        last_contiguous_index: store.last_contiguous_index(&file_hash).await?,
        artifact_path: store.artifact_path(&file_hash),
        file_hash,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
