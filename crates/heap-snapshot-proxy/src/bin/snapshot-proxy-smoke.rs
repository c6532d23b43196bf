use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use heap_snapshot_proxy::{ProxyConfig, WorkerChannel, WorkerProcessConfig, WorkerProxy};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Load a heap snapshot through an out-of-process worker and report its summary.
#[derive(Parser, Debug)]
struct Args {
    /// Serialized heap snapshot to stream into the worker.
    #[arg(long)]
    snapshot: PathBuf,

    /// Worker program. Defaults to `HEAP_SNAPSHOT_WORKER_BIN`.
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Extra worker argument; repeatable.
    #[arg(long = "worker-arg")]
    worker_args: Vec<String>,

    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,

    #[arg(long, default_value_t = 1)]
    profile_uid: u64,

    /// Seconds to wait for the built snapshot after closing the loader.
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Also fetch heap statistics.
    #[arg(long)]
    statistics: bool,

    /// Write the JSON report here instead of logging it.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.chunk_size == 0 {
        return Err(anyhow!("--chunk-size must be positive"));
    }

    let proxy_config = ProxyConfig::from_env().context("load proxy config")?;
    let worker_config = match args.worker {
        Some(program) => WorkerProcessConfig {
            args: args.worker_args,
            ..WorkerProcessConfig::new(program)
        },
        None => WorkerProcessConfig::from_env().context("load worker config")?,
    };

    let channel = WorkerChannel::spawn(&worker_config)
        .with_context(|| format!("spawn worker {}", worker_config.program.display()))?;
    let (proxy, mut channels) =
        WorkerProxy::new(channel, proxy_config).context("start worker proxy")?;
    proxy.start_checking_for_long_running_calls()?;

    tokio::spawn(async move {
        while let Some(event) = channels.events.recv().await {
            info!(event = %event.name, data = %event.data, "worker event");
        }
    });
    let mut waiting = channels.waiting;
    tokio::spawn(async move {
        while waiting.changed().await.is_ok() {
            if *waiting.borrow_and_update() {
                warn!("worker is busy with a long-running call");
            }
        }
    });

    let text = tokio::fs::read_to_string(&args.snapshot)
        .await
        .with_context(|| format!("read snapshot {}", args.snapshot.display()))?;

    let (snapshot_tx, snapshot_rx) = oneshot::channel();
    let loader = proxy.create_loader(args.profile_uid, move |snapshot| {
        let _ = snapshot_tx.send(snapshot);
    })?;

    let chunks = split_chunks(&text, args.chunk_size);
    for (index, chunk) in chunks.iter().enumerate() {
        loader
            .write_async(chunk)
            .await
            .with_context(|| format!("write chunk {index}"))?;
    }
    info!(chunks = chunks.len(), bytes = text.len(), "snapshot streamed");

    loader.close_async().await.context("close loader")?;
    let snapshot = tokio::time::timeout(Duration::from_secs(args.timeout_secs), snapshot_rx)
        .await
        .context("timed out waiting for the built snapshot")?
        .context("worker dropped the snapshot")?;

    let mut report = json!({
        "profileUid": snapshot.uid(),
        "objectId": snapshot.object_id(),
        "staticData": snapshot.static_data(),
    });
    if args.statistics {
        let statistics = snapshot.get_statistics().await.context("get statistics")?;
        report["statistics"] = serde_json::to_value(statistics)?;
    }

    let rendered = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, rendered)
                .await
                .with_context(|| format!("write report {}", path.display()))?;
            info!(path = %path.display(), "report written");
        }
        None => info!(report = %rendered, "snapshot loaded"),
    }

    proxy.dispose();
    Ok(())
}

/// Split `text` into pieces of at most `size` bytes without cutting a UTF-8
/// sequence. A single character wider than `size` gets its own piece.
fn split_chunks(text: &str, size: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}
