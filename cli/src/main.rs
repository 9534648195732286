//! chainstream CLI — run and inspect block event streams.
//!
//! Usage:
//! ```bash
//! # Run the supervised stream until Ctrl-C (event batches go to stdout as JSON lines)
//! chainstream run --config stream.json
//!
//! # Run a single session attempt
//! chainstream run --config stream.json --once
//!
//! # Show, move or clear the stored checkpoint
//! chainstream checkpoint --config stream.json
//! chainstream checkpoint --config stream.json --set 1200000
//! chainstream checkpoint --config stream.json --clear
//!
//! # Query a node's latest height
//! chainstream head --url http://localhost:26657
//! ```

mod config;

use std::env;
use std::io::Write;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;

use chainstream_core::{
    BatchHandler, CancellationToken, CheckpointManager, CheckpointStore, EventBatch, NodeSource,
    StreamError, Supervisor, TickOutcome,
};
use chainstream_cosmos::{CometConfig, CometNode};
use chainstream_storage::Backends;

use crate::config::{init_tracing, AppConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "checkpoint" => cmd_checkpoint(&args[2..]).await,
        "head" => cmd_head(&args[2..]).await,
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainstream {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainstream {}", env!("CARGO_PKG_VERSION"));
    println!("Supervised event streaming from CometBFT chains\n");
    println!("USAGE:");
    println!("    chainstream <COMMAND>\n");
    println!("COMMANDS:");
    println!("    run         Run the stream (backfill, then live) under the lock");
    println!("    checkpoint  Show or change the stored checkpoint");
    println!("    head        Print a node's latest block height");
    println!("    info        Show defaults and supported backends");
    println!("    version     Print version");
    println!("    help        Print this help\n");
    println!("RUN FLAGS:");
    println!("    --config <FILE>   JSON config file  [required]");
    println!("    --once            Run one session attempt, then exit\n");
    println!("CHECKPOINT FLAGS:");
    println!("    --config <FILE>   JSON config file  [required]");
    println!("    --set <HEIGHT>    Overwrite the checkpoint");
    println!("    --clear           Delete the checkpoint\n");
    println!("HEAD FLAGS:");
    println!("    --url <URL>       CometBFT RPC URL  [required]");
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let path = parse_flag(args, "--config").ok_or_else(|| anyhow!("--config is required"))?;
    let config = AppConfig::load(&path)?;
    init_tracing(&config.log);

    let node: Arc<dyn NodeSource> = Arc::new(CometNode::new(config.node.clone())?);
    let backends =
        Backends::connect_with(&config.storage.url, &config.storage.pool_options()).await?;
    let supervisor = Supervisor::new(
        node,
        Arc::new(JsonLinesHandler),
        backends.checkpoints,
        backends.locks,
        config.stream.clone(),
    )?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            on_signal.cancel();
        }
    });

    tracing::info!(
        stream = %config.stream.stream_id,
        owner = supervisor.owner(),
        node = %config.node.rpc_url,
        storage = %config.storage.url,
        "chainstream starting"
    );

    if has_flag(args, "--once") {
        match supervisor.tick(&shutdown).await? {
            TickOutcome::Disabled => eprintln!("stream is disabled"),
            TickOutcome::Skipped => eprintln!("lock '{}' is held elsewhere", config.stream.lock_name),
            TickOutcome::Completed(summary) => {
                eprintln!("{}", serde_json::to_string(&summary)?);
            }
        }
    } else {
        supervisor.run_scheduled(shutdown).await;
    }
    Ok(())
}

async fn cmd_checkpoint(args: &[String]) -> anyhow::Result<()> {
    let path = parse_flag(args, "--config").ok_or_else(|| anyhow!("--config is required"))?;
    let config = AppConfig::load(&path)?;
    let backends =
        Backends::connect_with(&config.storage.url, &config.storage.pool_options()).await?;
    let stream_id = config.stream.stream_id.as_str();
    let manager = CheckpointManager::new(backends.checkpoints.clone(), stream_id);

    if has_flag(args, "--clear") {
        backends.checkpoints.delete(stream_id).await?;
        println!("{stream_id}: checkpoint cleared");
        return Ok(());
    }
    if let Some(raw) = parse_flag(args, "--set") {
        let height: u64 = raw
            .parse()
            .with_context(|| format!("--set expects a block height, got {raw:?}"))?;
        manager.commit(height).await?;
        println!("{stream_id}: checkpoint set to {height}");
        return Ok(());
    }

    match manager.load().await? {
        Some(height) => println!("{stream_id}: last dispatched height {height}"),
        None => println!(
            "{stream_id}: no checkpoint (next session starts at {})",
            start_label(config.stream.epoch_height)
        ),
    }
    Ok(())
}

async fn cmd_head(args: &[String]) -> anyhow::Result<()> {
    let url = parse_flag(args, "--url").ok_or_else(|| anyhow!("--url is required"))?;
    let node = CometNode::new(CometConfig::new(url.clone()))?;

    let start = std::time::Instant::now();
    let height = node.latest_height().await?;
    let latency = start.elapsed();

    println!("Node:    {url}");
    println!("Height:  {height}");
    println!("Latency: {}ms", latency.as_millis());
    Ok(())
}

fn cmd_info() {
    let defaults = chainstream_core::StreamConfig::default();
    println!("ChainStream v{}", env!("CARGO_PKG_VERSION"));
    println!("  Backfill chunk size:   {} blocks", defaults.backfill_chunk_size);
    println!("  Backfill concurrency:  {} workers", defaults.backfill_concurrency);
    println!("  Watchdog interval:     {}ms", defaults.watchdog_interval_ms);
    println!("  Lock lease:            {}ms", defaults.lock_lease_ms);
    println!("  Schedule interval:     {}ms", defaults.schedule_interval_ms);
    println!("  Storage backends:      memory, sqlite:<path>, postgres://");
    println!("  Nodes:                 CometBFT / Tendermint RPC (HTTP + websocket)");
}

// ─── Output handler ──────────────────────────────────────────────────────────

/// Writes each batch to stdout as one JSON line.
struct JsonLinesHandler;

#[async_trait]
impl BatchHandler for JsonLinesHandler {
    async fn on_batch(&self, batch: &EventBatch) -> Result<(), StreamError> {
        let line = serde_json::to_string(batch).map_err(|e| StreamError::Handler {
            height: batch.height,
            reason: e.to_string(),
        })?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|e| StreamError::Handler {
                height: batch.height,
                reason: format!("stdout: {e}"),
            })
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn start_label(epoch: u64) -> String {
    if epoch == 0 {
        "the chain head".into()
    } else {
        format!("height {epoch}")
    }
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}
