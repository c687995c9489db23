//! quorumlog - Quorum-committed write-ahead log
//!
//! Runs a writer node: every line read from stdin becomes one transaction,
//! durable once a quorum of journal directories has it.

use quorumlog_node::{run_metrics_server, Config, Node};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if QUORUMLOG_CONFIG is set, then env overrides)
    let config_path = std::env::var("QUORUMLOG_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::from_env()
        }
    };

    tracing::info!("Starting quorumlog writer");
    tracing::info!("  Data directory: {}", config.journal.data_dir.display());
    tracing::info!(
        "  Quorum: {} of {} journals",
        config.journal.minimum_redundant_targets,
        config.journal.journal_dirs().len()
    );
    tracing::info!(
        "  Sync buffer: {} bytes, period {} ms",
        config.log.sync_buffer_size,
        config.log.sync_period_ms
    );

    let node = Arc::new(Node::open(config)?);
    let segment = node.start_writer()?;
    tracing::info!("  Writing segment starting at txid {}", segment);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Spawn metrics server
    let metrics_handle = if node.config().metrics.enabled {
        let addr = node.config().metrics.bind_addr;
        tracing::info!("  Metrics: enabled on {}", addr);
        let metrics = Arc::clone(node.metrics());
        let shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown_rx).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    // Periodic sync and statistics
    let ticker_handle = {
        let node = Arc::clone(&node);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let period = match node.config().log.sync_period() {
            p if p.is_zero() => Duration::from_secs(1),
            p => p,
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }
                let node = Arc::clone(&node);
                let result = tokio::task::spawn_blocking(move || {
                    let result = node.log().sync_all();
                    node.log().print_statistics(false);
                    node.observe_metrics();
                    result
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Periodic sync failed: {}", e),
                    Err(e) => tracing::error!("Periodic sync task panicked: {}", e),
                }
            }
        })
    };

    // Ingest stdin on a dedicated thread; the edit log blocks on quorum writes.
    let (eof_tx, eof_rx) = oneshot::channel::<()>();
    {
        let node = Arc::clone(&node);
        std::thread::Builder::new()
            .name("stdin-ingest".to_string())
            .spawn(move || {
                ingest(&node);
                let _ = eof_tx.send(());
            })?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping writer...");
        }
        _ = eof_rx => {
            tracing::info!("Input closed, stopping writer...");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = ticker_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    // Close the segment before exit
    let stopping = Arc::clone(&node);
    tokio::task::spawn_blocking(move || {
        if let Err(e) = stopping.log().sync_all() {
            tracing::error!("Failed to sync edit log on shutdown: {}", e);
        }
        stopping.shutdown()
    })
    .await??;

    tracing::info!("Writer stopped");
    Ok(())
}

fn ingest(node: &Node) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to read input: {}", e);
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        if let Err(e) = node.log().log_edit(line) {
            tracing::error!("Failed to log edit: {}", e);
            break;
        }
    }
}
