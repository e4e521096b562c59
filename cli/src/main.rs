//! fetchcore — process entry point.
//!
//! Loads configuration, builds the shared [`fetchcore_core::FetcherContext`], and drives two
//! surfaces against it concurrently: the queue-mode [`fetchcore_core::ServiceShell`] and the RPC
//! HTTP bridge. Both consume the same async core; see `fetchcore_core::rpc` and
//! `fetchcore_core::shell` for the respective protocols.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use fetchcore_config::FetcherConfig;
use fetchcore_core::{FetcherContext, RpcState, ServiceShell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::try_new("warn").expect("warn filter is valid"));

    let (log_file, init_warnings) = open_fetchcore_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // If we can't open a log file, fall back to stdout rather than silently dropping logs.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();
}

fn open_fetchcore_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let candidates = fetchcore_log_file_candidates();
    let mut warnings = Vec::new();

    for candidate in candidates {
        if let Some(parent) = candidate.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warnings.push(format!("failed to create log dir {}: {e}", parent.display()));
                continue;
            }
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!("failed to open log file {}: {e}", candidate.display())),
        }
    }

    (None, warnings)
}

/// Resolve the config file path: an explicit `--config <path>` flag wins, then the
/// `FETCHCORE_CONFIG` environment variable, then the platform default config directory.
fn resolve_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--config=") {
            return Ok(PathBuf::from(value));
        }
        if arg == "--config" {
            let value = args.next().context("--config requires a path argument")?;
            return Ok(PathBuf::from(value));
        }
    }

    if let Ok(value) = std::env::var("FETCHCORE_CONFIG") {
        return Ok(PathBuf::from(value));
    }

    FetcherConfig::default_path().context("resolving default config path")
}

fn fetchcore_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(config_dir) = dirs::config_dir() {
        candidates.push(config_dir.join("fetchcore").join("logs").join("fetchcore.log"));
    }

    // Fallback for constrained environments with no config dir (containers without $HOME set).
    candidates.push(PathBuf::from(".fetchcore").join("logs").join("fetchcore.log"));

    candidates
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = resolve_config_path()?;
    let config = FetcherConfig::load(&config_path).context("loading fetchcore.toml")?;
    let resolved = config.resolve().context("resolving configuration")?;

    let rpc_listen_addr = resolved.shell.rpc_listen_addr.clone();

    let ctx = Arc::new(FetcherContext::new(resolved).context("building fetcher context")?);
    let background = ctx.spawn_background_loops();

    let (input_tx, input_rx) = tokio::sync::mpsc::channel(256);
    let (mut shell, mut output_rx) = ServiceShell::new(Arc::clone(&ctx), input_rx);

    let shell_handle = tokio::spawn(async move {
        shell.run().await;
    });

    let drain_results = tokio::spawn(async move {
        let mut delivered = 0u64;
        while output_rx.recv().await.is_some() {
            delivered += 1;
        }
        delivered
    });

    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    let rpc_state = RpcState::new(Arc::clone(&ctx), Arc::clone(&shutdown_notify));
    let router = fetchcore_core::rpc_router(rpc_state);
    let listener = tokio::net::TcpListener::bind(&rpc_listen_addr)
        .await
        .with_context(|| format!("binding RPC listener on {rpc_listen_addr}"))?;
    tracing::info!(addr = %rpc_listen_addr, "RPC bridge listening");

    let serve = axum::serve(listener, router);
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                tracing::error!(error = %e, "RPC listener stopped unexpectedly");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        () = shutdown_notify.notified() => {
            tracing::info!("RPC _quit triggered shutdown");
        }
    }

    drop(input_tx);
    let _ = shell_handle.await;
    let delivered = drain_results.await.unwrap_or(0);
    tracing::info!(delivered, "queue-mode output drained");

    for handle in background {
        handle.abort();
    }

    Ok(())
}
