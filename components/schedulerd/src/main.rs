// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use gpushare_scheduler::{config, daemon, logging, server, watcher, SchedulerConfig, SharedScheduler};

#[derive(Parser)]
#[command(author, version, about = "Per-GPU time-sharing scheduler daemon", long_about = None)]
struct Args {
    /// Port to listen on for hook / pod-manager connections
    #[arg(short = 'P', long, default_value_t = 50051)]
    port: u16,

    /// Default quota in milliseconds, granted while no burst estimate exists
    #[arg(short = 'q', long, default_value_t = 250.0)]
    quota: f64,

    /// Lower bound for the adaptive quota, in milliseconds
    #[arg(short = 'm', long = "min_quota", default_value_t = 100.0)]
    min_quota: f64,

    /// Sliding usage window, in milliseconds
    #[arg(short = 'w', long = "window", default_value_t = 10000.0)]
    window: f64,

    /// Resource limit file name
    #[arg(short = 'f', long = "limit_file", default_value = "resource-config.txt")]
    limit_file: String,

    /// Directory containing (and watched for) the limit file
    #[arg(short = 'p', long = "limit_file_dir", default_value = ".")]
    limit_file_dir: PathBuf,

    /// Verbosity: 0 = info, 1 = debug, 2+ = trace (RUST_LOG overrides)
    #[arg(short = 'v', long = "verbose", default_value_t = 0)]
    verbose: u8,

    /// Write the full grant history as JSON to this file on shutdown
    #[arg(long = "dump_history")]
    dump_history: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);
    validate_args(&args)?;

    let config = SchedulerConfig {
        port: args.port,
        base_quota: args.quota,
        min_quota: args.min_quota,
        window_size: args.window,
        limit_file: args.limit_file,
        limit_file_dir: args.limit_file_dir,
        verbosity: args.verbose,
        history_dump: args.dump_history,
    };
    tracing::info!(
        quota_ms = config.base_quota,
        min_quota_ms = config.min_quota,
        window_ms = config.window_size,
        limit_file = %config.limit_file_path().display(),
        "scheduler settings"
    );

    let limits = config::load_limits(&config).context("failed to load resource limits")?;
    tracing::info!(clients = limits.len(), "loaded resource limits");

    let port = config.port;
    let shared = Arc::new(SharedScheduler::new(config, limits));
    let cancel = CancellationToken::new();

    let (_watcher, watcher_task) = watcher::spawn(Arc::clone(&shared), cancel.child_token())
        .context("failed to start limit file watcher")?;
    let daemon_task = tokio::spawn(daemon::run(Arc::clone(&shared), cancel.child_token()));

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("cannot bind port {port}"))?;
    tracing::info!(port, "waiting for incoming connections");
    let mut server_task = tokio::spawn(server::run(
        Arc::clone(&shared),
        listener,
        cancel.child_token(),
    ));

    tokio::select! {
        res = &mut server_task => {
            cancel.cancel();
            res.context("server task panicked")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
            cancel.cancel();
            let _ = server_task.await;
        }
    }

    let _ = daemon_task.await;
    let _ = watcher_task.await;

    if let Some(path) = &shared.config().history_dump {
        if let Some(json) = shared.dump_history_json().await {
            std::fs::write(path, json)
                .with_context(|| format!("failed to write history dump {}", path.display()))?;
            tracing::info!(path = %path.display(), "history dumped");
        }
    }

    Ok(())
}

fn validate_args(args: &Args) -> Result<()> {
    if args.quota <= 0.0 {
        bail!("--quota must be greater than 0");
    }
    if args.min_quota <= 0.0 {
        bail!("--min_quota must be greater than 0");
    }
    if args.window <= 0.0 {
        bail!("--window must be greater than 0");
    }
    Ok(())
}
