// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hot reload of the resource limit file.
//!
//! A filesystem watcher observes the limit-file directory; when the file is
//! written, a tick crosses into async land and the registry is reloaded.
//! Reload failures keep the previous limit table in effect.

use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::state::SharedScheduler;

/// Start watching the limit-file directory.
///
/// Returns the watcher handle (dropping it stops the watch — keep it alive
/// for the process lifetime) and the reload task.
pub fn spawn(
    shared: Arc<SharedScheduler>,
    cancel: CancellationToken,
) -> Result<(RecommendedWatcher, JoinHandle<()>)> {
    let dir = shared.config().limit_file_dir.clone();
    let file_name = shared.config().limit_file.clone();

    let (tick_tx, mut tick_rx) = mpsc::channel::<()>(8);
    let watched_name = file_name.clone();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                let is_limit_file = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().and_then(|n| n.to_str()) == Some(watched_name.as_str()));
                if is_limit_file && (event.kind.is_modify() || event.kind.is_create()) {
                    // a full channel already carries a pending reload
                    let _ = tick_tx.try_send(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "limit file watch error"),
        }
    })
    .context("failed to create limit file watcher")?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    tracing::info!(dir = %dir.display(), file = %file_name, "watching limit file");

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                tick = tick_rx.recv() => {
                    if tick.is_none() {
                        break;
                    }
                    tracing::info!("limit file changed, reloading client limits");
                    match config::load_limits(shared.config()) {
                        Ok(entries) => shared.reload_limits(entries).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "limit file reload failed, keeping previous limits");
                        }
                    }
                }
            }
        }
    });

    Ok((watcher, task))
}
