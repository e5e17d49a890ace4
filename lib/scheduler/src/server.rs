// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP front end: the accept loop and per-connection handler tasks.
//!
//! Each accepted socket gets one handler. The handler owns the socket for its
//! whole life: a reader loop pulls fixed-size request frames, and a writer
//! task drains the connection's reply channel — the daemon only ever holds a
//! cloned sender into that channel, never the socket itself.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocols::{self, Request, RequestBody, Response, REQ_MSG_LEN};
use crate::state::{Reply, ReplySender, SharedScheduler};

const MAX_SEND_ATTEMPTS: usize = 5;
const SEND_RETRY_SPACING: Duration = Duration::from_millis(3);

/// Accept connections until cancelled, spawning one handler task each.
pub async fn run(
    shared: Arc<SharedScheduler>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("accept loop stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = accepted.context("accept failed")?;
                tracing::info!(%addr, "accepted client connection");
                let shared = Arc::clone(&shared);
                let child = cancel.child_token();
                tokio::spawn(async move {
                    handle_connection(shared, stream, child).await;
                });
            }
        }
    }
}

/// Service one client socket until EOF, read error, or shutdown.
async fn handle_connection(
    shared: Arc<SharedScheduler>,
    stream: TcpStream,
    cancel: CancellationToken,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (mut reader, writer) = stream.into_split();

    let (reply_tx, reply_rx) = mpsc::channel::<Reply>(64);
    let writer_task = tokio::spawn(write_loop(writer, reply_rx));

    let mut frame = [0u8; REQ_MSG_LEN];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read_exact(&mut frame) => {
                match read {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                        tracing::debug!(peer = %peer, "connection closed by client");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "read failed, closing connection");
                        break;
                    }
                }
                match protocols::parse_request(&frame) {
                    Ok(request) => dispatch(&shared, request, &reply_tx).await,
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "dropping malformed request frame"),
                }
            }
        }
    }

    // closing the channel lets the writer drain outstanding replies and exit
    drop(reply_tx);
    let _ = writer_task.await;
}

async fn dispatch(shared: &SharedScheduler, request: Request, reply_tx: &ReplySender) {
    match request.body {
        RequestBody::Quota {
            overuse_ms,
            burst_ms,
        } => {
            // no immediate reply; the daemon answers once a token is granted
            let known = shared
                .submit_quota_request(
                    &request.client,
                    request.req_id,
                    overuse_ms,
                    burst_ms,
                    reply_tx.clone(),
                )
                .await;
            if !known {
                tracing::warn!(client = %request.client, "unknown client, ignoring quota request");
            }
        }
        RequestBody::MemLimit => match shared.mem_snapshot(&request.client).await {
            Some((used, limit)) => {
                send_reply(
                    reply_tx,
                    Reply {
                        req_id: request.req_id,
                        body: Response::MemLimit { used, limit },
                    },
                )
                .await;
            }
            None => {
                tracing::warn!(client = %request.client, "unknown client, ignoring memory query");
            }
        },
        RequestBody::MemUpdate { bytes, is_allocate } => {
            match shared
                .apply_mem_update(&request.client, bytes, is_allocate)
                .await
            {
                Some(verdict) => {
                    tracing::debug!(
                        client = %request.client,
                        bytes,
                        is_allocate,
                        verdict,
                        "memory update"
                    );
                    send_reply(
                        reply_tx,
                        Reply {
                            req_id: request.req_id,
                            body: Response::MemUpdate { verdict },
                        },
                    )
                    .await;
                }
                None => {
                    tracing::warn!(client = %request.client, "unknown client, ignoring memory update");
                }
            }
        }
    }
}

async fn send_reply(reply_tx: &ReplySender, reply: Reply) {
    if reply_tx.send(reply).await.is_err() {
        tracing::warn!("reply channel closed before response could be queued");
    }
}

/// Encode and write replies, retrying transient send failures.
async fn write_loop(mut writer: OwnedWriteHalf, mut reply_rx: mpsc::Receiver<Reply>) {
    while let Some(reply) = reply_rx.recv().await {
        let frame = protocols::encode_response(reply.req_id, &reply.body);
        if let Err(e) = send_with_retry(&mut writer, &frame).await {
            tracing::warn!(
                error = %e,
                "giving up on response after {MAX_SEND_ATTEMPTS} attempts"
            );
        }
    }
}

async fn send_with_retry(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    let mut last_error = None;
    for attempt in 1..=MAX_SEND_ATTEMPTS {
        match write_frame(writer, frame).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "send attempt failed");
                last_error = Some(e);
                if attempt < MAX_SEND_ATTEMPTS {
                    tokio::time::sleep(SEND_RETRY_SPACING).await;
                }
            }
        }
    }
    Err(last_error.expect("at least one attempt was made"))
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
