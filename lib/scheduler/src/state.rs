// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared scheduler state: the pending request queue, the live token table,
//! and the handle connection handlers use to reach both.
//!
//! Everything mutable lives in [`SchedulerState`] under a single mutex, so
//! candidate selection, history writes, and token inserts are atomic with
//! respect to every handler. The paired [`Notify`] is the wake-up edge for
//! the scheduling daemon; timed waits derive their deadlines from the same
//! [`Clock`] that stamps the bookkeeping.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};

use crate::client::{Client, ClientLimits};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::history::UsageHistory;
use crate::protocols::Response;
use crate::SM_GLOBAL_LIMIT;

/// A reply queued for a connection's writer task.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub req_id: u64,
    pub body: Response,
}

/// Sending side of a connection's reply channel.
pub type ReplySender = mpsc::Sender<Reply>;

/// A quota request parked until the daemon grants it.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Process-local handle; lets the daemon erase chosen entries by value
    /// instead of juggling queue positions.
    pub seq: u64,
    pub client: String,
    pub req_id: u64,
    pub arrived_ms: f64,
    pub reply: ReplySender,
}

/// An issued, unexpired lease.
#[derive(Debug, Clone)]
pub struct Token {
    pub client: String,
    pub req_id: u64,
    pub sm_partition: u32,
    pub issued_ms: f64,
    pub expires_ms: f64,
}

/// Live lease set plus the global SM occupancy counter.
#[derive(Debug, Default)]
pub struct TokenTable {
    tokens: Vec<Token>,
    sm_occupied: u32,
}

impl TokenTable {
    pub fn sm_occupied(&self) -> u32 {
        self.sm_occupied
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn holds(&self, client: &str) -> bool {
        self.tokens.iter().any(|t| t.client == client)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }

    /// Insert a fresh token, claiming its SM partition.
    pub fn insert(&mut self, token: Token) {
        debug_assert!(
            !self.holds(&token.client),
            "client {} already holds a token",
            token.client
        );
        debug_assert!(self.sm_occupied + token.sm_partition <= SM_GLOBAL_LIMIT);
        self.sm_occupied += token.sm_partition;
        self.tokens.push(token);
    }

    /// Remove every token with `expires_ms <= now`, releasing its partition.
    pub fn sweep_expired(&mut self, now_ms: f64) -> Vec<Token> {
        let mut expired = Vec::new();
        self.tokens.retain(|t| {
            if t.expires_ms <= now_ms {
                expired.push(t.clone());
                false
            } else {
                true
            }
        });
        for token in &expired {
            self.sm_occupied -= token.sm_partition;
        }
        expired
    }

    /// Reclaim `client`'s token if it holds one (the early-return path).
    pub fn remove_if_present(&mut self, client: &str) -> Option<Token> {
        let pos = self.tokens.iter().position(|t| t.client == client)?;
        let token = self.tokens.remove(pos);
        self.sm_occupied -= token.sm_partition;
        Some(token)
    }

    /// Expiry instant of the token that ends first.
    pub fn next_expiry(&self) -> Option<f64> {
        self.tokens
            .iter()
            .map(|t| t.expires_ms)
            .min_by(f64::total_cmp)
    }
}

/// All mutable scheduler state, guarded by one mutex.
#[derive(Debug, Default)]
pub struct SchedulerState {
    pub clients: HashMap<String, Client>,
    pub queue: VecDeque<PendingRequest>,
    pub tokens: TokenTable,
    pub history: UsageHistory,
    next_seq: u64,
}

impl SchedulerState {
    pub fn enqueue(&mut self, client: &str, req_id: u64, arrived_ms: f64, reply: ReplySender) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(PendingRequest {
            seq,
            client: client.to_string(),
            req_id,
            arrived_ms,
            reply,
        });
    }

    /// Reclaim tokens held by clients that have re-requested: a queued entry
    /// for a token holder means that client finished its lease early.
    pub fn reclaim_early_returns(&mut self, now_ms: f64) -> usize {
        let names: Vec<String> = self.queue.iter().map(|r| r.client.clone()).collect();
        let mut reclaimed = 0;
        for name in names {
            if let Some(token) = self.tokens.remove_if_present(&name) {
                tracing::debug!(
                    client = %token.client,
                    unused_ms = token.expires_ms - now_ms,
                    "lease returned early, partition released"
                );
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Drop queued requests with no registered client. Submission already
    /// rejects unknown names, so this only guards the selection loop's
    /// assumption that every queued entry resolves in the registry.
    pub fn drop_unregistered(&mut self) {
        self.queue.retain(|r| {
            let known = self.clients.contains_key(&r.client);
            if !known {
                tracing::warn!(client = %r.client, "client no longer configured, dropping queued request");
            }
            known
        });
    }

    /// Install a loaded limit table. Known clients get their limits replaced
    /// in place, keeping runtime state (memory accounting must survive a
    /// reload); clients absent from the new table stay registered with their
    /// old limits, since their runtime persists for the process lifetime.
    pub fn load_limits(&mut self, entries: Vec<(String, ClientLimits)>) {
        for (name, limits) in entries {
            tracing::info!(
                client = %name,
                min_frac = limits.min_frac,
                max_frac = limits.max_frac,
                sm_partition = limits.sm_partition,
                mem_limit = limits.mem_limit,
                "registered client limits"
            );
            match self.clients.get_mut(&name) {
                Some(client) => client.replace_limits(limits),
                None => {
                    self.clients.insert(name, Client::new(limits));
                }
            }
        }
    }
}

/// Point-in-time view of the scheduler, for monitoring and tests.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub pending_requests: usize,
    pub sm_occupied: u32,
    pub token_holders: Vec<String>,
}

/// The handle shared between the daemon, the handlers, and the watcher.
pub struct SharedScheduler {
    state: Mutex<SchedulerState>,
    notify: Notify,
    clock: Clock,
    config: SchedulerConfig,
}

impl SharedScheduler {
    pub fn new(config: SchedulerConfig, limits: Vec<(String, ClientLimits)>) -> Self {
        let mut state = SchedulerState {
            history: UsageHistory::new(config.history_dump.is_some()),
            ..Default::default()
        };
        state.load_limits(limits);
        Self {
            state: Mutex::new(state),
            notify: Notify::new(),
            clock: Clock::new(),
            config,
        }
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) async fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().await
    }

    /// Resolves on the next daemon wake-up signal. A signal sent while nobody
    /// waits is buffered, so enqueue-then-wait cannot miss it.
    pub(crate) async fn wait_notified(&self) {
        self.notify.notified().await;
    }

    /// Record the return of the previous lease, update the burst estimate,
    /// and park the request for the daemon. Returns `false` for clients the
    /// registry does not know.
    pub async fn submit_quota_request(
        &self,
        client: &str,
        req_id: u64,
        overuse_ms: f64,
        burst_ms: f64,
        reply: ReplySender,
    ) -> bool {
        let now = self.clock.now_ms();
        {
            let mut state = self.state.lock().await;
            if !state.clients.contains_key(client) {
                return false;
            }
            let actual = state.history.amend_last(client, overuse_ms, now);
            let runtime = &mut state
                .clients
                .get_mut(client)
                .expect("presence checked above")
                .runtime;
            runtime.latest_overuse = overuse_ms;
            if let Some(actual_usage) = actual {
                runtime.latest_actual_usage = actual_usage;
            }
            runtime.burst = burst_ms;
            state.enqueue(client, req_id, now, reply);
        }
        self.notify.notify_one();
        true
    }

    /// `(mem_used, mem_limit)` for a registered client.
    pub async fn mem_snapshot(&self, client: &str) -> Option<(u64, u64)> {
        let state = self.state.lock().await;
        state.clients.get(client).map(Client::mem_snapshot)
    }

    /// Apply a memory update, returning the verdict, or `None` for unknown
    /// clients.
    pub async fn apply_mem_update(
        &self,
        client: &str,
        bytes: u64,
        is_allocate: bool,
    ) -> Option<bool> {
        let mut state = self.state.lock().await;
        let verdict = state
            .clients
            .get_mut(client)?
            .apply_mem_update(bytes, is_allocate);
        Some(verdict)
    }

    /// Install a freshly loaded limit table (hot reload).
    pub async fn reload_limits(&self, entries: Vec<(String, ClientLimits)>) {
        let mut state = self.state.lock().await;
        state.load_limits(entries);
        drop(state);
        // registry changes can unblock admission (smaller partitions, higher caps)
        self.notify.notify_one();
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().await;
        SchedulerSnapshot {
            pending_requests: state.queue.len(),
            sm_occupied: state.tokens.sm_occupied(),
            token_holders: state.tokens.iter().map(|t| t.client.clone()).collect(),
        }
    }

    /// JSON dump of the full grant history, when enabled in the config.
    pub async fn dump_history_json(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.history.dump_full_json()
    }
}
