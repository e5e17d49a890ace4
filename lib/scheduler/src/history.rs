// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sliding-window log of granted lease intervals.
//!
//! Every token issuance records a provisional `(client, start, end)` interval
//! with the nominal lease end; when the client reports back, the most recent
//! interval is corrected by the reported overuse. Entries are pruned lazily
//! once they fall entirely before the window of interest.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// One granted lease interval, in clock milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub client: String,
    pub start_ms: f64,
    pub end_ms: f64,
}

/// Interval log with per-client aggregation over a sliding window.
#[derive(Debug, Default)]
pub struct UsageHistory {
    entries: VecDeque<HistoryEntry>,
    /// Never-pruned mirror for the shutdown dump; kept only when requested.
    full: Option<Vec<HistoryEntry>>,
}

impl UsageHistory {
    pub fn new(keep_full: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            full: keep_full.then(Vec::new),
        }
    }

    /// Record a provisional interval for a freshly issued token.
    pub fn record(&mut self, client: &str, start_ms: f64, end_ms: f64) {
        let entry = HistoryEntry {
            client: client.to_string(),
            start_ms,
            end_ms,
        };
        if let Some(full) = &mut self.full {
            full.push(entry.clone());
        }
        self.entries.push_back(entry);
    }

    /// Drop entries that ended before `window_start`.
    pub fn prune(&mut self, window_start: f64) {
        self.entries.retain(|e| e.end_ms >= window_start);
    }

    /// Correct the most recent interval for `client` after the lease returned.
    ///
    /// The corrected end is `min(now, end + overuse)` (the client may return
    /// early, reporting a negative overuse), floored at the interval start.
    /// Returns the corrected actual usage, or `None` when the client has no
    /// recorded interval.
    pub fn amend_last(&mut self, client: &str, overuse_ms: f64, now_ms: f64) -> Option<f64> {
        let entry = self.entries.iter_mut().rev().find(|e| e.client == client)?;
        entry.end_ms = (entry.end_ms + overuse_ms).min(now_ms).max(entry.start_ms);
        let (start_ms, end_ms) = (entry.start_ms, entry.end_ms);
        if let Some(full) = &mut self.full {
            if let Some(mirror) = full.iter_mut().rev().find(|e| e.client == client) {
                mirror.end_ms = end_ms;
            }
        }
        Some(end_ms - start_ms)
    }

    /// Per-client usage within `[window_start, ..)`, in ms.
    ///
    /// Each retained entry contributes `end - max(start, window_start)`;
    /// provisional ends that lie in the future count in full, which is what
    /// keeps in-flight leases visible to admission.
    pub fn usage_in_window(&self, window_start: f64) -> HashMap<String, f64> {
        let mut usage = HashMap::new();
        for entry in &self.entries {
            if entry.end_ms < window_start {
                continue;
            }
            *usage.entry(entry.client.clone()).or_insert(0.0) +=
                entry.end_ms - entry.start_ms.max(window_start);
        }
        usage
    }

    /// The entry that will leave the window first.
    pub fn oldest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON dump of the full (never-pruned) history, intervals in seconds.
    /// `None` unless the mirror was enabled at construction.
    pub fn dump_full_json(&self) -> Option<String> {
        #[derive(Serialize)]
        struct DumpEntry<'a> {
            container: &'a str,
            start: f64,
            end: f64,
        }

        let full = self.full.as_ref()?;
        let dump: Vec<DumpEntry<'_>> = full
            .iter()
            .map(|e| DumpEntry {
                container: &e.client,
                start: e.start_ms / 1e3,
                end: e.end_ms / 1e3,
            })
            .collect();
        serde_json::to_string_pretty(&dump).ok()
    }
}
