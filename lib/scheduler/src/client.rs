// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-client limits, runtime accounting, and the adaptive quota estimator.
//!
//! A [`Client`] pairs the configured [`ClientLimits`] (replaced wholesale on
//! every limit-file reload) with the [`ClientRuntime`] that survives reloads:
//! memory accounting, the latest burst report, and the estimator state.

/// How drastically the estimator moves toward the reported burst.
const QUOTA_UPDATE_RATE: f64 = 0.5;

/// Below this the burst report is treated as "no data yet".
const BURST_EPSILON: f64 = 1e-9;

/// Limits for one registered client, as loaded from the limit file.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientLimits {
    /// Guaranteed share of wall time within a window, in [0, 1].
    pub min_frac: f64,
    /// Hard cap on the share of wall time within a window, in [0, 1].
    pub max_frac: f64,
    /// Percent of GPU SMs consumed while this client holds a lease.
    pub sm_partition: u32,
    /// Cap on `mem_used`, in bytes.
    pub mem_limit: u64,
    /// Quota granted while no burst estimate exists, in ms.
    pub base_quota: f64,
    /// Lower bound for the adaptive quota, in ms.
    pub min_quota: f64,
    /// Upper bound for the adaptive quota: `min_frac * window_size`, in ms.
    pub max_quota: f64,
}

/// Mutable per-client state; persists for the process lifetime.
#[derive(Debug, Clone, Default)]
pub struct ClientRuntime {
    pub mem_used: u64,
    /// Last client-reported burst estimate, in ms.
    pub burst: f64,
    /// Last computed quota, in ms.
    pub quota: f64,
    /// Signed deviation the client reported for its last lease, in ms.
    pub latest_overuse: f64,
    /// Corrected duration of the client's last lease, in ms.
    pub latest_actual_usage: f64,
}

#[derive(Debug, Clone)]
pub struct Client {
    pub limits: ClientLimits,
    pub runtime: ClientRuntime,
}

impl Client {
    pub fn new(limits: ClientLimits) -> Self {
        let runtime = ClientRuntime {
            quota: limits.base_quota,
            ..Default::default()
        };
        Self { limits, runtime }
    }

    /// Swap in freshly loaded limits, keeping the runtime state intact.
    pub fn replace_limits(&mut self, limits: ClientLimits) {
        self.limits = limits;
    }

    /// Compute the next quota to grant.
    ///
    /// Falls back to the static `base_quota` until the client reports a burst;
    /// afterwards moves halfway toward the reported burst each grant, bounded
    /// by `[min_quota, max_quota]`.
    pub fn next_quota(&mut self) -> f64 {
        if self.runtime.burst < BURST_EPSILON {
            self.runtime.quota = self.limits.base_quota;
        } else {
            let blended = self.runtime.burst * QUOTA_UPDATE_RATE
                + self.runtime.quota * (1.0 - QUOTA_UPDATE_RATE);
            // max-then-min, so an inverted [min_quota, max_quota] still
            // resolves to the upper bound instead of panicking
            self.runtime.quota = blended.max(self.limits.min_quota).min(self.limits.max_quota);
        }
        self.runtime.quota
    }

    pub fn mem_snapshot(&self) -> (u64, u64) {
        (self.runtime.mem_used, self.limits.mem_limit)
    }

    /// Apply a memory update, returning the verdict sent back to the client.
    ///
    /// A free is accepted when the ledger holds at least `bytes`; an
    /// allocation when it stays within `mem_limit`. Rejected updates leave the
    /// ledger untouched.
    pub fn apply_mem_update(&mut self, bytes: u64, is_allocate: bool) -> bool {
        if is_allocate {
            match self.runtime.mem_used.checked_add(bytes) {
                Some(total) if total <= self.limits.mem_limit => {
                    self.runtime.mem_used = total;
                    true
                }
                _ => false,
            }
        } else if self.runtime.mem_used >= bytes {
            self.runtime.mem_used -= bytes;
            true
        } else {
            false
        }
    }
}
