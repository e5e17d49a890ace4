// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The scheduling daemon.
//!
//! A single task owns the admission pipeline: sweep expired tokens, reclaim
//! early returns, select candidates against their sliding-window budgets,
//! admit them in priority order under the global SM cap, and issue quota
//! tokens. Between passes it sleeps until the next interesting event — a new
//! request, an early return, or the nearest lease expiry — signalled through
//! the shared [`Notify`](tokio::sync::Notify).

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "random-quota")]
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::protocols::Response;
use crate::state::{Reply, ReplySender, SchedulerState, SharedScheduler, Token};
use crate::SM_GLOBAL_LIMIT;

/// Cap on the backoff when every candidate sits at its usage limit, in ms.
const WAIT_HINT_CAP_MS: f64 = 2000.0;

/// A quota response to deliver once the issuing pass has committed.
#[derive(Debug)]
struct IssuedReply {
    client: String,
    req_id: u64,
    quota_ms: f64,
    reply: ReplySender,
}

/// Outcome of one scheduling pass over the request queue.
#[derive(Debug)]
enum PassOutcome {
    /// Tokens were issued; replies are ready to deliver.
    Issued(Vec<IssuedReply>),
    /// Every queued candidate is at its max-frac budget; re-check after the
    /// smallest overshoot has slid out of the window.
    NoValidCandidates { wait_hint_ms: f64 },
    /// Candidates have budget but none fits the remaining SM capacity; sleep
    /// until the oldest history entry leaves the window.
    SmSaturated { sleep_ms: f64 },
    /// Queue drained (e.g. only requests for unregistered clients).
    Idle,
}

/// Run the daemon until cancelled.
pub async fn run(shared: Arc<SharedScheduler>, cancel: CancellationToken) {
    tracing::info!("scheduling daemon started");
    let clock = shared.clock();

    loop {
        // Wait until at least one request is pending.
        loop {
            if cancel.is_cancelled() {
                tracing::info!("scheduling daemon stopped");
                return;
            }
            let pending = shared.lock_state().await.queue.len();
            if pending > 0 {
                break;
            }
            tokio::select! {
                _ = shared.wait_notified() => {}
                _ = cancel.cancelled() => {}
            }
        }

        let outcome = {
            let mut state = shared.lock_state().await;
            schedule_pass(&mut state, clock.now_ms(), shared.config())
        };

        match outcome {
            PassOutcome::Issued(replies) => {
                for issued in replies {
                    let reply = Reply {
                        req_id: issued.req_id,
                        body: Response::Quota {
                            quota_ms: issued.quota_ms,
                        },
                    };
                    if issued.reply.send(reply).await.is_err() {
                        // the token stays live; the client reconnects and re-asks
                        tracing::warn!(
                            client = %issued.client,
                            "reply channel closed, quota response dropped"
                        );
                    }
                }
                wait_next_event(&shared, &cancel).await;
            }
            PassOutcome::NoValidCandidates { wait_hint_ms } => {
                tracing::debug!(wait_hint_ms, "all candidates at their usage limit");
                timed_wait(&shared, &cancel, wait_hint_ms).await;
            }
            PassOutcome::SmSaturated { sleep_ms } => {
                tracing::debug!(sleep_ms, "SM capacity saturated, deferring admission");
                timed_wait(&shared, &cancel, sleep_ms).await;
            }
            PassOutcome::Idle => {}
        }
    }
}

/// One pass over the queue: sweep, reclaim, select, admit, issue.
///
/// Runs entirely under the state lock, so no handler can interleave between
/// candidate selection and token insertion.
fn schedule_pass(state: &mut SchedulerState, now: f64, config: &SchedulerConfig) -> PassOutcome {
    let expired = state.tokens.sweep_expired(now);
    for token in &expired {
        tracing::debug!(client = %token.client, "token expired, partition released");
    }
    state.reclaim_early_returns(now);
    state.drop_unregistered();

    if state.queue.is_empty() {
        return PassOutcome::Idle;
    }

    let mut window_size = config.window_size;
    let window_start = (now - window_size).max(0.0);
    if window_start == 0.0 {
        // process younger than one window: shrink to the elapsed time
        window_size = now;
    }

    state.history.prune(window_start);
    let usage = state.history.usage_in_window(window_start);
    for entry in state.history.iter() {
        tracing::trace!(
            client = %entry.client,
            start_s = entry.start_ms / 1e3,
            end_s = entry.end_ms / 1e3,
            "window entry"
        );
    }

    struct ValidCandidate {
        seq: u64,
        missing: f64,
        remaining: f64,
        usage: f64,
        arrived_ms: f64,
        sm_partition: u32,
    }

    let mut valid: Vec<ValidCandidate> = Vec::new();
    let mut wait_hint_ms = WAIT_HINT_CAP_MS;
    for request in &state.queue {
        let client = state
            .clients
            .get(&request.client)
            .expect("unregistered requests dropped above");
        let used = usage.get(&request.client).copied().unwrap_or(0.0);
        let limit = client.limits.max_frac * window_size;
        let require = client.limits.min_frac * window_size;
        let remaining = limit - used;
        let missing = require - used;
        if remaining > 0.0 {
            valid.push(ValidCandidate {
                seq: request.seq,
                missing,
                remaining,
                usage: used,
                arrived_ms: request.arrived_ms,
                sm_partition: client.limits.sm_partition,
            });
        } else {
            wait_hint_ms = wait_hint_ms.min(-remaining);
        }
    }
    tracing::debug!(valid = valid.len(), queued = state.queue.len(), "candidate selection");

    if valid.is_empty() {
        return PassOutcome::NoValidCandidates { wait_hint_ms };
    }

    // Most-starved first; the trailing seq makes the order total.
    valid.sort_by(|a, b| {
        b.missing
            .total_cmp(&a.missing)
            .then_with(|| b.remaining.total_cmp(&a.remaining))
            .then_with(|| a.usage.total_cmp(&b.usage))
            .then_with(|| a.arrived_ms.total_cmp(&b.arrived_ms))
            .then_with(|| a.seq.cmp(&b.seq))
    });

    // Greedy admission; `occupied` tracks partitions claimed earlier in this
    // same pass so the global cap holds even before the tokens exist.
    let mut occupied = state.tokens.sm_occupied();
    let mut admitted: Vec<u64> = Vec::new();
    for candidate in &valid {
        if occupied + candidate.sm_partition <= SM_GLOBAL_LIMIT {
            occupied += candidate.sm_partition;
            admitted.push(candidate.seq);
        }
    }

    if admitted.is_empty() {
        // re-check when the oldest entry leaves the window, but no later than
        // the nearest lease expiry: an unreturned token must be reclaimed then
        let mut sleep_ms = state
            .history
            .oldest()
            .map(|entry| (entry.end_ms - window_start).max(0.0))
            .unwrap_or(WAIT_HINT_CAP_MS);
        if let Some(expiry) = state.tokens.next_expiry() {
            sleep_ms = sleep_ms.min((expiry - now).max(0.0));
        }
        return PassOutcome::SmSaturated { sleep_ms };
    }

    let mut replies = Vec::with_capacity(admitted.len());
    for seq in admitted {
        let position = state
            .queue
            .iter()
            .position(|r| r.seq == seq)
            .expect("admitted request still queued");
        let request = state.queue.remove(position).expect("position in bounds");

        let client = state
            .clients
            .get_mut(&request.client)
            .expect("admitted client registered");
        let quota_ms = client.next_quota();
        #[cfg(feature = "random-quota")]
        let quota_ms = quota_ms * rand::rng().random_range(0.4..1.0);
        let sm_partition = client.limits.sm_partition;

        tracing::debug!(
            client = %request.client,
            quota_ms,
            waited_ms = now - request.arrived_ms,
            "issuing quota token"
        );
        state.history.record(&request.client, now, now + quota_ms);
        state.tokens.insert(Token {
            client: request.client.clone(),
            req_id: request.req_id,
            sm_partition,
            issued_ms: now,
            expires_ms: now + quota_ms,
        });
        replies.push(IssuedReply {
            client: request.client,
            req_id: request.req_id,
            quota_ms,
            reply: request.reply,
        });
    }

    PassOutcome::Issued(replies)
}

/// After issuing, wait for whichever comes first: the nearest lease expiry, an
/// early return, or a new request that fits the remaining SM capacity.
async fn wait_next_event(shared: &SharedScheduler, cancel: &CancellationToken) {
    let clock = shared.clock();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let deadline_ms = {
            let mut state = shared.lock_state().await;
            let now = clock.now_ms();
            if !state.tokens.sweep_expired(now).is_empty() {
                return;
            }
            if state.reclaim_early_returns(now) > 0 {
                return;
            }
            let occupied = state.tokens.sm_occupied();
            let fits = state.queue.iter().any(|request| {
                state
                    .clients
                    .get(&request.client)
                    .is_some_and(|c| occupied + c.limits.sm_partition <= SM_GLOBAL_LIMIT)
            });
            if fits {
                return;
            }
            match state.tokens.next_expiry() {
                Some(expiry) => expiry,
                None => return,
            }
        };
        let wait_ms = deadline_ms - clock.now_ms();
        timed_wait(shared, cancel, wait_ms).await;
    }
}

async fn timed_wait(shared: &SharedScheduler, cancel: &CancellationToken, duration_ms: f64) {
    tokio::select! {
        _ = shared.wait_notified() => {}
        _ = tokio::time::sleep(ms_duration(duration_ms)) => {}
        _ = cancel.cancelled() => {}
    }
}

fn ms_duration(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1e3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientLimits};
    use tokio::sync::mpsc;

    fn limits(min_frac: f64, max_frac: f64, sm_partition: u32) -> ClientLimits {
        ClientLimits {
            min_frac,
            max_frac,
            sm_partition,
            mem_limit: 1 << 30,
            base_quota: 250.0,
            min_quota: 100.0,
            max_quota: min_frac * 1000.0,
        }
    }

    fn config(window_size: f64) -> SchedulerConfig {
        SchedulerConfig {
            window_size,
            ..Default::default()
        }
    }

    fn state_with(clients: &[(&str, ClientLimits)]) -> (SchedulerState, ReplySender) {
        let (tx, rx) = mpsc::channel(64);
        // the receiving side is irrelevant to pass-level tests
        std::mem::forget(rx);
        let mut state = SchedulerState::default();
        for (name, limits) in clients {
            state
                .clients
                .insert(name.to_string(), Client::new(limits.clone()));
        }
        (state, tx)
    }

    fn issued(outcome: PassOutcome) -> Vec<IssuedReply> {
        match outcome {
            PassOutcome::Issued(replies) => replies,
            other => panic!("expected issuance, got {other:?}"),
        }
    }

    #[test]
    fn test_startup_window_shrinks_to_elapsed_time() {
        let (mut state, tx) = state_with(&[("pod-a", limits(1.0, 1.0, 50))]);
        state.enqueue("pod-a", 1, 400.0, tx);

        let replies = issued(schedule_pass(&mut state, 500.0, &config(10_000.0)));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].quota_ms, 250.0);
        assert_eq!(state.tokens.sm_occupied(), 50);
        assert_eq!(state.history.oldest().unwrap().end_ms, 750.0);
    }

    #[test]
    fn test_max_frac_blocks_admission() {
        let (mut state, tx) = state_with(&[("pod-a", limits(0.1, 0.5, 50))]);
        state.history.record("pod-a", 1200.0, 1800.0);
        state.enqueue("pod-a", 1, 1900.0, tx);

        match schedule_pass(&mut state, 2000.0, &config(1000.0)) {
            PassOutcome::NoValidCandidates { wait_hint_ms } => {
                // usage 600 against a 500 cap: re-check after the 100 overshoot
                assert!((wait_hint_ms - 100.0).abs() < 1e-9);
            }
            other => panic!("expected no valid candidates, got {other:?}"),
        }
        assert_eq!(state.tokens.len(), 0);
        assert_eq!(state.queue.len(), 1);
    }

    #[test]
    fn test_starved_client_preempts() {
        let (mut state, tx) = state_with(&[
            ("pod-a", limits(0.1, 1.0, 60)),
            ("pod-b", limits(0.8, 1.0, 60)),
        ]);
        state.enqueue("pod-a", 1, 1900.0, tx.clone());
        state.enqueue("pod-b", 2, 1950.0, tx);

        let replies = issued(schedule_pass(&mut state, 2000.0, &config(1000.0)));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].client, "pod-b");
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].client, "pod-a");
    }

    #[test]
    fn test_same_pass_admission_respects_global_limit() {
        let (mut state, tx) = state_with(&[
            ("pod-a", limits(0.5, 1.0, 40)),
            ("pod-b", limits(0.5, 1.0, 40)),
            ("pod-c", limits(0.5, 1.0, 40)),
        ]);
        state.enqueue("pod-a", 1, 1000.0, tx.clone());
        state.enqueue("pod-b", 2, 1001.0, tx.clone());
        state.enqueue("pod-c", 3, 1002.0, tx);

        let replies = issued(schedule_pass(&mut state, 2000.0, &config(1000.0)));
        assert_eq!(replies.len(), 2);
        assert_eq!(state.tokens.sm_occupied(), 80);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].client, "pod-c");
    }

    #[test]
    fn test_oversubscribed_partitions_alternate() {
        let (mut state, tx) = state_with(&[
            ("pod-a", limits(1.0, 1.0, 60)),
            ("pod-b", limits(1.0, 1.0, 60)),
        ]);
        let window = config(1000.0);

        let mut now = 2000.0;
        state.enqueue("pod-a", 1, now - 1.0, tx.clone());
        state.enqueue("pod-b", 2, now, tx.clone());

        let mut order = Vec::new();
        for round in 0u64..4 {
            let replies = issued(schedule_pass(&mut state, now, &window));
            assert_eq!(replies.len(), 1, "round {round}");
            assert!(state.tokens.sm_occupied() <= 60);
            let winner = replies[0].client.clone();
            // the winner's lease runs to expiry, then it immediately re-asks
            now += replies[0].quota_ms;
            state.enqueue(&winner, 10 + round, now, tx.clone());
            order.push(winner);
        }

        assert_eq!(order, ["pod-a", "pod-b", "pod-a", "pod-b"]);
    }

    #[test]
    fn test_sm_saturated_sleeps_until_expiry() {
        let (mut state, tx) = state_with(&[
            ("pod-a", limits(1.0, 1.0, 60)),
            ("pod-b", limits(1.0, 1.0, 60)),
        ]);
        // pod-a holds a live token; pod-b cannot fit
        state.history.record("pod-a", 1800.0, 2050.0);
        state.tokens.insert(Token {
            client: "pod-a".to_string(),
            req_id: 1,
            sm_partition: 60,
            issued_ms: 1800.0,
            expires_ms: 2050.0,
        });
        state.enqueue("pod-b", 2, 1900.0, tx);

        match schedule_pass(&mut state, 2000.0, &config(1000.0)) {
            PassOutcome::SmSaturated { sleep_ms } => {
                // window relief would come at 1050, but pod-a's lease expires
                // in 50 ms and must be reclaimed then
                assert!((sleep_ms - 50.0).abs() < 1e-9);
            }
            other => panic!("expected SM saturation, got {other:?}"),
        }
        assert_eq!(state.tokens.sm_occupied(), 60);
    }

    #[test]
    fn test_sm_saturated_sleeps_until_window_relief() {
        let (mut state, tx) = state_with(&[
            ("pod-a", limits(1.0, 1.0, 60)),
            ("pod-b", limits(1.0, 1.0, 60)),
        ]);
        // an old interval is about to slide out of the window, freeing budget
        // well before pod-a's fresh lease expires
        state.history.record("pod-a", 800.0, 1010.0);
        state.history.record("pod-a", 1990.0, 2900.0);
        state.tokens.insert(Token {
            client: "pod-a".to_string(),
            req_id: 1,
            sm_partition: 60,
            issued_ms: 1990.0,
            expires_ms: 2900.0,
        });
        state.enqueue("pod-b", 2, 1995.0, tx);

        match schedule_pass(&mut state, 2000.0, &config(1000.0)) {
            PassOutcome::SmSaturated { sleep_ms } => {
                // oldest entry leaves the window at 1010 - (2000 - 1000)
                assert!((sleep_ms - 10.0).abs() < 1e-9);
            }
            other => panic!("expected SM saturation, got {other:?}"),
        }
    }

    #[test]
    fn test_early_return_reclaimed_in_same_pass() {
        let (mut state, tx) = state_with(&[("pod-a", limits(1.0, 1.0, 100))]);

        let mut now = 2000.0;
        state.enqueue("pod-a", 1, now, tx.clone());
        let replies = issued(schedule_pass(&mut state, now, &config(1000.0)));
        assert_eq!(replies[0].quota_ms, 250.0);
        assert_eq!(state.tokens.sm_occupied(), 100);

        // returns after 60 ms of the 250 ms grant and immediately re-asks
        now += 60.0;
        let actual = state.history.amend_last("pod-a", -190.0, now).unwrap();
        assert_eq!(actual, 60.0);
        state.enqueue("pod-a", 2, now, tx);

        let replies = issued(schedule_pass(&mut state, now, &config(1000.0)));
        assert_eq!(replies.len(), 1);
        // a single live token: the early return freed the partition first
        assert_eq!(state.tokens.len(), 1);
        assert_eq!(state.tokens.sm_occupied(), 100);
    }

    #[test]
    fn test_unregistered_requests_dropped() {
        let (mut state, tx) = state_with(&[("pod-a", limits(1.0, 1.0, 50))]);
        state.enqueue("ghost", 1, 100.0, tx.clone());
        state.enqueue("pod-a", 2, 100.0, tx);

        let replies = issued(schedule_pass(&mut state, 200.0, &config(1000.0)));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].client, "pod-a");
        assert!(state.queue.is_empty());
    }

    #[test]
    fn test_priority_orders_are_consistent() {
        // comparator must be a total order: antisymmetric and transitive over
        // candidates that tie on every float key
        let (mut state, tx) = state_with(&[
            ("pod-a", limits(0.5, 1.0, 10)),
            ("pod-b", limits(0.5, 1.0, 10)),
            ("pod-c", limits(0.5, 1.0, 10)),
        ]);
        state.enqueue("pod-a", 1, 500.0, tx.clone());
        state.enqueue("pod-b", 2, 500.0, tx.clone());
        state.enqueue("pod-c", 3, 500.0, tx);

        let replies = issued(schedule_pass(&mut state, 2000.0, &config(1000.0)));
        // identical candidates resolve by queue order, FIFO
        let order: Vec<&str> = replies.iter().map(|r| r.client.as_str()).collect();
        assert_eq!(order, ["pod-a", "pod-b", "pod-c"]);
    }

    #[test]
    fn test_two_client_fairness_over_simulated_windows() {
        let (mut state, tx) = state_with(&[
            ("pod-a", limits(0.5, 0.5, 50)),
            ("pod-b", limits(0.5, 0.5, 50)),
        ]);
        let window = config(1000.0);

        // event-driven simulation: both clients re-request the moment their
        // lease ends, for three seconds of simulated time
        let mut now = 0.0;
        let mut req_id = 0u64;
        let mut wakeups: Vec<(f64, String)> =
            vec![(0.0, "pod-a".to_string()), (0.0, "pod-b".to_string())];

        while now < 3000.0 {
            wakeups.sort_by(|a, b| a.0.total_cmp(&b.0));
            while let Some((t, name)) = wakeups.first().cloned() {
                if t <= now {
                    wakeups.remove(0);
                    req_id += 1;
                    state.enqueue(&name, req_id, now, tx.clone());
                } else {
                    break;
                }
            }

            match schedule_pass(&mut state, now, &window) {
                PassOutcome::Issued(replies) => {
                    for reply in replies {
                        wakeups.push((now + reply.quota_ms, reply.client));
                    }
                }
                PassOutcome::NoValidCandidates { wait_hint_ms } => {
                    now += wait_hint_ms.max(1.0);
                }
                PassOutcome::SmSaturated { sleep_ms } => {
                    now += sleep_ms.max(1.0);
                }
                PassOutcome::Idle => match wakeups.first() {
                    Some(&(t, _)) => now = now.max(t),
                    None => break,
                },
            }
        }

        // actual usage inside [2000, 3000], clipped at both ends
        let mut usage_a = 0.0;
        let mut usage_b = 0.0;
        for entry in state.history.iter() {
            let overlap = (entry.end_ms.min(3000.0) - entry.start_ms.max(2000.0)).max(0.0);
            match entry.client.as_str() {
                "pod-a" => usage_a += overlap,
                "pod-b" => usage_b += overlap,
                other => panic!("unexpected client {other}"),
            }
        }

        // each client is entitled to exactly half the window
        assert!(
            (usage_a - 500.0).abs() <= 25.0,
            "pod-a usage {usage_a} outside 500 +/- 5%"
        );
        assert!(
            (usage_b - 500.0).abs() <= 25.0,
            "pod-b usage {usage_b} outside 500 +/- 5%"
        );
    }
}
