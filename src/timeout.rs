// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Amortised O(1) idle-timeout sweeper shared across all handlers owned by
//! one [`crate::listener::Listener`], per spec.md §4.4.
//!
//! The append-only tombstone queue plus a per-handler index map is the
//! scheme spec.md names explicitly; it avoids a heap at the cost of
//! periodic compaction.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

/// Coalesces rapid activity updates; an update within this window of the
/// previous one is a no-op re the timeout queue (still useful as "alive").
pub const TIMEOUT_PRECISION: Duration = Duration::from_secs(1);

/// Compaction kicks in once the dead prefix exceeds both this absolute size
/// and half the queue.
const TIMEOUTS_CLEAN_SIZE: usize = 512;

#[derive(Clone)]
enum Slot<H> {
    Live { handler: H, last_activity: Instant },
    Tombstone,
}

/// Generic over the handler identity type `K` (used as the index-map key)
/// and the handler handle type `H` the sweeper reports back to the caller
/// on expiry — kept decoupled from [`crate::handler::ConnectionHandler`] so
/// this module has no upward dependency.
pub struct TimeoutSweeper<K, H> {
    timeout: Duration,
    queue: Vec<Slot<H>>,
    index: HashMap<K, usize>,
    offset: usize,
}

impl<K: std::hash::Hash + Eq + Clone, H: Clone> TimeoutSweeper<K, H> {
    pub fn new(timeout: Duration) -> Self {
        TimeoutSweeper { timeout, queue: Vec::new(), index: HashMap::new(), offset: 0 }
    }

    /// Records activity for `key`/`handler` at `now`. Mirrors
    /// `update_activity`: coalesces updates inside [`TIMEOUT_PRECISION`] of
    /// the previous recorded time for this key, otherwise tombstones the
    /// old slot and appends a fresh one at the tail.
    pub fn update_activity(&mut self, key: K, handler: H, now: Instant) {
        if let Some(&idx) = self.index.get(&key) {
            if let Slot::Live { last_activity, .. } = &self.queue[idx] {
                if now.saturating_duration_since(*last_activity) < TIMEOUT_PRECISION {
                    return;
                }
            }
            self.queue[idx] = Slot::Tombstone;
        }
        self.queue.push(Slot::Live { handler, last_activity: now });
        self.index.insert(key, self.queue.len() - 1);
    }

    /// Removes `key` from the queue outright (handler destroyed for a
    /// reason other than timeout). Idempotent.
    pub fn remove(&mut self, key: &K) {
        if let Some(idx) = self.index.remove(key) {
            self.queue[idx] = Slot::Tombstone;
        }
    }

    /// Scans forward from `offset`, returning handlers whose last activity
    /// is older than `timeout`, tombstoning their slots. Stops at the first
    /// still-fresh live entry since the queue is tail-refresh-ordered.
    /// Compacts the dead prefix when it passes both size thresholds.
    pub fn sweep(&mut self, now: Instant) -> Vec<H> {
        let mut expired = Vec::new();
        while self.offset < self.queue.len() {
            match &self.queue[self.offset] {
                Slot::Tombstone => self.offset += 1,
                Slot::Live { handler, last_activity } => {
                    if now.saturating_duration_since(*last_activity) > self.timeout {
                        expired.push(handler.clone());
                        self.queue[self.offset] = Slot::Tombstone;
                        self.offset += 1;
                    } else {
                        break;
                    }
                },
            }
        }
        self.maybe_compact();
        expired
    }

    fn maybe_compact(&mut self) {
        if self.offset > TIMEOUTS_CLEAN_SIZE && self.offset * 2 > self.queue.len() {
            self.queue.drain(..self.offset);
            for idx in self.index.values_mut() {
                *idx -= self.offset;
            }
            self.offset = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
