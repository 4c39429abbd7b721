// Copyright 2025 Stoolap Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Counter publishing
//!
//! Sessions and applier channels keep their own counters and hand snapshots
//! to a [`StatsPublisher`] at commit. Hosts wire the publisher into whatever
//! status variable surface they expose.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Number of conflict functions with a violation counter
pub const NUM_CONFLICT_FNS: usize = 9;

/// Counters kept per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionCounters {
    pub execute_count: u64,
    pub scan_count: u64,
    pub pruned_scan_count: u64,
    pub sorted_scan_count: u64,
    pub pushed_queries_defined: u64,
    pub pushed_queries_dropped: u64,
    pub pushed_queries_executed: u64,
    pub pushed_reads: u64,
    pub last_commit_epoch_session: u64,
}

/// Conflict counters kept per replication channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConflictCounters {
    /// Violations per conflict function, indexed by function type
    pub violations: [u64; NUM_CONFLICT_FNS],
    pub trans_row_conflict_count: u64,
    pub trans_row_reject_count: u64,
    pub trans_reject_count: u64,
    pub trans_detect_iter_count: u64,
    pub trans_conflict_commit_count: u64,
    pub delete_delete_count: u64,
    pub reflected_op_prepare_count: u64,
    pub reflected_op_discard_count: u64,
    pub refresh_op_count: u64,
    pub last_conflict_epoch: u64,
    pub last_stable_epoch: u64,
}

impl ConflictCounters {
    /// Sum of violations over all functions
    pub fn total_violations(&self) -> u64 {
        self.violations.iter().sum()
    }
}

/// Sink for session and channel counters
pub trait StatsPublisher: Send + Sync {
    fn publish_session(&self, counters: &SessionCounters);

    fn publish_channel(&self, channel: &str, counters: &ConflictCounters);
}

/// Publisher that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatsPublisher;

impl StatsPublisher for NullStatsPublisher {
    fn publish_session(&self, _counters: &SessionCounters) {}

    fn publish_channel(&self, _channel: &str, _counters: &ConflictCounters) {}
}

/// Publisher that keeps the latest snapshots and accumulates session counts
#[derive(Debug, Default)]
pub struct InMemoryStatsPublisher {
    sessions: Mutex<SessionCounters>,
    publishes: Mutex<u64>,
    channels: Mutex<FxHashMap<String, ConflictCounters>>,
}

impl InMemoryStatsPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session counters summed over every publish
    pub fn session_totals(&self) -> SessionCounters {
        *self.sessions.lock()
    }

    pub fn session_publishes(&self) -> u64 {
        *self.publishes.lock()
    }

    /// Latest snapshot of a channel
    pub fn channel(&self, channel: &str) -> Option<ConflictCounters> {
        self.channels.lock().get(channel).copied()
    }
}

impl StatsPublisher for InMemoryStatsPublisher {
    fn publish_session(&self, c: &SessionCounters) {
        let mut total = self.sessions.lock();
        total.execute_count += c.execute_count;
        total.scan_count += c.scan_count;
        total.pruned_scan_count += c.pruned_scan_count;
        total.sorted_scan_count += c.sorted_scan_count;
        total.pushed_queries_defined += c.pushed_queries_defined;
        total.pushed_queries_dropped += c.pushed_queries_dropped;
        total.pushed_queries_executed += c.pushed_queries_executed;
        total.pushed_reads += c.pushed_reads;
        total.last_commit_epoch_session = total
            .last_commit_epoch_session
            .max(c.last_commit_epoch_session);
        *self.publishes.lock() += 1;
    }

    fn publish_channel(&self, channel: &str, counters: &ConflictCounters) {
        self.channels.lock().insert(channel.to_string(), *counters);
    }
}
