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

//! Replication applier channel state
//!
//! One [`Applier`] belongs to a session that applies a replication channel.
//! It tracks the event currently being applied, the epochs seen from the
//! source and from our own changes coming back, the transactions found in
//! conflict, and the conflict counters of the channel.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::extra_row_info::INVALID_TRANSACTION_ID;
use super::function::ConflictFnType;
use crate::config::ConflictRole;
use crate::core::{Error, Result};
use crate::stats::{ConflictCounters, NullStatsPublisher, StatsPublisher};

/// Operations carrying conflict detection were defined in this transaction
pub const OPS_DEFINED: u32 = 1 << 0;

/// Origin of the epoch transaction being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochState {
    pub own_server_id: u32,
    pub source_server_id: u32,
    pub epoch_value: u64,
}

#[derive(Debug, Clone, Default)]
struct RowEvent {
    server_id: u32,
    extra_row_info: Option<Vec<u8>>,
}

pub struct Applier {
    channel: String,
    role: ConflictRole,
    /// Highest epoch of our own changes seen replicated back
    max_rep_epoch: u64,
    current: EpochState,
    row_event: RowEvent,
    flags: u32,
    trans_in_conflict: FxHashSet<u64>,
    trans_rejected: FxHashSet<u64>,
    conflicts_in_trans: bool,
    counters: ConflictCounters,
    publisher: Arc<dyn StatsPublisher>,
}

impl std::fmt::Debug for Applier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Applier")
            .field("channel", &self.channel)
            .field("role", &self.role)
            .field("max_rep_epoch", &self.max_rep_epoch)
            .field("current", &self.current)
            .field("trans_in_conflict", &self.trans_in_conflict.len())
            .finish()
    }
}

impl Applier {
    pub fn new(channel: impl Into<String>, own_server_id: u32) -> Self {
        Self {
            channel: channel.into(),
            role: ConflictRole::None,
            max_rep_epoch: 0,
            current: EpochState {
                own_server_id,
                ..Default::default()
            },
            row_event: RowEvent::default(),
            flags: 0,
            trans_in_conflict: FxHashSet::default(),
            trans_rejected: FxHashSet::default(),
            conflicts_in_trans: false,
            counters: ConflictCounters::default(),
            publisher: Arc::new(NullStatsPublisher),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn StatsPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_role(mut self, role: ConflictRole) -> Self {
        self.role = role;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn role(&self) -> ConflictRole {
        self.role
    }

    pub fn set_role(&mut self, role: ConflictRole) {
        tracing::info!(channel = %self.channel, role = role.as_str(), "conflict role changed");
        self.role = role;
    }

    pub fn own_server_id(&self) -> u32 {
        self.current.own_server_id
    }

    pub fn max_rep_epoch(&self) -> u64 {
        self.max_rep_epoch
    }

    pub fn set_max_rep_epoch(&mut self, epoch: u64) {
        self.max_rep_epoch = epoch;
    }

    pub fn current_epoch_state(&self) -> EpochState {
        self.current
    }

    pub fn counters(&self) -> &ConflictCounters {
        &self.counters
    }

    // ---- Current row event ----

    /// Install the row event about to be applied
    pub fn set_row_event(&mut self, server_id: u32, extra_row_info: Option<Vec<u8>>) {
        self.row_event = RowEvent {
            server_id,
            extra_row_info,
        };
    }

    /// Server id the current event originated from
    pub fn row_event_server_id(&self) -> u32 {
        self.row_event.server_id
    }

    pub fn extra_row_info(&self) -> Option<&[u8]> {
        self.row_event.extra_row_info.as_deref()
    }

    // ---- Flags ----

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    // ---- Counters ----

    pub fn increment_violation_count(&mut self, fn_type: ConflictFnType) {
        self.counters.violations[fn_type.counter_index()] += 1;
    }

    pub fn increment_delete_delete_count(&mut self) {
        self.counters.delete_delete_count += 1;
    }

    pub fn increment_reflected_op_prepare_count(&mut self) {
        self.counters.reflected_op_prepare_count += 1;
    }

    pub fn increment_reflected_op_discard_count(&mut self) {
        self.counters.reflected_op_discard_count += 1;
    }

    pub fn increment_refresh_op_count(&mut self) {
        self.counters.refresh_op_count += 1;
    }

    // ---- Transactional conflict tracking ----

    /// Seed a transaction id as in conflict
    pub fn mark_transaction_in_conflict(&mut self, trans_id: u64) {
        self.trans_in_conflict.insert(trans_id);
    }

    pub fn is_transaction_in_conflict(&self, trans_id: u64) -> bool {
        self.trans_in_conflict.contains(&trans_id)
    }

    /// Check a row before its operation is defined
    ///
    /// Returns true when the row belongs to a transaction already found in
    /// conflict, in which case the row must be refreshed instead of applied.
    pub fn at_prepare_conflict_detection(&mut self, table: &str, trans_id: u64) -> bool {
        if trans_id == INVALID_TRANSACTION_ID || !self.trans_in_conflict.contains(&trans_id) {
            return false;
        }
        self.counters.trans_row_reject_count += 1;
        if self.trans_rejected.insert(trans_id) {
            self.counters.trans_reject_count += 1;
        }
        tracing::debug!(table, trans_id, "row of transaction in conflict rejected");
        true
    }

    /// Record that a row of `trans_id` was found in conflict
    pub fn at_trans_conflict_detected(&mut self, trans_id: u64) -> Result<()> {
        if trans_id == INVALID_TRANSACTION_ID {
            return Err(Error::replica_corrupt_event(
                "transactional conflict detected on row without transaction id",
            ));
        }
        self.trans_in_conflict.insert(trans_id);
        self.counters.trans_row_conflict_count += 1;
        self.conflicts_in_trans = true;
        tracing::debug!(channel = %self.channel, trans_id, "transaction marked in conflict");
        Ok(())
    }

    /// The epoch transaction committed
    pub fn at_transaction_commit(&mut self, epoch: u64) {
        if self.conflicts_in_trans {
            self.counters.trans_conflict_commit_count += 1;
            self.counters.last_conflict_epoch = epoch;
        } else if self.has_flag(OPS_DEFINED) {
            self.counters.last_stable_epoch = epoch;
        }
        self.trans_in_conflict.clear();
        self.trans_rejected.clear();
        self.conflicts_in_trans = false;
        self.flags = 0;
        self.publisher.publish_channel(&self.channel, &self.counters);
    }

    /// The epoch transaction aborted and will be retried
    ///
    /// Transactions found in conflict stay marked so the retry rejects all
    /// of their rows up front.
    pub fn at_transaction_abort(&mut self) {
        if self.conflicts_in_trans {
            self.counters.trans_detect_iter_count += 1;
            tracing::info!(
                channel = %self.channel,
                in_conflict = self.trans_in_conflict.len(),
                "epoch transaction aborted after conflicts, retrying"
            );
        } else {
            self.trans_in_conflict.clear();
        }
        self.trans_rejected.clear();
        self.conflicts_in_trans = false;
        self.flags = 0;
    }

    /// A row of the apply status table is about to be written
    ///
    /// Our own server id carries the highest epoch of our changes seen
    /// replicated back. Any other server id starts a new epoch transaction
    /// from that source. Returns true when the write must be skipped because
    /// the epoch is older than one already applied from the same source.
    pub fn at_apply_status_write(&mut self, server_id: u32, epoch: u64) -> bool {
        if server_id == self.current.own_server_id {
            if epoch > self.max_rep_epoch {
                self.max_rep_epoch = epoch;
            }
            return false;
        }
        if server_id == self.current.source_server_id && epoch < self.current.epoch_value {
            tracing::warn!(
                channel = %self.channel,
                server_id,
                epoch,
                current = self.current.epoch_value,
                "skipping stale apply status write"
            );
            return true;
        }
        self.current.source_server_id = server_id;
        self.current.epoch_value = epoch;
        false
    }
}
