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

//! Per-table metadata shared by every handler instance of a table

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::cluster::types::{TableStatistics, TupleIdRange};
use crate::conflict::ConflictFnShare;

/// Database of the apply status table
pub const APPLY_STATUS_DB: &str = "mysql";
/// Table written by the applier with the epoch of each source
pub const APPLY_STATUS_TABLE: &str = "ndb_apply_status";

/// Shared state of one table
#[derive(Debug)]
pub struct NdbShare {
    db: String,
    table_name: String,
    key: String,
    /// Auto-increment values reserved by this server and not yet handed out
    tuple_id_range: Mutex<TupleIdRange>,
    cfn_share: RwLock<Option<Arc<ConflictFnShare>>>,
    /// Last statistics read from the cluster
    stats: Mutex<Option<TableStatistics>>,
}

impl NdbShare {
    pub fn new(db: impl Into<String>, table_name: impl Into<String>) -> Self {
        let db = db.into();
        let table_name = table_name.into();
        let key = format!("./{}/{}", db, table_name);
        Self {
            db,
            table_name,
            key,
            tuple_id_range: Mutex::new(TupleIdRange::default()),
            cfn_share: RwLock::new(None),
            stats: Mutex::new(None),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Key identifying the share, `./db/table`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_apply_status_table(&self) -> bool {
        self.db == APPLY_STATUS_DB && self.table_name == APPLY_STATUS_TABLE
    }

    /// Lock the tuple id range for an auto-increment reservation
    pub fn tuple_id_range(&self) -> MutexGuard<'_, TupleIdRange> {
        self.tuple_id_range.lock()
    }

    pub fn reset_tuple_id_range(&self) {
        self.tuple_id_range.lock().reset();
    }

    pub fn conflict_fn(&self) -> Option<Arc<ConflictFnShare>> {
        self.cfn_share.read().clone()
    }

    /// Install (or with `None` remove) the conflict function of the table
    pub fn set_conflict_fn(&self, cfn_share: Option<Arc<ConflictFnShare>>) {
        *self.cfn_share.write() = cfn_share;
    }

    pub fn cached_stats(&self) -> Option<TableStatistics> {
        *self.stats.lock()
    }

    pub fn set_cached_stats(&self, stats: TableStatistics) {
        *self.stats.lock() = Some(stats);
    }

    pub fn invalidate_stats(&self) {
        *self.stats.lock() = None;
    }

    /// Fold committed row count changes into the cached statistics
    pub fn apply_row_delta(&self, delta: i64) {
        if let Some(stats) = self.stats.lock().as_mut() {
            stats.row_count = stats.row_count.saturating_add_signed(delta);
        }
    }
}
