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

//! Row count changes made by the open transaction, per table

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::share::NdbShare;

#[derive(Debug)]
pub struct TableTransStats {
    share: Arc<NdbShare>,
    /// Rows in the table when the statistics were last read
    pub table_rows: u64,
    /// Rows inserted minus rows deleted and not yet committed
    pub uncommitted_rows: i64,
}

impl TableTransStats {
    /// Rows visible to this transaction
    pub fn rows(&self) -> u64 {
        self.table_rows.saturating_add_signed(self.uncommitted_rows)
    }
}

/// Registry keyed by share key
#[derive(Debug, Default)]
pub struct TransTableStats {
    tables: FxHashMap<String, TableTransStats>,
}

impl TransTableStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry of `share`, created on first use
    pub fn register(&mut self, share: &Arc<NdbShare>) -> &mut TableTransStats {
        self.tables
            .entry(share.key().to_string())
            .or_insert_with(|| TableTransStats {
                share: Arc::clone(share),
                table_rows: share.cached_stats().map_or(0, |s| s.row_count),
                uncommitted_rows: 0,
            })
    }

    pub fn get(&self, key: &str) -> Option<&TableTransStats> {
        self.tables.get(key)
    }

    pub fn add_uncommitted(&mut self, share: &Arc<NdbShare>, delta: i64) {
        self.register(share).uncommitted_rows += delta;
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// The transaction committed; fold its changes into the shared statistics
    pub fn commit(&mut self) {
        for (_, stats) in self.tables.drain() {
            if stats.uncommitted_rows != 0 {
                stats.share.apply_row_delta(stats.uncommitted_rows);
            }
        }
    }

    /// Forget all changes, after a rollback or a failed batch
    pub fn invalidate(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::TableStatistics;

    #[test]
    fn test_commit_folds_deltas() {
        let share = Arc::new(NdbShare::new("test", "t"));
        share.set_cached_stats(TableStatistics {
            row_count: 10,
            ..Default::default()
        });
        let mut stats = TransTableStats::new();
        stats.add_uncommitted(&share, 1);
        stats.add_uncommitted(&share, 1);
        stats.add_uncommitted(&share, -1);
        assert_eq!(stats.get(share.key()).map(TableTransStats::rows), Some(11));
        stats.commit();
        assert!(stats.is_empty());
        assert_eq!(share.cached_stats().map(|s| s.row_count), Some(11));
    }

    #[test]
    fn test_invalidate_drops_deltas() {
        let share = Arc::new(NdbShare::new("test", "t"));
        share.set_cached_stats(TableStatistics::default());
        let mut stats = TransTableStats::new();
        stats.add_uncommitted(&share, 3);
        stats.invalidate();
        stats.commit();
        assert_eq!(share.cached_stats().map(|s| s.row_count), Some(0));
    }
}
