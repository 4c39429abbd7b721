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

//! Duplicate key detection ahead of IGNORE writes
//!
//! The cluster aborts an insert hitting an existing key. To let INSERT IGNORE
//! and UPDATE IGNORE skip such rows, the handler first reads every key the
//! row would occupy and reports the first one that is taken.

use std::sync::Arc;

use smallvec::SmallVec;

use super::{Ha, IndexType};
use crate::cluster::{KeyAccess, NdbErrorClassification, OpId, OperationDef};
use crate::core::{Error, FieldBitmap, Result, Row};
use crate::session::ThdNdb;

/// Row change a peek is done for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOp {
    Insert,
    /// Update leaving the primary key alone
    Update,
    /// Update that moves the row to another primary key
    PkUpdate,
}

impl Ha {
    /// Look for rows colliding with `row` on the primary key or a unique
    /// key being written
    ///
    /// Returns the ordinal of the first key found taken, which is also
    /// remembered as `dupkey`.
    pub(crate) fn peek_indexed_rows(
        &mut self,
        thd: &mut ThdNdb,
        row: &Row,
        write_op: WriteOp,
    ) -> Result<Option<usize>> {
        self.start_transaction_part(thd, None)?;
        let lock_mode = self.lock_mode();
        let empty_mask = FieldBitmap::new(self.table.attr_count());
        let mut reads: SmallVec<[(OpId, usize); 4]> = SmallVec::new();

        match self.table_def.primary_key {
            Some(pk) if write_op != WriteOp::Update => {
                let mut op = OperationDef::read(
                    Arc::clone(&self.table),
                    KeyAccess::PrimaryKey,
                    self.pk_wire_key(row)?,
                    empty_mask.clone(),
                    lock_mode,
                );
                op.options.partition_id = self.row_partition(row)?.map(|(part, _)| part);
                let id = self.define(thd, op)?;
                reads.push((id, pk));
            }
            _ => {}
        }

        let table_def = Arc::clone(&self.table_def);
        for (k, key) in table_def.keys.iter().enumerate() {
            if Some(k) == table_def.primary_key
                || !key.is_unique()
                || !self.key_bitmaps[k].overlaps(&self.write_set)
            {
                continue;
            }
            let index = &self.indexes[k];
            if index.index_type() == IndexType::Undefined {
                tracing::warn!(table = %self.table.name, index = index.name(), "index is offline");
                return Err(Error::index_offline(index.name()));
            }
            // Keys holding NULL are not indexed and cannot collide
            if key.parts.iter().any(|f| row.is_null(*f)) {
                continue;
            }
            if write_op != WriteOp::Insert && !self.key_bitmaps[k].is_subset_of(&self.write_set) {
                continue;
            }
            let Some(record) = index.unique_row_record() else {
                continue;
            };
            let op = OperationDef::read(
                Arc::clone(&self.table),
                record.access(),
                record.key_values(row),
                empty_mask.clone(),
                lock_mode,
            );
            let id = self.define(thd, op)?;
            reads.push((id, k));
        }

        if reads.is_empty() {
            return Ok(None);
        }

        // Missing rows are the expected outcome; errors are read per operation
        let _ = thd.execute_no_commit_ie();
        let trans_err = thd.transaction()?.error();
        if trans_err.is_error() && trans_err.classification != NdbErrorClassification::NoDataFound {
            return Err(self.ndb_err(thd, Error::Cluster(trans_err)));
        }

        for (id, key) in reads {
            let found = thd
                .transaction()?
                .operation(id)
                .map_or(false, |op| op.succeeded());
            if found {
                tracing::debug!(table = %self.table.name, key, "duplicate key found by peek");
                self.dupkey = Some(key);
                return Ok(Some(key));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cluster::OperationKind;
    use crate::core::{SqlCommand, Value};

    fn loaded() -> (crate::cluster::memory::MemoryCluster, crate::session::SharedSession, Ha) {
        let (cluster, session, ha) = fixture(&simple_def());
        cluster.load_row(ha.table(), vec![Value::integer(1), Value::integer(10), Value::Null], 1, 0);
        (cluster, session, ha)
    }

    #[test]
    fn test_peek_finds_primary_key() {
        let (cluster, session, mut ha) = loaded();
        statement(&session, SqlCommand::Insert);
        let mut thd = session.lock();
        let found = ha.peek_indexed_rows(&mut thd, &row(&[1, 99, 0]), WriteOp::Insert).unwrap();
        assert_eq!(found, Some(0));
        assert_eq!(ha.dupkey(), Some(0));
        let reads = cluster
            .operation_log()
            .iter()
            .filter(|op| op.kind == OperationKind::Read)
            .count();
        assert_eq!(reads, 2);
    }

    #[test]
    fn test_peek_finds_unique_key() {
        let (_, session, mut ha) = loaded();
        statement(&session, SqlCommand::Insert);
        let mut thd = session.lock();
        let found = ha.peek_indexed_rows(&mut thd, &row(&[2, 10, 0]), WriteOp::Insert).unwrap();
        assert_eq!(found, Some(1));
    }

    #[test]
    fn test_peek_no_collision() {
        let (_, session, mut ha) = loaded();
        statement(&session, SqlCommand::Insert);
        let mut thd = session.lock();
        let found = ha.peek_indexed_rows(&mut thd, &row(&[2, 20, 0]), WriteOp::Insert).unwrap();
        assert_eq!(found, None);
        assert_eq!(ha.dupkey(), None);
    }

    #[test]
    fn test_peek_skips_null_unique_parts() {
        let (cluster, session, mut ha) = loaded();
        statement(&session, SqlCommand::Insert);
        cluster.clear_logs();
        let mut thd = session.lock();
        let mut r = row(&[2, 0, 0]);
        r.set_null(1);
        assert_eq!(ha.peek_indexed_rows(&mut thd, &r, WriteOp::Insert).unwrap(), None);
        let log = cluster.operation_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].key, vec![Value::integer(2)]);
    }

    #[test]
    fn test_peek_update_skips_primary_key() {
        let (cluster, session, mut ha) = loaded();
        statement(&session, SqlCommand::Update);
        ha.set_write_set(FieldBitmap::from_bits(3, &[1]));
        cluster.clear_logs();
        let mut thd = session.lock();
        let found = ha.peek_indexed_rows(&mut thd, &row(&[1, 10, 0]), WriteOp::Update).unwrap();
        assert_eq!(found, Some(1));
        assert_eq!(cluster.operation_log().len(), 1);
    }
}
