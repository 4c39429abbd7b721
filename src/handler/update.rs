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

//! Row updates
//!
//! An update changing the primary key, or moving the row to another
//! partition, is a delete of the old row followed by an insert of the new
//! one. Everything else is an in-place update addressed either through the
//! scan cursor that produced the row or by key.

use std::sync::Arc;

use super::peek::WriteOp;
use super::{applying_binlog, Ha, OPERATION_OVERHEAD};
use crate::cluster::{AbortOption, CommitStatus, ExecType, ExtraColumn, KeyAccess, OperationDef, PseudoColumn};
use crate::conflict::ConflictingOpType;
use crate::core::{Error, FieldBitmap, Result, Row, SqlCommand, Value, INT_MAX32};
use crate::session::ThdNdb;

impl Ha {
    /// Replace `old` with `new`
    ///
    /// `new` carries every column of the row; an auto-increment value in it
    /// may be adjusted when the row has to be re-inserted.
    pub fn update_row(&mut self, old: &Row, new: &mut Row) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.ndb_update_row(&mut thd, old, new, false)
    }

    /// Begin a bulk update; returns true when batching is not possible
    pub fn start_bulk_update(&mut self) -> bool {
        // Rows are peeked one by one for UPDATE IGNORE
        !self.use_write && self.ignore_dup_key
    }

    /// Update a row as part of a bulk update, leaving it unsent when possible
    pub fn bulk_update_row(&mut self, old: &Row, new: &mut Row) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.ndb_update_row(&mut thd, old, new, true)
    }

    /// Send the updates a bulk update left pending
    pub fn exec_bulk_update(&mut self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        if !thd.has_transaction() {
            return Err(Error::internal("bulk update without a transaction"));
        }

        if thd.statement().is_simple_autocommit() && self.rbwr_possible {
            // Nothing left to read, the commit reports missing rows
            tracing::debug!(table = %self.table.name, "committing read removed update early");
            let force_send = thd.config().force_send;
            match thd.execute_commit(force_send, true) {
                Ok(ignored) => {
                    if !applying_binlog(&thd) {
                        self.rows_updated = self.rows_updated.saturating_sub(u64::from(ignored));
                    }
                    return Ok(());
                }
                Err(err) => {
                    thd.trans_stats.invalidate();
                    return Err(self.ndb_err(&mut thd, err));
                }
            }
        }

        if thd.unsent_bytes() == 0
            || thd.statement().allow_batch
            || (thd.statement().is_simple_autocommit() && !thd.has_unsent_blob_ops())
        {
            return Ok(());
        }

        match thd.execute_no_commit(self.ignore_no_key || self.rbwr_used) {
            Ok(ignored) => {
                if !applying_binlog(&thd) {
                    self.rows_updated = self.rows_updated.saturating_sub(u64::from(ignored));
                }
                Ok(())
            }
            Err(err) => {
                thd.trans_stats.invalidate();
                Err(self.ndb_err(&mut thd, err))
            }
        }
    }

    pub fn end_bulk_update(&mut self) {}

    pub(crate) fn ndb_update_row(
        &mut self,
        thd: &mut ThdNdb,
        old: &Row,
        new: &mut Row,
        is_bulk_update: bool,
    ) -> Result<()> {
        let have_pk = self.table_def.primary_key.is_some();
        let pk_update = !self.rbwr_possible
            && have_pk
            && self.write_set.overlaps(&self.pk_bitmap)
            && self.primary_key_changed(old, new);
        let batch_allowed =
            !self.update_cannot_batch && (is_bulk_update || thd.statement().allow_batch);

        self.start_transaction_part(thd, None)?;

        let command = thd.statement().command;
        if self.ignore_dup_key && matches!(command, SqlCommand::Update | SqlCommand::UpdateMulti) {
            let write_op = if pk_update { WriteOp::PkUpdate } else { WriteOp::Update };
            if let Some(key) = self.peek_indexed_rows(thd, new, write_op)? {
                return Err(Error::duplicate_key(Some(key)));
            }
        }

        let cursor = self.cursor;
        if cursor.is_none() && self.rbwr_possible {
            self.rbwr_used = true;
        }
        // A unique key lookup carries no partition, the row is found by key
        let by_unique_key = cursor.is_none() && self.rbwr_used && self.active_index_is_unique();
        let (old_part, new_part) = if by_unique_key {
            (None, None)
        } else {
            (self.row_partition(old)?, self.row_partition(new)?)
        };

        if pk_update || old_part.map(|(p, _)| p) != new_part.map(|(p, _)| p) {
            return self.ndb_pk_update_row(thd, old, new);
        }

        if self.auto_increment_written() {
            self.set_auto_inc(thd, new)?;
        }

        let mut fields = self.write_set.clone();
        fields.subtract(&self.pk_bitmap);
        let mask = self.value_attr_mask(&fields);
        let values = self.row_record.row_values(new.as_slice(), Some(&mask));

        let mut options = self.dml_options(thd);
        if let Some((part, func_value)) = new_part {
            options.set_value(
                ExtraColumn::Pseudo(PseudoColumn::PartitionFunction),
                Value::integer(func_value.min(INT_MAX32)),
            );
            if cursor.is_none() {
                options.partition_id = Some(part);
            }
        }

        let need_flush = thd.add_row_check_if_batch_full(self.bytes_per_write);
        let (blob_writes, _) = self.prepare_blob_writes(thd, new, batch_allowed && !need_flush)?;
        let uses_blobs = !blob_writes.is_empty();

        if let Some(scan) = cursor {
            let result = thd
                .transaction()?
                .update_current_tuple(scan, values, blob_writes, options);
            if let Err(err) = result {
                return Err(self.ndb_err(thd, Error::Cluster(err)));
            }
            // The update takes over the row lock
            self.lock_tuple = false;
            thd.unsent_bytes += OPERATION_OVERHEAD;
        } else {
            let (access, key) = self.key_ref(new, self.rbwr_used)?;
            let mut avoid_write = true;
            if self.prepare_conflict_detection(
                thd,
                ConflictingOpType::UpdateRow,
                Some(old),
                Some(new),
                &mut options,
                &mut avoid_write,
            )? {
                return Ok(());
            }
            let mut op = if avoid_write || access != KeyAccess::PrimaryKey {
                OperationDef::update(Arc::clone(&self.table), access, key, values)
            } else {
                OperationDef::write(Arc::clone(&self.table), key, values)
            }
            .with_options(options);
            op.blob_writes = blob_writes;
            self.define(thd, op)?;
        }

        let mut ignored = 0;
        if self.update_cannot_batch
            || !(cursor.is_some() || (batch_allowed && have_pk))
            || need_flush
        {
            match thd.execute_no_commit(self.ignore_no_key || self.rbwr_used) {
                Ok(count) => ignored = count,
                Err(err) => {
                    thd.trans_stats.invalidate();
                    return Err(self.ndb_err(thd, err));
                }
            }
        } else if uses_blobs {
            thd.unsent_blob_ops = true;
        }

        self.rows_updated += 1;
        if !applying_binlog(thd) {
            self.rows_updated = self.rows_updated.saturating_sub(u64::from(ignored));
        }
        Ok(())
    }

    /// Move a row to a new primary key or partition
    ///
    /// The old row is deleted and the new one inserted with every column.
    /// When the insert fails the transaction is rolled back, the delete must
    /// not survive on its own.
    fn ndb_pk_update_row(&mut self, thd: &mut ThdNdb, old: &Row, new: &mut Row) -> Result<()> {
        tracing::debug!(table = %self.table.name, "primary key update as delete and insert");
        self.ndb_delete_row(thd, old, true)?;

        if self.auto_increment_written() {
            self.set_auto_inc(thd, new)?;
        }

        let batched_update = self.cursor.is_some();
        let all = FieldBitmap::all(self.table_def.fields.len());
        let saved = std::mem::replace(&mut self.write_set, all);
        let result = self.ndb_write_row(thd, new, true, batched_update);
        self.write_set = saved;

        if let Err(err) = result {
            let status = thd.transaction()?.commit_status();
            if status == CommitStatus::Started {
                tracing::debug!(table = %self.table.name, "insert half failed, rolling back");
                if let Some(applier) = thd.applier.as_mut() {
                    applier.at_transaction_abort();
                }
                thd.unsent_bytes = 0;
                thd.unsent_blob_ops = false;
                thd.counters.execute_count += 1;
                let force_send = thd.config().force_send;
                let rollback = thd
                    .transaction()?
                    .execute(ExecType::Rollback, AbortOption::IgnoreError, force_send);
                if let Err(rollback_err) = rollback {
                    tracing::warn!(code = rollback_err.code, "rollback after failed insert failed");
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn primary_key_changed(&self, old: &Row, new: &Row) -> bool {
        self.table_def
            .primary_key_fields()
            .iter()
            .any(|f| old.value(*f) != new.value(*f))
    }

    fn auto_increment_written(&self) -> bool {
        self.table_def
            .auto_increment_field()
            .map_or(false, |f| self.write_set.is_set(f))
    }

    pub(crate) fn active_index_is_unique(&self) -> bool {
        self.active_index
            .and_then(|i| self.indexes.get(i))
            .map_or(false, |i| i.index_type().is_unique())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cluster::OperationKind;
    use crate::core::{ExtraOption, FieldType, TableDefBuilder, ThrLockType};
    use crate::session::{SharedSession, StatementContext};

    fn explicit(session: &SharedSession, command: SqlCommand) {
        session
            .lock()
            .start_statement(StatementContext::new(command).with_autocommit(false));
    }

    fn loaded(rows: i64) -> (crate::cluster::memory::MemoryCluster, SharedSession, Ha) {
        let (cluster, session, ha) = fixture(&simple_def());
        for id in 1..=rows {
            cluster.load_row(
                ha.table(),
                vec![Value::integer(id), Value::integer(id * 10), Value::integer(id * 100)],
                1,
                0,
            );
        }
        (cluster, session, ha)
    }

    #[test]
    fn test_update_by_primary_key() {
        let (cluster, session, mut ha) = loaded(2);
        explicit(&session, SqlCommand::Update);
        ha.set_write_set(FieldBitmap::from_bits(3, &[2]));
        ha.update_row(&row(&[1, 10, 100]), &mut row(&[1, 10, 111]))
            .unwrap();
        assert_eq!(ha.rows_updated(), 1);

        let log = cluster.operation_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, OperationKind::Update);
        assert_eq!(log[0].key, vec![Value::integer(1)]);

        session.lock().commit().unwrap();
        let stored = cluster.committed_row("test", "t", &[Value::integer(1)]).unwrap();
        assert_eq!(stored.values[2], Value::integer(111));
    }

    #[test]
    fn test_update_through_scan_cursor() {
        let (cluster, session, mut ha) = loaded(2);
        explicit(&session, SqlCommand::Update);
        ha.store_lock(ThrLockType::Write);
        ha.external_lock(ThrLockType::WriteAllowWrite).unwrap();
        ha.set_write_set(FieldBitmap::from_bits(3, &[2]));
        ha.rnd_init(true).unwrap();
        let mut current = Row::for_table(ha.table_def());
        ha.rnd_next(&mut current).unwrap();
        let mut new = current.clone();
        new.set(2, Value::integer(7)).unwrap();
        ha.update_row(&current, &mut new).unwrap();
        assert!(!ha.has_pending_row_lock());
        ha.rnd_end().unwrap();

        assert!(cluster
            .operation_log()
            .iter()
            .any(|op| op.kind == OperationKind::UpdateCurrent));
        session.lock().commit().unwrap();
        let id = current.value(0).clone();
        let stored = cluster.committed_row("test", "t", &[id]).unwrap();
        assert_eq!(stored.values[2], Value::integer(7));
    }

    #[test]
    fn test_primary_key_update_moves_row() {
        let (cluster, session, mut ha) = loaded(1);
        explicit(&session, SqlCommand::Update);
        ha.set_write_set(FieldBitmap::from_bits(3, &[0]));
        ha.update_row(&row(&[1, 10, 100]), &mut row(&[5, 10, 100]))
            .unwrap();
        let kinds: Vec<_> = cluster.operation_log().iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OperationKind::Delete, OperationKind::Insert]);
        // Write set is restored after the insert
        assert_eq!(ha.write_set(), &FieldBitmap::from_bits(3, &[0]));

        session.lock().commit().unwrap();
        assert!(cluster.committed_row("test", "t", &[Value::integer(1)]).is_none());
        assert!(cluster.committed_row("test", "t", &[Value::integer(5)]).is_some());
    }

    #[test]
    fn test_primary_key_update_rolls_back_on_duplicate() {
        let (cluster, session, mut ha) = loaded(2);
        explicit(&session, SqlCommand::Update);
        ha.set_write_set(FieldBitmap::from_bits(3, &[0]));
        let err = ha
            .update_row(&row(&[1, 10, 100]), &mut row(&[2, 10, 100]))
            .unwrap_err();
        assert_eq!(err, Error::duplicate_key(Some(0)));

        let thd = session.lock();
        assert_eq!(thd.unsent_bytes(), 0);
        assert!(cluster
            .execute_log()
            .iter()
            .any(|e| e.exec_type == ExecType::Rollback));
        drop(thd);
        assert!(cluster.committed_row("test", "t", &[Value::integer(1)]).is_some());
    }

    #[test]
    fn test_primary_key_update_failure_aborts_applier_transaction() {
        let cluster = crate::cluster::memory::MemoryCluster::new();
        let session = ThdNdb::new(Arc::new(cluster.clone()), crate::config::SessionConfig::default())
            .with_applier(crate::conflict::Applier::new("default", 1))
            .into_shared();
        let mut ha = open(&cluster, &session, &simple_def());
        for id in 1..=2 {
            cluster.load_row(
                ha.table(),
                vec![Value::integer(id), Value::integer(id * 10), Value::integer(id * 100)],
                1,
                0,
            );
        }
        session
            .lock()
            .get_applier_mut()
            .unwrap()
            .at_trans_conflict_detected(7)
            .unwrap();

        explicit(&session, SqlCommand::Insert);
        ha.extra(ExtraOption::IgnoreDupKey);
        ha.set_write_set(FieldBitmap::from_bits(3, &[0]));
        let err = ha
            .update_row(&row(&[1, 10, 100]), &mut row(&[2, 10, 100]))
            .unwrap_err();
        assert!(err.is_duplicate_key());

        // The insert half failed before any execute, the retry keeps the marks
        let thd = session.lock();
        let applier = thd.get_applier().unwrap();
        assert_eq!(applier.counters().trans_detect_iter_count, 1);
        assert!(applier.is_transaction_in_conflict(7));
        assert!(cluster
            .execute_log()
            .iter()
            .any(|e| e.exec_type == ExecType::Rollback));
    }

    #[test]
    fn test_update_ignore_finds_unique_collision() {
        let (cluster, session, mut ha) = loaded(2);
        explicit(&session, SqlCommand::Update);
        ha.extra(ExtraOption::IgnoreDupKey);
        ha.set_write_set(FieldBitmap::from_bits(3, &[1]));
        let err = ha
            .update_row(&row(&[1, 10, 100]), &mut row(&[1, 20, 100]))
            .unwrap_err();
        assert_eq!(err, Error::duplicate_key(Some(1)));
        assert!(cluster
            .operation_log()
            .iter()
            .all(|op| op.kind == OperationKind::Read));
    }

    #[test]
    fn test_partition_change_moves_row() {
        let def = TableDefBuilder::new("test", "p")
            .add("id", FieldType::Integer)
            .add("k", FieldType::Integer)
            .add_nullable("v", FieldType::Integer)
            .primary_key(&["id"])
            .partition_by_hash("k", 4)
            .build()
            .unwrap();
        let (cluster, session, mut ha) = fixture(&def);
        cluster.load_row(
            ha.table(),
            vec![Value::integer(1), Value::integer(1), Value::Null],
            1,
            0,
        );
        explicit(&session, SqlCommand::Update);
        ha.set_write_set(FieldBitmap::from_bits(3, &[1]));
        let mut new = Row::from_values(vec![Value::integer(1), Value::integer(2), Value::Null]);
        ha.update_row(
            &Row::from_values(vec![Value::integer(1), Value::integer(1), Value::Null]),
            &mut new,
        )
        .unwrap();
        let log = cluster.operation_log();
        assert_eq!(log[0].kind, OperationKind::Delete);
        assert_eq!(log[1].kind, OperationKind::Insert);
        assert_eq!(log[1].partition_id, Some(2));
    }

    #[test]
    fn test_bulk_update_defers_until_exec() {
        let (cluster, session, mut ha) = loaded(3);
        explicit(&session, SqlCommand::Update);
        ha.set_write_set(FieldBitmap::from_bits(3, &[2]));
        assert!(!ha.start_bulk_update());
        for id in 1..=3 {
            ha.bulk_update_row(&row(&[id, id * 10, 0]), &mut row(&[id, id * 10, 1]))
                .unwrap();
        }
        assert!(cluster.execute_log().is_empty());
        ha.exec_bulk_update().unwrap();
        ha.end_bulk_update();
        let executes = cluster.execute_log();
        assert_eq!(executes.len(), 1);
        assert_eq!(executes[0].pending, 3);
        assert_eq!(ha.rows_updated(), 3);
    }

    #[test]
    fn test_bulk_update_refused_for_ignore() {
        let (_, _, mut ha) = loaded(0);
        ha.extra(ExtraOption::IgnoreDupKey);
        assert!(ha.start_bulk_update());
    }

    #[test]
    fn test_exec_bulk_update_without_transaction() {
        let (_, session, mut ha) = loaded(0);
        explicit(&session, SqlCommand::Update);
        assert!(ha.exec_bulk_update().is_err());
    }

    #[test]
    fn test_update_cannot_batch_executes_each_row() {
        let (cluster, session, mut ha) = loaded(2);
        explicit(&session, SqlCommand::Update);
        ha.extra(ExtraOption::UpdateCannotBatch);
        ha.set_write_set(FieldBitmap::from_bits(3, &[2]));
        ha.start_bulk_update();
        ha.bulk_update_row(&row(&[1, 10, 0]), &mut row(&[1, 10, 1]))
            .unwrap();
        ha.bulk_update_row(&row(&[2, 20, 0]), &mut row(&[2, 20, 1]))
            .unwrap();
        assert_eq!(cluster.execute_log().len(), 2);
    }

    #[test]
    fn test_read_removed_update_missing_row_not_counted() {
        let (cluster, session, mut ha) = loaded(1);
        statement(&session, SqlCommand::Update);
        ha.set_write_set(FieldBitmap::from_bits(3, &[2]));
        assert!(ha.start_read_removal());
        ha.start_bulk_update();
        ha.bulk_update_row(&row(&[1, 10, 100]), &mut row(&[1, 10, 5]))
            .unwrap();
        ha.bulk_update_row(&row(&[9, 90, 900]), &mut row(&[9, 90, 5]))
            .unwrap();
        ha.exec_bulk_update().unwrap();
        assert_eq!(ha.end_read_removal(), 1);
        assert_eq!(cluster.execute_log()[0].exec_type, ExecType::Commit);
    }
}
