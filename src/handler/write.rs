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

//! Row inserts and bulk insert batching

use std::sync::Arc;

use super::peek::WriteOp;
use super::{applying_binlog, Ha, OPERATION_OVERHEAD};
use crate::cluster::{ExtraColumn, OperationDef, PseudoColumn};
use crate::conflict::ConflictingOpType;
use crate::core::{Error, FieldBitmap, Result, Row, Value, INT_MAX32};
use crate::session::{ThdNdb, TransOption};

/// Rows assumed for a bulk insert of unknown size
const DEFAULT_AUTO_PREFETCH: u64 = 32;

impl Ha {
    /// Insert `row`
    ///
    /// An auto-increment column left NULL or zero is filled in, so the
    /// caller sees the generated value in `row`.
    pub fn write_row(&mut self, row: &mut Row) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();

        if self.share.is_apply_status_table() {
            if let Some(applier) = thd.get_applier_mut() {
                let server_id = row.value(0).as_u64().unwrap_or(0);
                let epoch = row.value(1).as_u64().unwrap_or(0);
                let server_id = u32::try_from(server_id)
                    .map_err(|_| Error::invalid_argument("apply status server id out of range"))?;
                if applier.at_apply_status_write(server_id, epoch) {
                    return Ok(());
                }
            }
        }
        self.ndb_write_row(&mut thd, row, false, false)
    }

    pub(crate) fn ndb_write_row(
        &mut self,
        thd: &mut ThdNdb,
        row: &mut Row,
        pk_update: bool,
        batched_update: bool,
    ) -> Result<()> {
        let mut explicit_auto_inc = false;
        let auto_field = self
            .table_def
            .auto_increment_field()
            .filter(|_| self.table_def.primary_key.is_some());
        if let Some(field) = auto_field {
            let current = row.value(field);
            if current.is_null() || current.as_u64() == Some(0) {
                let next = self.get_auto_increment_inner(thd, 1, 1, 1)?;
                let next = i64::try_from(next)
                    .map_err(|_| Error::invalid_argument("auto-increment value out of range"))?;
                row.set(field, Value::integer(next))?;
            } else {
                explicit_auto_inc = true;
            }
        }

        if !self.use_write && self.ignore_dup_key {
            if let Some(key) = self.peek_indexed_rows(thd, row, WriteOp::Insert)? {
                if explicit_auto_inc {
                    self.set_auto_inc(thd, row)?;
                }
                return Err(Error::duplicate_key(Some(key)));
            }
        }

        let (key, hidden) = match self.table_def.primary_key {
            Some(_) => (self.pk_wire_key(row)?, None),
            None => {
                let attr = self
                    .table
                    .hidden_key
                    .ok_or_else(|| Error::internal("table without primary key lacks a hidden key"))?;
                let value = Value::unsigned(self.reserve_hidden_key(thd)?);
                (self.hidden_key(&value), Some((attr, value)))
            }
        };

        let partition = self.row_partition(row)?;
        match partition {
            Some((part, _)) => self.start_transaction_part(thd, Some(part))?,
            None => self.start_transaction_key(thd, &key)?,
        }

        let mut options = self.dml_options(thd);
        if let Some((attr, value)) = &hidden {
            options.set_value(ExtraColumn::Attr(*attr), value.clone());
            self.hidden_key_value = Some(value.clone());
        }
        if let Some((part, func_value)) = partition {
            options.partition_id = Some(part);
            options.set_value(
                ExtraColumn::Pseudo(PseudoColumn::PartitionFunction),
                Value::integer(func_value.min(INT_MAX32)),
            );
        }
        let need_flush = thd.add_row_check_if_batch_full(self.bytes_per_write);

        let mut avoid_write = false;
        if self.prepare_conflict_detection(
            thd,
            ConflictingOpType::WriteRow,
            None,
            Some(row),
            &mut options,
            &mut avoid_write,
        )? {
            return Ok(());
        }

        let use_write = self.use_write && !avoid_write;
        let fields = self.insert_fields(thd, use_write);
        let mask = match &fields {
            Some(fields) => self.value_attr_mask(fields),
            None => self.value_attr_mask(&FieldBitmap::all(self.table_def.fields.len())),
        };
        let values = self.row_record.row_values(row.as_slice(), Some(&mask));
        let mut op = if use_write {
            OperationDef::write(Arc::clone(&self.table), key, values)
        } else {
            OperationDef::insert(Arc::clone(&self.table), key, values)
        }
        .with_options(options);

        let bulk_insert = self.rows_to_insert > 1;
        let will_batch = !need_flush
            && (bulk_insert || batched_update || thd.statement().allow_batch)
            && !pk_update;

        let (blob_writes, _) = self.prepare_blob_writes(thd, row, will_batch)?;
        let uses_blobs = !blob_writes.is_empty();
        op.blob_writes = blob_writes;
        self.define(thd, op)?;

        thd.trans_stats.add_uncommitted(&self.share, 1);
        self.rows_inserted += 1;
        if will_batch {
            if uses_blobs {
                thd.unsent_bytes += OPERATION_OVERHEAD;
                thd.unsent_blob_ops = true;
            }
        } else {
            // A one table autocommit statement sends its rows with the commit
            let allow_batch = !pk_update && thd.statement().is_simple_autocommit();
            self.flush_bulk_insert(thd, allow_batch)?;
        }

        if explicit_auto_inc {
            self.set_auto_inc(thd, row)?;
        }
        Ok(())
    }

    /// Fields an insert sends, `None` meaning all of them
    ///
    /// Write-tuple keeps unwritten columns only when replaying changes.
    /// Inserts may leave out columns the cluster has native defaults for.
    fn insert_fields(&self, thd: &ThdNdb, use_write: bool) -> Option<FieldBitmap> {
        if use_write {
            return applying_binlog(thd).then(|| self.write_set.clone());
        }
        if !self.table.has_default_values() {
            return None;
        }
        let mut fields = self.write_set.clone();
        fields.union_with(&self.pk_bitmap);
        for (i, field) in self.table_def.fields.iter().enumerate() {
            if !field.has_default {
                fields.set(i);
            }
        }
        Some(fields)
    }

    /// Send the rows defined so far
    ///
    /// With transactions off every flush commits, and the transaction is
    /// restarted for the rows that follow.
    pub(crate) fn flush_bulk_insert(&mut self, thd: &mut ThdNdb, allow_batch: bool) -> Result<()> {
        if thd.check_trans_option(TransOption::TransactionsOff) {
            let force_send = thd.config().force_send;
            if let Err(err) = thd.execute_commit(force_send, self.ignore_no_key) {
                thd.trans_stats.invalidate();
                return Err(self.ndb_err(thd, err));
            }
            tracing::trace!(table = %self.table.name, "intermediate commit");
            let restarted = thd.transaction()?.restart();
            return restarted.map_err(|err| self.ndb_err(thd, Error::Cluster(err)));
        }
        if !allow_batch {
            if let Err(err) = thd.execute_no_commit(self.ignore_no_key) {
                thd.trans_stats.invalidate();
                return Err(self.ndb_err(thd, err));
            }
        }
        Ok(())
    }

    /// An insert of `rows` rows begins; 0 when the count is unknown
    pub fn start_bulk_insert(&mut self, rows: u64) {
        self.rows_inserted = 0;
        if !self.use_write && self.ignore_dup_key {
            // Every row is peeked before it is written
            tracing::debug!(table = %self.table.name, "bulk insert batching off for IGNORE");
            self.rows_to_insert = 1;
            return;
        }
        if rows == 0 {
            self.rows_to_insert = u64::from(self.autoincrement_prefetch).max(DEFAULT_AUTO_PREFETCH);
        } else {
            self.rows_to_insert = rows;
        }
        let wanted = u32::try_from(self.rows_to_insert).unwrap_or(u32::MAX);
        self.autoincrement_prefetch = self.autoincrement_prefetch.max(wanted);
    }

    pub fn end_bulk_insert(&mut self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        let mut result = Ok(());
        if !thd.statement().allow_batch && thd.unsent_bytes() > 0 && thd.has_transaction() {
            let allow_batch = thd.statement().is_simple_autocommit();
            result = self.flush_bulk_insert(&mut thd, allow_batch);
        }
        self.rows_to_insert = 1;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::cluster::{ExecType, OperationKind, SetValue};
    use crate::config::SessionConfig;
    use crate::conflict::Applier;
    use crate::core::{ExtraOption, FieldType, SqlCommand, TableDefBuilder};
    use crate::session::{StatementContext, ThdNdb};

    fn explicit(session: &crate::session::SharedSession, command: SqlCommand) {
        session
            .lock()
            .start_statement(StatementContext::new(command).with_autocommit(false));
    }

    #[test]
    fn test_write_row_inserts() {
        let (cluster, session, mut ha) = fixture(&simple_def());
        explicit(&session, SqlCommand::Insert);
        ha.write_row(&mut row(&[1, 10, 100])).unwrap();
        assert_eq!(cluster.execute_log().len(), 1);
        session.lock().commit().unwrap();
        let stored = cluster.committed_row("test", "t", &[Value::integer(1)]).unwrap();
        assert_eq!(stored.values[2], Value::integer(100));
    }

    #[test]
    fn test_autocommit_write_waits_for_commit() {
        let (cluster, session, mut ha) = fixture(&simple_def());
        statement(&session, SqlCommand::Insert);
        ha.write_row(&mut row(&[1, 10, 100])).unwrap();
        assert!(cluster.execute_log().is_empty());
        session.lock().commit().unwrap();
        assert_eq!(cluster.execute_log().len(), 1);
        assert_eq!(session.lock().counters().execute_count, 1);
    }

    #[test]
    fn test_duplicate_primary_key() {
        let (cluster, session, mut ha) = fixture(&simple_def());
        cluster.load_row(ha.table(), vec![Value::integer(1), Value::integer(10), Value::Null], 1, 0);
        explicit(&session, SqlCommand::Insert);
        let err = ha.write_row(&mut row(&[1, 11, 0])).unwrap_err();
        assert_eq!(err, Error::duplicate_key(Some(0)));
        assert_eq!(ha.dupkey(), Some(0));
    }

    #[test]
    fn test_insert_ignore_peeks_unique_key() {
        let (cluster, session, mut ha) = fixture(&simple_def());
        cluster.load_row(ha.table(), vec![Value::integer(1), Value::integer(10), Value::Null], 1, 0);
        explicit(&session, SqlCommand::Insert);
        ha.extra(ExtraOption::IgnoreDupKey);
        let err = ha.write_row(&mut row(&[2, 10, 0])).unwrap_err();
        assert_eq!(err, Error::duplicate_key(Some(1)));
        assert!(cluster
            .operation_log()
            .iter()
            .all(|op| op.kind == OperationKind::Read));

        ha.write_row(&mut row(&[3, 30, 0])).unwrap();
        assert!(cluster
            .operation_log()
            .iter()
            .any(|op| op.kind == OperationKind::Insert));
    }

    #[test]
    fn test_replace_uses_write() {
        let def = TableDefBuilder::new("test", "kv")
            .add("k", FieldType::Integer)
            .add_nullable("v", FieldType::Integer)
            .primary_key(&["k"])
            .build()
            .unwrap();
        let (cluster, session, mut ha) = fixture(&def);
        cluster.load_row(ha.table(), vec![Value::integer(1), Value::integer(1)], 1, 0);
        explicit(&session, SqlCommand::Replace);
        ha.extra(ExtraOption::WriteCanReplace);
        ha.write_row(&mut row(&[1, 2])).unwrap();
        session.lock().commit().unwrap();
        let stored = cluster.committed_row("test", "kv", &[Value::integer(1)]).unwrap();
        assert_eq!(stored.values[1], Value::integer(2));
        assert_eq!(cluster.operation_log()[0].kind, OperationKind::Write);
    }

    #[test]
    fn test_hidden_key_bound_as_set_value() {
        let def = TableDefBuilder::new("test", "h")
            .add_nullable("a", FieldType::Integer)
            .build()
            .unwrap();
        let (cluster, session, mut ha) = fixture(&def);
        statement(&session, SqlCommand::Insert);
        ha.write_row(&mut row(&[5])).unwrap();
        ha.write_row(&mut row(&[6])).unwrap();
        let hidden = ha.table().hidden_key.unwrap();
        let log = cluster.operation_log();
        assert_eq!(log.len(), 2);
        assert!(log[0].set_values.contains(&SetValue {
            column: ExtraColumn::Attr(hidden),
            value: Value::unsigned(1),
        }));
        assert_eq!(log[1].key, vec![Value::unsigned(2)]);
        session.lock().commit().unwrap();
        assert_eq!(cluster.row_count("test", "h"), 2);
    }

    #[test]
    fn test_auto_increment_fills_row() {
        let def = TableDefBuilder::new("test", "ai")
            .add("id", FieldType::Integer)
            .add_nullable("v", FieldType::Integer)
            .primary_key(&["id"])
            .auto_increment("id")
            .build()
            .unwrap();
        let (_, session, mut ha) = fixture(&def);
        explicit(&session, SqlCommand::Insert);

        let mut first = Row::from_values(vec![Value::Null, Value::integer(1)]);
        ha.write_row(&mut first).unwrap();
        assert_eq!(first.value(0), &Value::integer(1));

        ha.write_row(&mut row(&[10, 2])).unwrap();
        let mut next = Row::from_values(vec![Value::integer(0), Value::integer(3)]);
        ha.write_row(&mut next).unwrap();
        assert_eq!(next.value(0), &Value::integer(11));
    }

    #[test]
    fn test_partition_function_value_sent() {
        let def = TableDefBuilder::new("test", "p")
            .add("id", FieldType::Integer)
            .add_nullable("v", FieldType::Integer)
            .primary_key(&["id"])
            .partition_by_hash("id", 4)
            .build()
            .unwrap();
        let (cluster, session, mut ha) = fixture(&def);
        explicit(&session, SqlCommand::Insert);
        ha.write_row(&mut row(&[6, 0])).unwrap();
        let op = &cluster.operation_log()[0];
        assert_eq!(op.partition_id, Some(2));
        assert!(op.set_values.contains(&SetValue {
            column: ExtraColumn::Pseudo(PseudoColumn::PartitionFunction),
            value: Value::integer(6),
        }));
    }

    #[test]
    fn test_bulk_insert_batches_until_end() {
        let (cluster, session, mut ha) = fixture(&simple_def());
        explicit(&session, SqlCommand::Insert);
        ha.start_bulk_insert(3);
        assert_eq!(ha.rows_to_insert(), 3);
        for id in 1..=3 {
            ha.write_row(&mut row(&[id, id * 10, 0])).unwrap();
        }
        assert!(cluster.execute_log().is_empty());
        ha.end_bulk_insert().unwrap();
        assert_eq!(ha.rows_to_insert(), 1);
        let executes = cluster.execute_log();
        assert_eq!(executes.len(), 1);
        assert_eq!(executes[0].pending, 3);
    }

    #[test]
    fn test_bulk_insert_off_under_ignore() {
        let (_, _, mut ha) = fixture(&simple_def());
        ha.extra(ExtraOption::IgnoreDupKey);
        ha.start_bulk_insert(100);
        assert_eq!(ha.rows_to_insert(), 1);
        ha.reset();
        ha.start_bulk_insert(0);
        assert_eq!(ha.rows_to_insert(), DEFAULT_AUTO_PREFETCH);
    }

    #[test]
    fn test_transactions_off_commits_each_row() {
        let (cluster, session, mut ha) = fixture(&simple_def());
        session
            .lock()
            .start_statement(StatementContext::new(SqlCommand::AlterTable).with_autocommit(false));
        ha.extra(ExtraOption::BeginAlterCopy);
        ha.write_row(&mut row(&[1, 10, 0])).unwrap();
        ha.write_row(&mut row(&[2, 20, 0])).unwrap();
        assert_eq!(cluster.row_count("test", "t"), 2);
        let commits = cluster
            .execute_log()
            .iter()
            .filter(|e| e.exec_type == ExecType::Commit)
            .count();
        assert_eq!(commits, 2);
    }

    #[test]
    fn test_apply_status_write_can_be_skipped() {
        let def = TableDefBuilder::new("mysql", "ndb_apply_status")
            .add("server_id", FieldType::Integer)
            .add("epoch", FieldType::Integer)
            .primary_key(&["server_id"])
            .build()
            .unwrap();
        let cluster = MemoryCluster::new();
        let session = ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default())
            .with_applier(Applier::new("chan", 1))
            .into_shared();
        let mut ha = open(&cluster, &session, &def);
        explicit(&session, SqlCommand::Insert);

        ha.write_row(&mut row(&[2, 10])).unwrap();
        assert_eq!(cluster.operation_log().len(), 1);
        // Older epoch from the same source
        ha.write_row(&mut row(&[2, 5])).unwrap();
        assert_eq!(cluster.operation_log().len(), 1);
    }
}
