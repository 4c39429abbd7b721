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

//! Key reads and index read entry points
//!
//! A read over a full primary or unique key becomes a single key lookup.
//! Everything else opens an ordered index scan, see `scan`.

use std::sync::Arc;

use super::{Ha, PartitionPruning};
use crate::cluster::error::NDB_ERR_NO_DATA_FOUND;
use crate::cluster::{AttrValues, KeyAccess, LockMode, NdbErrorClassification, OpId, OperationDef};
use crate::core::{Error, KeyRange, PushedAccess, ReadFlag, Result, Row, SqlCommand, Value};
use crate::session::ThdNdb;

impl Ha {
    // ---- Server entry points ----

    /// Make `idx` the active index for the following index reads
    pub fn index_init(&mut self, idx: usize, sorted: bool) -> Result<()> {
        let index = self
            .indexes
            .get(idx)
            .ok_or_else(|| Error::invalid_argument(format!("no index {}", idx)))?;
        if index.index_type() == super::IndexType::Undefined {
            tracing::warn!(table = %self.table.name, index = index.name(), "index is offline");
            return Err(Error::index_offline(index.name()));
        }

        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        if thd.is_applier() && self.table_def.has_hidden_primary_key() && thd.unsent_bytes() > 0 {
            // Pending changes must be visible to the index read
            let result = thd.execute_no_commit(self.ignore_no_key);
            if let Err(err) = result {
                return Err(self.ndb_err(&mut thd, err));
            }
        }
        self.active_index = Some(idx);
        self.sorted = sorted;
        self.get_read_set(&thd, Some(idx));
        Ok(())
    }

    pub fn index_end(&mut self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.active_index = None;
        self.close_scan(&mut thd)
    }

    /// Read the first row matching `key` on the active index
    ///
    /// `key` holds values for a prefix of the key parts, in key order.
    pub fn index_read(&mut self, row: &mut Row, key: &[Value], flag: ReadFlag) -> Result<()> {
        let start = KeyRange::new(key.to_vec(), flag);
        let (end, descending) = match flag {
            ReadFlag::KeyExact => (Some(KeyRange::new(key.to_vec(), ReadFlag::AfterKey)), false),
            other => (None, other.is_descending()),
        };
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        let sorted = self.sorted || descending;
        self.read_range_first_to_buf(&mut thd, Some(&start), end.as_ref(), descending, sorted, row)
    }

    /// Read the last row matching the key prefix
    pub fn index_read_last(&mut self, row: &mut Row, key: &[Value]) -> Result<()> {
        self.index_read(row, key, ReadFlag::PrefixLast)
    }

    pub fn index_next(&mut self, row: &mut Row) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.next_result(&mut thd, row)
    }

    pub fn index_prev(&mut self, row: &mut Row) -> Result<()> {
        self.index_next(row)
    }

    /// First row in index order
    pub fn index_first(&mut self, row: &mut Row) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.ordered_index_scan(&mut thd, None, None, true, false, row)
    }

    /// Last row in index order
    pub fn index_last(&mut self, row: &mut Row) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.ordered_index_scan(&mut thd, None, None, true, true, row)
    }

    /// Start reading the rows between `start` and `end` on the active index
    pub fn read_range_first(
        &mut self,
        row: &mut Row,
        start: Option<&KeyRange>,
        end: Option<&KeyRange>,
        sorted: bool,
    ) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.read_range_first_to_buf(&mut thd, start, end, false, sorted, row)
    }

    pub fn read_range_next(&mut self, row: &mut Row) -> Result<()> {
        self.index_next(row)
    }

    /// Read the row stored by [`position`](Ha::position)
    pub fn rnd_pos(&mut self, row: &mut Row, pos: &[Value]) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();

        let key_len = match self.table_def.primary_key {
            Some(pk) => self.table_def.keys[pk].parts.len(),
            None => 1,
        };
        if pos.len() < key_len {
            return Err(Error::invalid_argument("row position shorter than the key"));
        }
        let part_id = pos
            .get(key_len)
            .and_then(Value::as_u64)
            .map(|p| p as u32);
        let key = match self.table_def.primary_key {
            Some(pk) => self.indexes[pk]
                .unique_key_record()
                .map(|r| r.key_values(&pos[..key_len]))
                .ok_or_else(|| Error::internal("primary key without record"))?,
            None => pos[..1].to_vec(),
        };
        match self.pk_read(&mut thd, key, part_id, row) {
            Err(Error::KeyNotFound) => Err(Error::RecordDeleted),
            other => other,
        }
    }

    // ---- Routing ----

    /// Route a range read to a key lookup, a filtered table scan or an
    /// ordered index scan
    pub(crate) fn read_range_first_to_buf(
        &mut self,
        thd: &mut ThdNdb,
        start: Option<&KeyRange>,
        end: Option<&KeyRange>,
        descending: bool,
        sorted: bool,
        row: &mut Row,
    ) -> Result<()> {
        let idx = self
            .active_index
            .ok_or_else(|| Error::internal("index read without active index"))?;
        if self.cursor.is_some() {
            self.close_scan(thd)?;
        }
        let index_type = self.indexes[idx].index_type();
        let key_parts = self.table_def.keys[idx].parts.len();

        if let Some(start) = start {
            let full_exact = start.flag == ReadFlag::KeyExact && start.parts() == key_parts;
            if full_exact && index_type.is_primary() {
                if self.pushed_root_lookup(thd, PushedAccess::PrimaryKey, Some(idx)) {
                    return self.pushed_root_read(thd, &start.key, row).map_err(not_found_is_eof);
                }
                let key = self.indexes[idx]
                    .unique_key_record()
                    .map(|r| r.key_values(&start.key))
                    .ok_or_else(|| Error::internal("primary key without record"))?;
                return self.pk_read(thd, key, None, row).map_err(not_found_is_eof);
            }
            if full_exact && index_type.is_unique() {
                if !start.has_null() && self.pushed_root_lookup(thd, PushedAccess::UniqueKey, Some(idx))
                {
                    return self.pushed_root_read(thd, &start.key, row).map_err(not_found_is_eof);
                }
                return self.unique_read(thd, idx, &start.key, row).map_err(not_found_is_eof);
            }
            if index_type.is_unique() && !index_type.is_ordered() {
                // Hash only index, nothing to range scan on
                let filter = self.key_filter(idx, &start.key);
                return self.full_table_scan(thd, Some(filter), row);
            }
        }

        let (descending, sorted) = match self.pruning {
            PartitionPruning::Nothing => return Err(Error::EndOfFile),
            PartitionPruning::Single(_) => (descending, false),
            PartitionPruning::All => (descending, sorted),
        };
        self.ordered_index_scan(thd, start, end, sorted, descending, row)
    }

    /// Equality filter on the key parts present in `key`
    fn key_filter(&self, idx: usize, key: &[Value]) -> AttrValues {
        self.table_def.keys[idx]
            .parts
            .iter()
            .zip(key.iter())
            .filter_map(|(field, value)| self.column_map.attr(*field).map(|a| (a, value.clone())))
            .collect()
    }

    // ---- Key lookups ----

    /// Read a row by primary key, `key` in cluster key order
    pub(crate) fn pk_read(
        &mut self,
        thd: &mut ThdNdb,
        key: Vec<Value>,
        part_id: Option<u32>,
        row: &mut Row,
    ) -> Result<()> {
        self.start_transaction_key(thd, &key)?;
        self.key_read(thd, KeyAccess::PrimaryKey, key, part_id, row)
    }

    /// Read a row through unique index `idx`, `key` in server key order
    pub(crate) fn unique_read(
        &mut self,
        thd: &mut ThdNdb,
        idx: usize,
        key: &[Value],
        row: &mut Row,
    ) -> Result<()> {
        let index = &self.indexes[idx];
        if index.null_in_unique_index() && key.iter().any(Value::is_null) {
            // NULLs never collide in a unique index, several rows may match
            let filter = self.key_filter(idx, key);
            return self.full_table_scan(thd, Some(filter), row);
        }
        let record = index
            .unique_key_record()
            .ok_or_else(|| Error::index_offline(index.name()))?;
        let access = record.access();
        let wire_key = record.key_values(key);
        self.start_transaction_part(thd, None)?;
        self.key_read(thd, access, wire_key, None, row)
    }

    fn key_read(
        &mut self,
        thd: &mut ThdNdb,
        access: KeyAccess,
        key: Vec<Value>,
        part_id: Option<u32>,
        row: &mut Row,
    ) -> Result<()> {
        let lock_mode = self.lock_mode();
        let mut op = OperationDef::read(
            Arc::clone(&self.table),
            access,
            key.clone(),
            self.read_attr_mask(),
            lock_mode,
        );
        op.blob_reads = self.blob_read_attrs();
        op.options.partition_id = part_id;
        op.options.extra_get_values = self.position_extras().into_iter().collect();
        let id = self.define(thd, op)?;

        if lock_mode == LockMode::Exclusive && thd.config().log_exclusive_reads {
            // Empty update so the exclusive read reaches the binlog
            let options = self.dml_options(thd);
            let marker =
                OperationDef::update(Arc::clone(&self.table), access, key, Vec::new()).with_options(options);
            self.define(thd, marker)?;
        }

        if let Err(err) = thd.execute_no_commit_ie() {
            return Err(self.ndb_err(thd, err));
        }
        self.fetch_key_read(thd, id, row)
    }

    /// Copy the outcome of read operation `id` into `row`
    pub(crate) fn fetch_key_read(&mut self, thd: &mut ThdNdb, id: OpId, row: &mut Row) -> Result<()> {
        let op = thd
            .transaction()?
            .operation(id)
            .ok_or_else(|| Error::internal("read operation not completed"))?;
        if !op.succeeded() {
            if op.error.code == NDB_ERR_NO_DATA_FOUND
                || op.error.classification == NdbErrorClassification::NoDataFound
            {
                return Err(Error::KeyNotFound);
            }
            return Err(self.ndb_err(thd, Error::Cluster(op.error)));
        }
        self.prepare_row(row);
        if let Some(values) = &op.values {
            self.row_record.unpack(values, row)?;
        }
        self.capture_position_extras(&op.extra);
        self.get_blob_values(thd, row)?;
        if !self.condition_holds(row) {
            return Err(Error::KeyNotFound);
        }
        Ok(())
    }

    pub(crate) fn define(&mut self, thd: &mut ThdNdb, op: OperationDef) -> Result<OpId> {
        let result = thd.transaction()?.define_operation(op);
        result.map_err(|e| self.ndb_err(thd, Error::Cluster(e)))
    }

    /// Reset `row` to an all NULL row of this table
    pub(crate) fn prepare_row(&self, row: &mut Row) {
        if row.len() == self.table_def.fields.len() {
            row.clear();
        } else {
            *row = Row::for_table(&self.table_def);
        }
    }

    pub(crate) fn condition_holds(&self, row: &Row) -> bool {
        self.condition.as_ref().map_or(true, |c| c(row))
    }

    // ---- Read set ----

    /// Widen the read set with what updates and deletes need
    ///
    /// Called when the statement changes rows; skipped when reads before
    /// the change are removed.
    pub(crate) fn get_read_set(&mut self, thd: &ThdNdb, idx: Option<usize>) {
        let command = thd.statement().command;
        let is_update = matches!(command, SqlCommand::Update | SqlCommand::UpdateMulti);
        let is_delete = matches!(command, SqlCommand::Delete | SqlCommand::DeleteMulti);
        if !(is_update || is_delete) || self.rbwr_possible {
            return;
        }
        let has_pk = self.table_def.primary_key.is_some();

        if is_update && has_pk && self.write_set.overlaps(&self.pk_bitmap) {
            // Delete plus insert needs the complete row
            for field in 0..self.read_set.len() {
                if !self.write_set.is_set(field) {
                    self.read_set.set(field);
                }
            }
            self.read_set.union_with(&self.pk_bitmap);
            return;
        }

        let blob_written = self
            .table_def
            .blob_fields()
            .any(|f| self.write_set.is_set(f));
        if has_pk && (idx.is_some() || (is_delete && self.table_def.has_blobs()) || blob_written) {
            self.read_set.union_with(&self.pk_bitmap);
        }
        if let Some(partition) = &self.table_def.partition {
            for field in partition.fields() {
                self.read_set.set(field);
            }
        }
        if is_update {
            for (k, key) in self.table_def.keys.iter().enumerate() {
                if key.is_unique() && self.key_bitmaps[k].overlaps(&self.write_set) {
                    self.read_set.union_with(&self.key_bitmaps[k]);
                }
            }
        }
    }
}

fn not_found_is_eof(err: Error) -> Error {
    match err {
        Error::KeyNotFound => Error::EndOfFile,
        other => other,
    }
}
