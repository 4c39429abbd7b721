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

//! Ordered index scans and full table scans
//!
//! One scan cursor is open per handler at a time. Locking scans hand out
//! rows from the client cache first and only contact the cluster once the
//! pending lock takeovers and row changes have been sent.

use std::sync::Arc;

use super::{Ha, IndexData, PartitionPruning, OPERATION_OVERHEAD};
use crate::cluster::{
    AttrValues, IndexBound, LockMode, OperationOptions, ScanDef, ScanFlags, ScanRow, ScanStep,
};
use crate::core::{Error, KeyRange, ReadFlag, Result, Row, StorageType};
use crate::session::ThdNdb;

/// Scan bounds for a key range
///
/// An exact or prefix-last start is a closed range on its own and the end key
/// is not consulted.
fn index_bound(index: &IndexData, start: Option<&KeyRange>, end: Option<&KeyRange>) -> Option<IndexBound> {
    if start.is_none() && end.is_none() {
        return None;
    }
    let mut bound = IndexBound::default();
    let mut closed = false;
    if let Some(start) = start {
        let values = index.bound_values(&start.key);
        match start.flag {
            ReadFlag::KeyExact | ReadFlag::PrefixLast => {
                bound.low = values.clone();
                bound.low_inclusive = true;
                bound.high = values;
                bound.high_inclusive = true;
                closed = true;
            }
            ReadFlag::KeyOrNext | ReadFlag::Prefix => {
                bound.low = values;
                bound.low_inclusive = true;
            }
            ReadFlag::AfterKey => {
                bound.low = values;
                bound.low_inclusive = false;
            }
            ReadFlag::BeforeKey => {
                bound.high = values;
                bound.high_inclusive = false;
            }
            ReadFlag::KeyOrPrev | ReadFlag::PrefixLastOrPrev => {
                bound.high = values;
                bound.high_inclusive = true;
            }
        }
    }
    if let Some(end) = end.filter(|_| !closed) {
        bound.high = index.bound_values(&end.key);
        bound.high_inclusive = end.flag != ReadFlag::BeforeKey;
    }
    Some(bound)
}

impl Ha {
    // ---- Server entry points ----

    /// Prepare for a table scan (`scan`) or a series of `rnd_pos` calls
    pub fn rnd_init(&mut self, scan: bool) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        if self.cursor.is_some() {
            self.close_scan(&mut thd)?;
        }
        self.active_index = self.table_def.primary_key;
        self.get_read_set(&thd, None);

        if scan && thd.statement().is_copying_alter() {
            match self.client.table_commit_count(&self.table) {
                Ok(count) => self.alter_commit_count = Some(count),
                Err(err) => return Err(self.ndb_err(&mut thd, Error::Cluster(err))),
            }
        }
        Ok(())
    }

    pub fn rnd_next(&mut self, row: &mut Row) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        let result = if self.cursor.is_none() {
            self.full_table_scan(&mut thd, None, row)
        } else {
            self.next_result(&mut thd, row)
        };
        match result {
            Err(Error::EndOfFile) => {
                self.check_alter_copy_complete(&mut thd)?;
                Err(Error::EndOfFile)
            }
            other => other,
        }
    }

    pub fn rnd_end(&mut self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.close_scan(&mut thd)
    }

    /// Row returned last is not going to be changed, release its lock
    pub fn unlock_row(&mut self) {
        self.lock_tuple = false;
    }

    /// A copying ALTER must not miss rows committed into the source table
    /// while it was being copied
    fn check_alter_copy_complete(&mut self, thd: &mut ThdNdb) -> Result<()> {
        let Some(saved) = self.alter_commit_count else {
            return Ok(());
        };
        let current = match self.client.table_commit_count(&self.table) {
            Ok(count) => count,
            Err(err) => return Err(self.ndb_err(thd, Error::Cluster(err))),
        };
        if current != saved {
            tracing::warn!(
                table = %self.table_def.name,
                saved,
                current,
                "source table changed during copying alter"
            );
            return Err(Error::copying_alter_conflict(self.table_def.name.clone()));
        }
        Ok(())
    }

    // ---- Opening scans ----

    /// Rows of a locking scan stay locked until taken over or released
    pub(crate) fn locks_rows(&self) -> bool {
        self.lock_mode() != LockMode::CommittedRead
    }

    fn pruned_partition(&self) -> Result<Option<u32>> {
        match self.pruning {
            PartitionPruning::Nothing => Err(Error::EndOfFile),
            PartitionPruning::Single(part) => Ok(Some(part)),
            PartitionPruning::All => Ok(None),
        }
    }

    /// Start an ordered scan on the active index and fetch the first row
    pub(crate) fn ordered_index_scan(
        &mut self,
        thd: &mut ThdNdb,
        start: Option<&KeyRange>,
        end: Option<&KeyRange>,
        sorted: bool,
        descending: bool,
        row: &mut Row,
    ) -> Result<()> {
        let idx = self
            .active_index
            .ok_or_else(|| Error::internal("index scan without active index"))?;
        if self.cursor.is_some() {
            self.close_scan(thd)?;
        }
        let part = self.pruned_partition()?;

        let index = &self.indexes[idx];
        let object_id = index
            .ordered_index()
            .map(|i| i.object_id)
            .ok_or_else(|| Error::index_offline(index.name()))?;
        let bound = index_bound(index, start, end);

        self.start_transaction_part(thd, part)?;
        let lock_mode = self.lock_mode();
        let mut flags = ScanFlags::empty();
        if lock_mode != LockMode::CommittedRead {
            flags.insert(ScanFlags::KEY_INFO);
        }
        if sorted {
            flags.insert(ScanFlags::ORDER_BY_FULL);
        }
        if descending {
            flags.insert(ScanFlags::DESCENDING);
        }
        let def = ScanDef {
            table: Arc::clone(&self.table),
            index: Some(object_id),
            bound,
            read_mask: self.read_attr_mask(),
            lock_mode,
            flags,
            partition_id: part,
            extra_get_values: self.position_extras().into_iter().collect(),
            blob_reads: self.blob_read_attrs(),
            filter: None,
        };

        thd.counters.scan_count += 1;
        if sorted {
            thd.counters.sorted_scan_count += 1;
        }
        if part.is_some() {
            thd.counters.pruned_scan_count += 1;
        }
        tracing::trace!(table = %self.table.name, index = idx, sorted, descending, "ordered index scan");
        self.open_scan(thd, def)?;
        self.next_result(thd, row)
    }

    /// Start a scan over the whole table and fetch the first row
    ///
    /// `filter` is an equality condition evaluated by the data nodes.
    pub(crate) fn full_table_scan(
        &mut self,
        thd: &mut ThdNdb,
        filter: Option<AttrValues>,
        row: &mut Row,
    ) -> Result<()> {
        if self.cursor.is_some() {
            self.close_scan(thd)?;
        }
        let part = self.pruned_partition()?;
        self.start_transaction_part(thd, part)?;

        let lock_mode = if thd.statement().is_copying_alter() {
            LockMode::Exclusive
        } else {
            self.lock_mode()
        };
        let mut flags = ScanFlags::empty();
        if lock_mode != LockMode::CommittedRead {
            flags.insert(ScanFlags::KEY_INFO);
        }
        let reads_disk = self
            .table_def
            .fields
            .iter()
            .enumerate()
            .any(|(f, def)| def.storage == StorageType::Disk && self.read_set.is_set(f));
        if self.table_def.has_disk_columns() && (reads_disk || lock_mode == LockMode::Exclusive) {
            flags.insert(ScanFlags::DISK_SCAN);
        }
        let def = ScanDef {
            table: Arc::clone(&self.table),
            index: None,
            bound: None,
            read_mask: self.read_attr_mask(),
            lock_mode,
            flags,
            partition_id: part,
            extra_get_values: self.position_extras().into_iter().collect(),
            blob_reads: self.blob_read_attrs(),
            filter,
        };

        thd.counters.scan_count += 1;
        if part.is_some() {
            thd.counters.pruned_scan_count += 1;
        }
        tracing::trace!(table = %self.table.name, "full table scan");
        self.open_scan(thd, def)?;
        self.next_result(thd, row)
    }

    fn open_scan(&mut self, thd: &mut ThdNdb, def: ScanDef) -> Result<()> {
        let result = thd.transaction()?.scan(def);
        let scan = result.map_err(|e| self.ndb_err(thd, Error::Cluster(e)))?;
        self.cursor = Some(scan);
        if let Err(err) = thd.execute_no_commit_ie() {
            return Err(self.ndb_err(thd, err));
        }
        Ok(())
    }

    // ---- Fetching ----

    /// Next row of the open scan that satisfies the pushed condition
    pub(crate) fn next_result(&mut self, thd: &mut ThdNdb, row: &mut Row) -> Result<()> {
        if self.cursor.is_none() {
            return Err(Error::EndOfFile);
        }
        if thd.unsent_blob_ops {
            // Blob writes must reach the cluster before the scan moves on
            if let Err(err) = thd.execute_no_commit(self.ignore_no_key) {
                return Err(self.ndb_err(thd, err));
            }
        }
        loop {
            let Some(scan_row) = self.fetch_next(thd)? else {
                return Err(Error::EndOfFile);
            };
            self.prepare_row(row);
            self.row_record.unpack(&scan_row.values, row)?;
            self.capture_position_extras(&scan_row.extra);
            self.get_blob_values(thd, row)?;
            if self.condition_holds(row) {
                self.lock_tuple = self.locks_rows();
                return Ok(());
            }
        }
    }

    /// Advance the cursor
    ///
    /// Takes over the lock of the previous row when it was neither changed
    /// nor released. Cached rows are used before pending operations are sent
    /// and more rows are fetched.
    fn fetch_next(&mut self, thd: &mut ThdNdb) -> Result<Option<ScanRow>> {
        let Some(scan) = self.cursor else {
            return Ok(None);
        };
        if self.lock_tuple {
            self.lock_tuple = false;
            let result = thd
                .transaction()?
                .lock_current_tuple(scan, OperationOptions::default());
            result.map_err(|e| self.ndb_err(thd, Error::Cluster(e)))?;
            thd.unsent_bytes += OPERATION_OVERHEAD;
        }

        let mut contact = !self.locks_rows();
        loop {
            let force_send = thd.config().force_send;
            let step = thd.transaction()?.next_result(scan, contact, force_send);
            match step.map_err(|e| self.ndb_err(thd, Error::Cluster(e)))? {
                ScanStep::Row(row) => return Ok(Some(row)),
                step => {
                    if thd.unsent_bytes > 0 {
                        if let Err(err) = thd.execute_no_commit(self.ignore_no_key) {
                            return Err(self.ndb_err(thd, err));
                        }
                    }
                    if step == ScanStep::NoMoreRecords {
                        return Ok(None);
                    }
                    contact = true;
                }
            }
        }
    }

    /// Close the scan cursor and any pushed query the handler drives
    ///
    /// Pending lock takeovers and row changes are sent first.
    pub(crate) fn close_scan(&mut self, thd: &mut ThdNdb) -> Result<()> {
        let mut result = Ok(());
        if let Some(scan) = self.cursor.take() {
            if self.lock_tuple {
                self.lock_tuple = false;
                let locked = thd.transaction().and_then(|t| {
                    t.lock_current_tuple(scan, OperationOptions::default())
                        .map_err(Error::Cluster)
                });
                match locked {
                    Ok(_) => thd.unsent_bytes += OPERATION_OVERHEAD,
                    Err(err) => result = Err(self.ndb_err(thd, err)),
                }
            }
            if result.is_ok() && thd.unsent_bytes > 0 {
                if let Err(err) = thd.execute_no_commit(self.ignore_no_key) {
                    result = Err(self.ndb_err(thd, err));
                }
            }
            if let Ok(trans) = thd.transaction() {
                trans.close_scan(scan);
            }
        }
        self.close_pushed_query(thd);
        result
    }
}
