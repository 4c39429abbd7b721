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

//! Row deletes

use std::sync::Arc;

use super::{applying_binlog, Ha, OPERATION_OVERHEAD};
use crate::cluster::OperationDef;
use crate::conflict::ConflictingOpType;
use crate::core::{Error, Result, Row};
use crate::session::ThdNdb;

impl Ha {
    pub fn delete_row(&mut self, row: &Row) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.ndb_delete_row(&mut thd, row, false)
    }

    /// Begin a bulk delete; returns true when batching is not possible
    pub fn start_bulk_delete(&mut self) -> bool {
        self.is_bulk_delete = true;
        false
    }

    /// Send the deletes a bulk delete left pending
    pub fn end_bulk_delete(&mut self) -> Result<()> {
        self.is_bulk_delete = false;
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        if !thd.has_transaction() {
            return Ok(());
        }

        if thd.statement().is_simple_autocommit() && self.rbwr_possible {
            tracing::debug!(table = %self.table.name, "committing read removed delete early");
            let force_send = thd.config().force_send;
            return match thd.execute_commit(force_send, true) {
                Ok(ignored) => {
                    if !applying_binlog(&thd) {
                        self.rows_deleted = self.rows_deleted.saturating_sub(u64::from(ignored));
                    }
                    Ok(())
                }
                Err(err) => {
                    self.rows_deleted = 0;
                    thd.trans_stats.invalidate();
                    Err(self.ndb_err(&mut thd, err))
                }
            };
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
                    self.rows_deleted = self.rows_deleted.saturating_sub(u64::from(ignored));
                    thd.trans_stats
                        .add_uncommitted(&self.share, i64::from(ignored));
                }
                Ok(())
            }
            Err(err) => {
                thd.trans_stats.invalidate();
                Err(self.ndb_err(&mut thd, err))
            }
        }
    }

    /// Delete `row`, through the scan cursor when it came from one
    ///
    /// `pk_update` marks the delete half of a primary key update, which is
    /// always sent at once.
    pub(crate) fn ndb_delete_row(&mut self, thd: &mut ThdNdb, row: &Row, pk_update: bool) -> Result<()> {
        let allow_batch =
            !self.delete_cannot_batch && (self.is_bulk_delete || thd.statement().allow_batch);

        self.start_transaction_part(thd, None)?;

        let cursor = self.cursor;
        if cursor.is_none() && self.rbwr_possible {
            self.rbwr_used = true;
        }
        let by_unique_key = cursor.is_none() && self.rbwr_used && self.active_index_is_unique();
        let part = if by_unique_key {
            None
        } else {
            self.row_partition(row)?.map(|(part, _)| part)
        };

        let mut options = self.dml_options(thd);
        let delete_size = OPERATION_OVERHEAD + self.bytes_per_write / 4;
        let need_flush = thd.add_row_check_if_batch_full(delete_size);

        if let Some(scan) = cursor {
            let result = thd.transaction()?.delete_current_tuple(scan, options);
            if let Err(err) = result {
                return Err(self.ndb_err(thd, Error::Cluster(err)));
            }
            self.lock_tuple = false;
            thd.unsent_bytes += OPERATION_OVERHEAD;
            thd.trans_stats.add_uncommitted(&self.share, -1);
            self.rows_deleted += 1;

            if !(pk_update || self.delete_cannot_batch) {
                // Parts of deleted blobs go with the next execute
                thd.unsent_blob_ops |= self.table_def.has_blobs();
                return Ok(());
            }
        } else {
            options.partition_id = part;
            let (access, key) = self.key_ref(row, self.rbwr_used)?;
            let mut avoid_write = false;
            if self.prepare_conflict_detection(
                thd,
                ConflictingOpType::DeleteRow,
                Some(row),
                None,
                &mut options,
                &mut avoid_write,
            )? {
                return Ok(());
            }
            let op = OperationDef::delete(Arc::clone(&self.table), access, key).with_options(options);
            self.define(thd, op)?;
            thd.trans_stats.add_uncommitted(&self.share, -1);
            self.rows_deleted += 1;

            if allow_batch && self.table_def.primary_key.is_some() && !pk_update && !need_flush {
                return Ok(());
            }
        }

        let ignored = match thd.execute_no_commit(self.ignore_no_key || self.rbwr_used) {
            Ok(count) => count,
            Err(err) => {
                thd.trans_stats.invalidate();
                return Err(self.ndb_err(thd, err));
            }
        };
        if !pk_update && !applying_binlog(thd) {
            self.rows_deleted = self.rows_deleted.saturating_sub(u64::from(ignored));
            thd.trans_stats
                .add_uncommitted(&self.share, i64::from(ignored));
        }
        Ok(())
    }
}
