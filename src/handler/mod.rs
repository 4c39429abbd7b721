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

//! Table handler
//!
//! [`Ha`] is one open instance of a cluster table inside a server session.
//! The server drives it through the storage engine calls: key reads,
//! ordered and full scans, row writes, updates and deletes, plus the
//! statement control calls (`extra`, `info`, `reset`, bulk begin/end).
//!
//! All cluster work goes through the session's transaction, reached through
//! the [`SharedSession`] the handler was opened with. Handler entry points
//! lock the session once and pass `&mut ThdNdb` down to their helpers.
//!
//! - [`column_map`] - server field to cluster attribute mapping
//! - [`index_data`] - per index handles, records and capabilities
//! - `read` / `scan` - key reads, ordered and full table scans
//! - `write` / `update` / `delete` - row changes and batching
//! - `peek` - duplicate detection before IGNORE writes
//! - `pushed` - pushed join execution on the handler side
//! - `conflict` - conflict detection setup for applied rows

pub mod blob;
pub mod column_map;
mod conflict;
mod delete;
pub mod index_data;
mod peek;
mod pushed;
mod read;
mod scan;
mod update;
mod write;

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub use blob::BlobBuffer;
pub use column_map::ColumnMap;
pub use index_data::{IndexData, IndexType};
pub use pushed::PushedJoin;

use crate::cluster::error::{
    NDB_ERR_FK_NO_PARENT, NDB_ERR_TUPLE_EXISTS, NDB_ERR_UNIQUE_VIOLATION,
};
use crate::cluster::{
    AttrId, ExtraColumn, KeyAccess, LockMode, NdbClient, NdbErrorClassification, NdbRecord,
    NdbTable, ObjectStatus, OperationOptions, PseudoColumn, RecordColumn, RecordKind, ScanId,
    TransactionHint,
};
use crate::conflict::any_value::ANYVALUE_FOR_NOLOGGING;
use crate::core::{
    Error, ExtraOption, FieldBitmap, IndexFlags, InfoFlags, Result, Row, SqlCommand, TableDef,
    ThrLockType, Value,
};
use crate::session::{ndb_to_mysql_error, SharedSession, ThdNdb, TransOption};
use crate::share::NdbShare;

/// Cache size used when reserving hidden primary key values
const HIDDEN_KEY_CACHE_SIZE: u32 = 1000;
/// Attempts of an auto-increment reservation hitting temporary errors
const AUTO_INCREMENT_RETRIES: u32 = 100;
const AUTO_INCREMENT_RETRY_SLEEP: Duration = Duration::from_millis(30);
/// Bytes accounted for an operation on top of its row data
pub(crate) const OPERATION_OVERHEAD: usize = 12;

/// Predicate evaluated on fetched rows that could not be pushed down
pub type RowPredicate = Arc<dyn Fn(&Row) -> bool + Send + Sync>;

/// Partitions a statement may touch, as found by partition pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionPruning {
    #[default]
    All,
    /// Pruning eliminated every partition
    Nothing,
    Single(u32),
}

/// Values reported through `info()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HaStats {
    pub records: u64,
    pub auto_increment_value: u64,
    /// Key of the last duplicate key error
    pub errkey: Option<usize>,
    pub mrr_length_per_rec: usize,
}

pub struct Ha {
    session: SharedSession,
    client: Arc<dyn NdbClient>,
    share: Arc<NdbShare>,
    table_def: Arc<TableDef>,
    table: Arc<NdbTable>,
    column_map: ColumnMap,
    indexes: Vec<IndexData>,
    /// Full row image, attribute to field
    row_record: NdbRecord,
    hidden_key_record: Option<NdbRecord>,
    pk_bitmap: FieldBitmap,
    /// Fields of every key
    key_bitmaps: Vec<FieldBitmap>,
    bytes_per_write: usize,
    blob: BlobBuffer,

    // ---- Statement state ----
    lock_type: ThrLockType,
    read_set: FieldBitmap,
    write_set: FieldBitmap,
    active_index: Option<usize>,
    sorted: bool,
    cursor: Option<ScanId>,
    /// Row lock of the current scan row must be taken over
    lock_tuple: bool,
    pushed: Option<PushedJoin>,
    disable_pushed_join: bool,
    condition: Option<RowPredicate>,
    pruning: PartitionPruning,
    ignore_dup_key: bool,
    use_write: bool,
    ignore_no_key: bool,
    delete_cannot_batch: bool,
    update_cannot_batch: bool,
    is_bulk_delete: bool,
    rows_to_insert: u64,
    rows_inserted: u64,
    rows_updated: u64,
    rows_deleted: u64,
    dupkey: Option<usize>,
    rbwr_possible: bool,
    rbwr_used: bool,
    autoincrement_prefetch: u32,
    /// Hidden key and fragment of the last fetched row
    hidden_key_value: Option<Value>,
    fragment: Option<u32>,
    ref_: Vec<Value>,
    /// Commit count of the source table when a copying ALTER started scanning
    alter_commit_count: Option<u64>,
    stats: HaStats,
}

impl std::fmt::Debug for Ha {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ha")
            .field("table", &self.table.name)
            .field("active_index", &self.active_index)
            .field("cursor", &self.cursor)
            .field("lock_type", &self.lock_type)
            .field("rows_to_insert", &self.rows_to_insert)
            .field("rows_updated", &self.rows_updated)
            .field("rows_deleted", &self.rows_deleted)
            .finish()
    }
}

impl Ha {
    /// Open the cluster table behind `table_def` in `session`
    ///
    /// Fails with `TableDefChanged` when the cluster holds another version
    /// of the table than the server expects.
    pub fn open(
        session: &SharedSession,
        share: Arc<NdbShare>,
        table_def: Arc<TableDef>,
    ) -> Result<Self> {
        let client = Arc::clone(session.lock().client());
        let dict = client.dictionary();
        let table = match dict.get_table(&table_def.db, &table_def.name) {
            Ok(table) => table,
            Err(err) => return Err(session.lock().map_error(Error::Cluster(err))),
        };
        if table.version != table_def.version {
            dict.invalidate_table(&table);
            return Err(Error::table_def_changed(format!(
                "{} has version {}, expected {}",
                table.name, table.version, table_def.version
            )));
        }

        let column_map = ColumnMap::new(&table_def, &table)?;
        let row_record = NdbRecord::new(
            RecordKind::Table,
            (0..column_map.attr_count() as AttrId)
                .filter_map(|attr| {
                    column_map
                        .field(attr)
                        .map(|source| RecordColumn { attr, source })
                })
                .collect(),
        );
        let hidden_key_record = table
            .hidden_key
            .map(|attr| NdbRecord::new(RecordKind::HiddenKey, vec![RecordColumn { attr, source: 0 }]));

        let field_count = table_def.fields.len();
        let pk_bitmap = FieldBitmap::from_bits(field_count, table_def.primary_key_fields());
        let key_bitmaps = table_def
            .keys
            .iter()
            .map(|k| FieldBitmap::from_bits(field_count, &k.parts))
            .collect();
        let indexes = (0..table_def.keys.len())
            .map(|k| IndexData::open(dict, &table, &table_def, k, &column_map))
            .collect::<Result<Vec<_>>>()?;

        let bytes_per_write = OPERATION_OVERHEAD + table_def.row_size() + 4 * table.attr_count();
        let autoincrement_prefetch = session.lock().config().autoincrement_prefetch_sz;

        tracing::debug!(
            table = %table.name,
            indexes = indexes.len(),
            hidden_key = table.hidden_key.is_some(),
            bytes_per_write,
            "table opened"
        );

        Ok(Self {
            session: Arc::clone(session),
            client,
            share,
            table,
            column_map,
            indexes,
            row_record,
            hidden_key_record,
            pk_bitmap,
            key_bitmaps,
            bytes_per_write,
            blob: BlobBuffer::new(),
            lock_type: ThrLockType::Read,
            read_set: FieldBitmap::all(field_count),
            write_set: FieldBitmap::all(field_count),
            active_index: None,
            sorted: false,
            cursor: None,
            lock_tuple: false,
            pushed: None,
            disable_pushed_join: false,
            condition: None,
            pruning: PartitionPruning::All,
            ignore_dup_key: false,
            use_write: false,
            ignore_no_key: false,
            delete_cannot_batch: false,
            update_cannot_batch: false,
            is_bulk_delete: false,
            rows_to_insert: 1,
            rows_inserted: 0,
            rows_updated: 0,
            rows_deleted: 0,
            dupkey: None,
            rbwr_possible: false,
            rbwr_used: false,
            autoincrement_prefetch,
            hidden_key_value: None,
            fragment: None,
            ref_: Vec::new(),
            alter_commit_count: None,
            stats: HaStats::default(),
            table_def,
        })
    }

    /// Close the handler, giving index handles back to the dictionary
    pub fn close(&mut self) -> Result<()> {
        let result = if self.cursor.is_some() || self.pushed_query_open() {
            let session = Arc::clone(&self.session);
            let mut thd = session.lock();
            self.close_scan(&mut thd)
        } else {
            Ok(())
        };
        let invalidate = self.table.status() == ObjectStatus::Invalid;
        let dict = self.client.dictionary();
        for index in self.indexes.iter_mut() {
            index.release(dict, invalidate);
        }
        self.blob.release();
        tracing::debug!(table = %self.table.name, invalidate, "table closed");
        result
    }

    // ---- Accessors ----

    pub fn table(&self) -> &Arc<NdbTable> {
        &self.table
    }

    pub fn table_def(&self) -> &TableDef {
        &self.table_def
    }

    pub fn share(&self) -> &Arc<NdbShare> {
        &self.share
    }

    pub fn column_map(&self) -> &ColumnMap {
        &self.column_map
    }

    pub fn index(&self, idx: usize) -> Option<&IndexData> {
        self.indexes.get(idx)
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active_index
    }

    pub fn blob_buffer(&self) -> &BlobBuffer {
        &self.blob
    }

    pub fn bytes_per_write(&self) -> usize {
        self.bytes_per_write
    }

    pub fn rows_updated(&self) -> u64 {
        self.rows_updated
    }

    pub fn rows_deleted(&self) -> u64 {
        self.rows_deleted
    }

    pub fn rows_to_insert(&self) -> u64 {
        self.rows_to_insert
    }

    /// Key of the last duplicate key error
    pub fn dupkey(&self) -> Option<usize> {
        self.dupkey
    }

    /// Stored position of the last row passed to [`position`](Self::position)
    pub fn ref_(&self) -> &[Value] {
        &self.ref_
    }

    pub fn has_open_scan(&self) -> bool {
        self.cursor.is_some()
    }

    /// A row lock taken by the scan is waiting to be kept
    pub fn has_pending_row_lock(&self) -> bool {
        self.lock_tuple
    }

    pub fn read_set(&self) -> &FieldBitmap {
        &self.read_set
    }

    pub fn write_set(&self) -> &FieldBitmap {
        &self.write_set
    }

    pub fn set_read_set(&mut self, fields: FieldBitmap) {
        self.read_set = fields;
    }

    pub fn set_write_set(&mut self, fields: FieldBitmap) {
        self.write_set = fields;
    }

    /// Install the part of the WHERE clause evaluated on fetched rows
    pub fn set_condition(&mut self, condition: Option<RowPredicate>) {
        self.condition = condition;
    }

    pub fn set_partition_pruning(&mut self, pruning: PartitionPruning) {
        self.pruning = pruning;
    }

    // ---- Capabilities ----

    pub fn index_flags(&self, idx: usize) -> IndexFlags {
        self.indexes
            .get(idx)
            .map(IndexData::index_flags)
            .unwrap_or_default()
    }

    /// Rows come back in primary key order when scanning the primary key
    pub fn primary_key_is_clustered(&self) -> bool {
        self.table_def
            .primary_key
            .and_then(|pk| self.indexes.get(pk))
            .map_or(false, |i| i.index_type().is_ordered())
    }

    // ---- Locking ----

    /// Lock level to use for the statement, as stored in the table lock
    pub fn store_lock(&mut self, lock_type: ThrLockType) -> ThrLockType {
        let stored = match lock_type {
            // Row level locking lets concurrent writers through
            ThrLockType::WriteConcurrentInsert
            | ThrLockType::WriteLowPriority
            | ThrLockType::Write => ThrLockType::WriteAllowWrite,
            ThrLockType::ReadNoInsert => ThrLockType::Read,
            other => other,
        };
        if lock_type != ThrLockType::Unlock {
            self.lock_type = stored;
        }
        stored
    }

    /// Table is taken into use, or released with `Unlock`, by a statement
    pub fn external_lock(&mut self, lock_type: ThrLockType) -> Result<()> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        if lock_type == ThrLockType::Unlock {
            let result = if self.cursor.is_some() {
                self.close_scan(&mut thd)
            } else {
                Ok(())
            };
            self.alter_commit_count = None;
            return result;
        }
        self.lock_type = lock_type;
        thd.trans_stats.register(&self.share);
        self.autoincrement_prefetch = thd.config().autoincrement_prefetch_sz;
        Ok(())
    }

    /// Row lock mode derived from the table lock
    pub(crate) fn lock_mode(&self) -> LockMode {
        if self.lock_type >= ThrLockType::WriteAllowWrite {
            LockMode::Exclusive
        } else if self.lock_type == ThrLockType::ReadWithSharedLocks {
            LockMode::Read
        } else {
            LockMode::CommittedRead
        }
    }

    // ---- Statement control ----

    pub fn extra(&mut self, option: ExtraOption) {
        match option {
            ExtraOption::IgnoreDupKey => self.ignore_dup_key = true,
            ExtraOption::NoIgnoreDupKey => self.ignore_dup_key = false,
            ExtraOption::IgnoreNoKey => self.ignore_no_key = true,
            ExtraOption::NoIgnoreNoKey => self.ignore_no_key = false,
            ExtraOption::WriteCanReplace => {
                let applying = applying_binlog(&self.session.lock());
                if !self.table_def.has_unique_keys() || applying {
                    self.use_write = true;
                }
            }
            ExtraOption::WriteCannotReplace => self.use_write = false,
            ExtraOption::DeleteCannotBatch => self.delete_cannot_batch = true,
            ExtraOption::UpdateCannotBatch => self.update_cannot_batch = true,
            ExtraOption::KeyRead => self.disable_pushed_join = true,
            ExtraOption::NoKeyRead => self.disable_pushed_join = false,
            ExtraOption::BeginAlterCopy => {
                // The copy target is dropped on failure, so it may commit as it goes
                self.session
                    .lock()
                    .set_trans_option(TransOption::TransactionsOff);
            }
            ExtraOption::EndAlterCopy | ExtraOption::Other => {}
        }
    }

    /// Clear all statement scoped state
    pub fn reset(&mut self) {
        self.pushed = None;
        self.disable_pushed_join = false;
        self.condition = None;
        self.pruning = PartitionPruning::All;
        self.rbwr_possible = false;
        self.rbwr_used = false;
        self.rows_updated = 0;
        self.rows_deleted = 0;
        self.rows_inserted = 0;
        self.ignore_dup_key = false;
        self.use_write = false;
        self.ignore_no_key = false;
        self.rows_to_insert = 1;
        self.delete_cannot_batch = false;
        self.update_cannot_batch = false;
        self.is_bulk_delete = false;
    }

    /// Statistics for the optimizer
    pub fn info(&mut self, flags: InfoFlags) -> Result<HaStats> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();

        if flags.contains(InfoFlags::VARIABLE) {
            let have_trans_stats = thd.trans_stats.get(self.share.key()).is_some();
            if !(flags.contains(InfoFlags::NO_LOCK) && have_trans_stats) {
                let cached = self
                    .share
                    .cached_stats()
                    .filter(|_| !thd.config().use_exact_count);
                let stats = match cached {
                    Some(stats) => stats,
                    None => match self.client.table_statistics(&self.table) {
                        Ok(stats) => {
                            self.share.set_cached_stats(stats);
                            stats
                        }
                        Err(err) => return Err(self.ndb_err(&mut thd, Error::Cluster(err))),
                    },
                };
                thd.trans_stats.register(&self.share).table_rows = stats.row_count;
            }
            let rows = thd.trans_stats.register(&self.share).rows();
            self.stats.records = if !thd.statement().command.is_show() && rows < 2 {
                // Zero or one row estimates make the optimizer pick const plans
                2
            } else {
                rows
            };
        }
        if flags.contains(InfoFlags::CONST) {
            self.stats.mrr_length_per_rec =
                std::mem::size_of::<u64>() + self.table_def.row_size();
        }
        if flags.contains(InfoFlags::ERRKEY) {
            self.stats.errkey = self.dupkey;
        }
        if flags.contains(InfoFlags::AUTO) && self.table_def.auto_increment_field().is_some() {
            let range = self.share.tuple_id_range();
            self.stats.auto_increment_value = self
                .client
                .read_auto_increment_value(&self.table, &range)
                .unwrap_or(u64::MAX);
        }
        Ok(self.stats)
    }

    /// Prepare to skip reads before key updates and deletes
    ///
    /// Only possible when the commit reports missing rows itself.
    pub fn start_read_removal(&mut self) -> bool {
        let blob_written = self
            .table_def
            .blob_fields()
            .any(|f| self.write_set.is_set(f));
        let command = self.session.lock().statement().command;
        let deleting = matches!(command, SqlCommand::Delete | SqlCommand::DeleteMulti);
        let unique_written = self
            .table_def
            .keys
            .iter()
            .enumerate()
            .any(|(k, key)| key.is_unique() && self.key_bitmaps[k].overlaps(&self.write_set));

        if blob_written
            || (deleting && self.table_def.has_blobs())
            || self.table_def.has_hidden_primary_key()
            || self.write_set.overlaps(&self.pk_bitmap)
            || unique_written
        {
            return false;
        }
        self.rbwr_possible = true;
        true
    }

    /// Rows changed without a read
    pub fn end_read_removal(&mut self) -> u64 {
        self.rows_updated + self.rows_deleted
    }

    // ---- Positions ----

    /// Remember the position of `row` for a later [`rnd_pos`](Self::rnd_pos)
    pub fn position(&mut self, row: &Row) {
        let mut pos = match self.table_def.primary_key {
            Some(_) => row.project(self.table_def.primary_key_fields()),
            None => vec![self.hidden_key_value.clone().unwrap_or(Value::Null)],
        };
        if self.table_def.partition.is_some() {
            pos.push(self.fragment.map_or(Value::Null, |p| Value::unsigned(p as u64)));
        }
        self.ref_ = pos;
    }

    pub fn cmp_ref(&self, a: &[Value], b: &[Value]) -> Ordering {
        for (x, y) in a.iter().zip(b.iter()) {
            match x.compare(y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        a.len().cmp(&b.len())
    }

    // ---- Helpers shared by the row calls ----

    /// Translate an error raised while serving this table
    ///
    /// Duplicate key errors name the offending key, schema errors invalidate
    /// the cached table definition.
    pub(crate) fn ndb_err(&mut self, thd: &mut ThdNdb, err: Error) -> Error {
        let Error::Cluster(ndb) = err else {
            return err;
        };
        if ndb.classification == NdbErrorClassification::SchemaError {
            self.client.dictionary().invalidate_table(&self.table);
            ndb_to_mysql_error(&ndb, &mut thd.warnings);
            tracing::info!(table = %self.table.name, code = ndb.code, "table definition invalidated");
            return Error::table_def_changed(ndb.message);
        }
        match ndb.code {
            NDB_ERR_TUPLE_EXISTS => {
                ndb_to_mysql_error(&ndb, &mut thd.warnings);
                self.dupkey = self.table_def.primary_key;
                Error::duplicate_key(self.dupkey)
            }
            NDB_ERR_UNIQUE_VIOLATION => {
                ndb_to_mysql_error(&ndb, &mut thd.warnings);
                self.dupkey = ndb.details.and_then(|id| {
                    self.indexes
                        .iter()
                        .position(|i| i.unique_index().map_or(false, |u| u.object_id == id))
                });
                Error::duplicate_key(self.dupkey)
            }
            NDB_ERR_FK_NO_PARENT => {
                ndb_to_mysql_error(&ndb, &mut thd.warnings);
                let constraint = ndb
                    .details
                    .and_then(|id| self.client.dictionary().foreign_key_name(id))
                    .unwrap_or_else(|| "<unknown>".to_string());
                Error::ForeignKeyViolation {
                    constraint,
                    detail: ndb.message,
                }
            }
            _ => thd.map_error(Error::Cluster(ndb)),
        }
    }

    /// Start the transaction close to the row with primary key `key`
    pub(crate) fn start_transaction_key(&self, thd: &mut ThdNdb, key: &[Value]) -> Result<()> {
        let hint = TransactionHint::Key {
            table: self.table.name.clone(),
            key: key.to_vec(),
        };
        thd.acquire_transaction(Some(&hint))?;
        Ok(())
    }

    pub(crate) fn start_transaction_part(&self, thd: &mut ThdNdb, part: Option<u32>) -> Result<()> {
        let hint = part.map(|partition_id| TransactionHint::Partition {
            table: self.table.name.clone(),
            partition_id,
        });
        thd.acquire_transaction(hint.as_ref())?;
        Ok(())
    }

    /// Primary key values of `row` in cluster key order
    pub(crate) fn pk_wire_key(&self, row: &Row) -> Result<Vec<Value>> {
        match self.table_def.primary_key {
            Some(pk) => self.indexes[pk]
                .unique_row_record()
                .map(|r| r.key_values(row))
                .ok_or_else(|| Error::internal("primary key without record")),
            None => self
                .hidden_key_value
                .as_ref()
                .map(|v| self.hidden_key(v))
                .ok_or_else(|| Error::internal("no hidden key for row")),
        }
    }

    /// Key values addressing the row with hidden primary key `value`
    pub(crate) fn hidden_key(&self, value: &Value) -> Vec<Value> {
        match &self.hidden_key_record {
            Some(record) => record.key_values(std::slice::from_ref(value)),
            None => vec![value.clone()],
        }
    }

    /// Key used to address `row` in an update or delete
    ///
    /// The active unique index when it is known to be read, otherwise the
    /// primary key, otherwise the hidden key of the last fetched row.
    pub(crate) fn key_ref(&self, row: &Row, use_active_index: bool) -> Result<(KeyAccess, Vec<Value>)> {
        if use_active_index {
            if let Some(record) = self
                .active_index
                .and_then(|i| self.indexes.get(i))
                .and_then(IndexData::unique_row_record)
            {
                return Ok((record.access(), record.key_values(row)));
            }
        }
        Ok((KeyAccess::PrimaryKey, self.pk_wire_key(row)?))
    }

    /// Partition and partition function value of `row`, for user partitioning
    pub(crate) fn row_partition(&self, row: &Row) -> Result<Option<(u32, i64)>> {
        match &self.table_def.partition {
            Some(p) if p.is_user_defined() => Ok(Some(p.partition_id(row)?)),
            _ => Ok(None),
        }
    }

    /// Options common to every row change of this session
    pub(crate) fn dml_options(&self, thd: &ThdNdb) -> OperationOptions {
        let mut options = OperationOptions::default();
        if thd.check_trans_option(TransOption::NoLogging) {
            options.any_value = Some(ANYVALUE_FOR_NOLOGGING);
        } else if let Some(applier) = thd.get_applier() {
            options.any_value = Some(applier.row_event_server_id());
        }
        options.deferred_constraints = thd.is_applier() || thd.config().deferred_constraints;
        options.disable_fk = !thd.config().foreign_key_checks;
        if thd.is_applier() && self.table.row_author_bits {
            options.set_value(ExtraColumn::Pseudo(PseudoColumn::RowAuthor), Value::unsigned(1));
        }
        options
    }

    /// Extra values fetched with every row for `position`
    pub(crate) fn position_extras(&self) -> Vec<ExtraColumn> {
        let mut extras = Vec::new();
        if let Some(hidden) = self.table.hidden_key {
            extras.push(ExtraColumn::Attr(hidden));
        }
        if self.table_def.partition.is_some() {
            extras.push(ExtraColumn::Pseudo(PseudoColumn::Fragment));
        }
        extras
    }

    pub(crate) fn capture_position_extras(&mut self, extra: &[(ExtraColumn, Value)]) {
        for (column, value) in extra {
            match column {
                ExtraColumn::Attr(a) if Some(*a) == self.table.hidden_key => {
                    self.hidden_key_value = Some(value.clone());
                }
                ExtraColumn::Pseudo(PseudoColumn::Fragment) => {
                    self.fragment = value.as_u64().map(|f| f as u32);
                }
                _ => {}
            }
        }
    }

    /// Attribute mask of the read set, blobs excluded
    pub(crate) fn read_attr_mask(&self) -> FieldBitmap {
        self.value_attr_mask(&self.read_set)
    }

    /// Attribute mask of `fields` without blob columns, which travel
    /// through their own blob handles
    pub(crate) fn value_attr_mask(&self, fields: &FieldBitmap) -> FieldBitmap {
        let mut mask = self.column_map.attr_mask(fields);
        for field in self.table_def.blob_fields() {
            if let Some(attr) = self.column_map.attr(field) {
                mask.clear(attr as usize);
            }
        }
        mask
    }

    // ---- Auto-increment ----

    /// Reserve a value from the table's tuple id range
    ///
    /// Temporary errors are retried a bounded number of times.
    fn reserve_tuple_id(&self, thd: &mut ThdNdb, cache_size: u32, step: u64, start: u64) -> Result<u64> {
        let mut retries = AUTO_INCREMENT_RETRIES;
        loop {
            let result = {
                let mut range = self.share.tuple_id_range();
                self.client
                    .get_auto_increment_value(&self.table, &mut range, cache_size, step, start)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_temporary() && retries > 1 => {
                    retries -= 1;
                    tracing::debug!(
                        table = %self.table.name,
                        code = err.code,
                        retries,
                        "temporary error reserving auto-increment value, retrying"
                    );
                    std::thread::sleep(AUTO_INCREMENT_RETRY_SLEEP);
                }
                Err(err) => {
                    tracing::warn!(table = %self.table.name, code = err.code, "auto-increment reservation failed");
                    return Err(thd.map_error(Error::Cluster(err)));
                }
            }
        }
    }

    /// Next hidden primary key value
    pub(crate) fn reserve_hidden_key(&self, thd: &mut ThdNdb) -> Result<u64> {
        self.reserve_tuple_id(thd, HIDDEN_KEY_CACHE_SIZE, 1, 1)
    }

    /// Reserve auto-increment values for the rows about to be inserted
    ///
    /// Returns the first value; the rest of the cached range is handed out
    /// by later calls.
    pub fn get_auto_increment(&mut self, offset: u64, increment: u64, nb_desired: u64) -> Result<u64> {
        let session = Arc::clone(&self.session);
        let mut thd = session.lock();
        self.get_auto_increment_inner(&mut thd, offset, increment, nb_desired)
    }

    pub(crate) fn get_auto_increment_inner(
        &mut self,
        thd: &mut ThdNdb,
        offset: u64,
        increment: u64,
        nb_desired: u64,
    ) -> Result<u64> {
        let prefetch = u64::from(self.autoincrement_prefetch.max(1));
        let remaining = self.rows_to_insert.saturating_sub(self.rows_inserted);
        let cache_size = if remaining > 1 && remaining < prefetch {
            remaining
        } else {
            nb_desired.max(prefetch)
        };
        let cache_size = u32::try_from(cache_size).unwrap_or(u32::MAX);
        self.reserve_tuple_id(thd, cache_size, increment.max(1), offset.max(1))
    }

    /// Move the auto-increment high-water mark past an explicit value
    pub(crate) fn set_auto_inc(&self, thd: &mut ThdNdb, row: &Row) -> Result<()> {
        let Some(field) = self.table_def.auto_increment_field() else {
            return Ok(());
        };
        let Some(value) = row.value(field).as_u64() else {
            return Ok(());
        };
        let next = value.saturating_add(1);
        let mut range = self.share.tuple_id_range();
        if self.client.check_update_auto_increment_value(&range, next) {
            tracing::debug!(table = %self.table.name, next, "raising auto-increment value");
            if let Err(err) = self
                .client
                .set_auto_increment_value(&self.table, &mut range, next, true)
            {
                drop(range);
                return Err(thd.map_error(Error::Cluster(err)));
            }
        }
        Ok(())
    }
}

/// Rows come from replication, either the applier or a binlog replay
pub(crate) fn applying_binlog(thd: &ThdNdb) -> bool {
    thd.is_applier() || thd.statement().applying_binlog
}
