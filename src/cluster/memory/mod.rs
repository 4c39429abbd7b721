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

//! In-process cluster
//!
//! [`MemoryCluster`] implements [`NdbClient`] and [`NdbDictionary`] over
//! plain maps. Transactions buffer their changes in a write set and merge
//! it on commit, bumping the per-table commit count and the global epoch.
//! Faults can be injected per execute, per key and per auto-increment
//! request, and every defined operation is logged for inspection.
//!
//! Attribute ids are assigned to the stored fields of a [`TableDef`] in
//! field order; a hidden primary key takes the attribute after the last
//! stored field.

mod store;
mod transaction;

pub use store::StoredRow;
pub use transaction::MemoryTransaction;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use self::store::TableData;
use super::client::{NdbClient, NdbTransaction};
use super::dictionary::{
    ColumnKind, NdbColumn, NdbDictionary, NdbIndex, NdbIndexKind, NdbTable,
};
use super::error::NdbError;
use super::types::{
    AbortOption, AttrId, ExecType, LockMode, OperationKind, SetValue, TableStatistics,
    TransactionHint, TupleIdRange,
};
use crate::core::{FieldType, KeyAlgorithm, KeyKind, TableDef, Value};

/// Rows returned per scan batch before the client must contact the cluster
pub const DEFAULT_SCAN_BATCH: usize = 4;

/// Options used when creating a table
#[derive(Debug, Clone, Default)]
pub struct TableOptions {
    /// Index names not created, to simulate indexes that are offline
    pub skip_indexes: Vec<String>,
    /// Add the row author pseudo column used by conflict detection
    pub row_author_bits: bool,
}

/// A defined operation as seen by the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedOperation {
    pub transaction: u64,
    pub kind: OperationKind,
    pub table: String,
    pub key: Vec<Value>,
    pub lock_mode: LockMode,
    pub any_value: Option<u32>,
    pub partition_id: Option<u32>,
    pub interpreted: bool,
    pub set_values: Vec<SetValue>,
    pub deferred_constraints: bool,
    pub disable_fk: bool,
}

/// An execute request as seen by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedExecute {
    pub transaction: u64,
    pub exec_type: ExecType,
    pub abort_option: AbortOption,
    pub pending: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct ForeignKey {
    pub id: u32,
    pub name: String,
    pub child_table: String,
    pub child_attrs: Vec<AttrId>,
    pub parent_table: String,
    pub parent_attrs: Vec<AttrId>,
}

#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub execute: VecDeque<NdbError>,
    pub start_transaction: VecDeque<NdbError>,
    pub auto_increment: VecDeque<NdbError>,
    pub on_key: Vec<(String, Vec<Value>, NdbError)>,
}

/// Shared state behind every handle to the cluster
pub(crate) struct ClusterState {
    pub tables: RwLock<FxHashMap<String, Arc<NdbTable>>>,
    pub indexes: RwLock<FxHashMap<u32, Arc<NdbIndex>>>,
    pub foreign_keys: RwLock<Vec<ForeignKey>>,
    pub data: Mutex<FxHashMap<String, TableData>>,
    pub epoch: AtomicU64,
    pub next_object_id: AtomicU32,
    pub next_transaction_id: AtomicU64,
    pub connect_count: AtomicU64,
    pub scan_batch: usize,
    pub faults: Mutex<Faults>,
    pub op_log: Mutex<Vec<LoggedOperation>>,
    pub exec_log: Mutex<Vec<LoggedExecute>>,
    pub hints: Mutex<Vec<TransactionHint>>,
    pub released_indexes: Mutex<Vec<(String, bool)>>,
}

impl ClusterState {
    pub fn unique_indexes(&self, table: &str) -> Vec<Arc<NdbIndex>> {
        let mut found: Vec<_> = self
            .indexes
            .read()
            .values()
            .filter(|i| i.table == table && i.kind == NdbIndexKind::UniqueHash)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.object_id);
        found
    }

    pub fn index(&self, object_id: u32) -> Option<Arc<NdbIndex>> {
        self.indexes.read().get(&object_id).cloned()
    }

    pub fn key_fault(&self, table: &str, key: &[Value]) -> Option<NdbError> {
        self.faults
            .lock()
            .on_key
            .iter()
            .find(|(t, k, _)| t == table && k.as_slice() == key)
            .map(|(_, _, e)| e.clone())
    }
}

/// An in-process cluster
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::with_scan_batch(DEFAULT_SCAN_BATCH)
    }

    /// Cluster delivering `batch` rows per scan round trip
    pub fn with_scan_batch(batch: usize) -> Self {
        Self {
            state: Arc::new(ClusterState {
                tables: RwLock::new(FxHashMap::default()),
                indexes: RwLock::new(FxHashMap::default()),
                foreign_keys: RwLock::new(Vec::new()),
                data: Mutex::new(FxHashMap::default()),
                epoch: AtomicU64::new(1),
                next_object_id: AtomicU32::new(1),
                next_transaction_id: AtomicU64::new(1),
                connect_count: AtomicU64::new(1),
                scan_batch: batch.max(1),
                faults: Mutex::new(Faults::default()),
                op_log: Mutex::new(Vec::new()),
                exec_log: Mutex::new(Vec::new()),
                hints: Mutex::new(Vec::new()),
                released_indexes: Mutex::new(Vec::new()),
            }),
        }
    }

    fn next_object_id(&self) -> u32 {
        self.state.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    // ---- DDL ----

    /// Create the cluster table and indexes for a table definition
    pub fn create_table(&self, def: &TableDef) -> Result<Arc<NdbTable>, NdbError> {
        self.create_table_with(def, TableOptions::default())
    }

    pub fn create_table_with(
        &self,
        def: &TableDef,
        options: TableOptions,
    ) -> Result<Arc<NdbTable>, NdbError> {
        let name = NdbTable::internal_name(&def.db, &def.name);
        let pk_fields = def.primary_key_fields();

        let mut attr_of_field: Vec<Option<AttrId>> = Vec::with_capacity(def.fields.len());
        let mut columns = Vec::new();
        for (i, field) in def.fields.iter().enumerate() {
            if !field.stored {
                attr_of_field.push(None);
                continue;
            }
            let attr = columns.len() as AttrId;
            attr_of_field.push(Some(attr));
            columns.push(NdbColumn {
                name: field.name.clone(),
                attr_id: attr,
                kind: match field.field_type {
                    FieldType::Blob => ColumnKind::Blob,
                    FieldType::Text => ColumnKind::Text,
                    _ => ColumnKind::Regular,
                },
                nullable: field.nullable,
                primary_key: pk_fields.contains(&i),
                storage: field.storage,
                has_default: field.has_default,
            });
        }

        let hidden_key = if def.has_hidden_primary_key() {
            let attr = columns.len() as AttrId;
            columns.push(NdbColumn {
                name: "$PK".to_string(),
                attr_id: attr,
                kind: ColumnKind::Regular,
                nullable: false,
                primary_key: true,
                storage: crate::core::StorageType::Memory,
                has_default: false,
            });
            Some(attr)
        } else {
            None
        };

        let attrs_of = |parts: &[usize]| -> Result<Vec<AttrId>, NdbError> {
            parts
                .iter()
                .map(|p| {
                    attr_of_field.get(*p).copied().flatten().ok_or_else(|| {
                        NdbError::internal(4243, "Index on a column that is not stored")
                    })
                })
                .collect()
        };

        let mut table = NdbTable::new(name.clone(), self.next_object_id(), def.version, columns);
        // Key order follows the key definition, not attribute order
        if !pk_fields.is_empty() {
            table.primary_key = attrs_of(pk_fields)?;
        }
        table.hidden_key = hidden_key;
        if let Some(p) = &def.partition {
            table.partition_count = p.num_partitions.max(1);
            table.user_partitioned = p.is_user_defined();
        }
        table.row_author_bits = options.row_author_bits;
        let table = Arc::new(table);

        let mut indexes = Vec::new();
        for (k, key) in def.keys.iter().enumerate() {
            let attrs = attrs_of(&key.parts)?;
            let is_pk = Some(k) == def.primary_key;
            if key.kind == KeyKind::Unique && !is_pk {
                let index_name = NdbIndex::unique_index_name(&key.name);
                if !options.skip_indexes.contains(&index_name) {
                    indexes.push(NdbIndex::new(
                        index_name,
                        self.next_object_id(),
                        NdbIndexKind::UniqueHash,
                        name.clone(),
                        attrs.clone(),
                    ));
                }
            }
            if key.algorithm == KeyAlgorithm::BTree && !options.skip_indexes.contains(&key.name) {
                indexes.push(NdbIndex::new(
                    key.name.clone(),
                    self.next_object_id(),
                    NdbIndexKind::Ordered,
                    name.clone(),
                    attrs,
                ));
            }
        }

        {
            let mut registered = self.state.indexes.write();
            for index in indexes {
                registered.insert(index.object_id, Arc::new(index));
            }
        }
        self.state.tables.write().insert(name.clone(), Arc::clone(&table));
        self.state.data.lock().entry(name).or_default();
        Ok(table)
    }

    /// Drop a table and its data
    pub fn drop_table(&self, db: &str, table: &str) {
        let name = NdbTable::internal_name(db, table);
        if let Some(t) = self.state.tables.write().remove(&name) {
            t.set_status_invalid();
        }
        self.state.indexes.write().retain(|_, i| i.table != name);
        self.state.data.lock().remove(&name);
    }

    /// Replace the table with a newer version, keeping its data
    pub fn alter_table_version(&self, db: &str, table: &str, version: u32) -> Result<(), NdbError> {
        let name = NdbTable::internal_name(db, table);
        let mut tables = self.state.tables.write();
        let old = tables.get(&name).cloned().ok_or_else(NdbError::no_such_table)?;
        let mut altered = NdbTable::new(name.clone(), old.id, version, old.columns.clone());
        altered.primary_key = old.primary_key.clone();
        altered.hidden_key = old.hidden_key;
        altered.partition_count = old.partition_count;
        altered.user_partitioned = old.user_partitioned;
        altered.row_author_bits = old.row_author_bits;
        old.set_status_invalid();
        tables.insert(name, Arc::new(altered));
        Ok(())
    }

    /// Register a foreign key; returns its object id
    pub fn add_foreign_key(
        &self,
        name: &str,
        child: &NdbTable,
        child_attrs: &[AttrId],
        parent: &NdbTable,
        parent_attrs: &[AttrId],
    ) -> u32 {
        let id = self.next_object_id();
        self.state.foreign_keys.write().push(ForeignKey {
            id,
            name: name.to_string(),
            child_table: child.name.clone(),
            child_attrs: child_attrs.to_vec(),
            parent_table: parent.name.clone(),
            parent_attrs: parent_attrs.to_vec(),
        });
        id
    }

    // ---- Faults ----

    /// Fail the next execute of any transaction with `error`
    pub fn fail_next_execute(&self, error: NdbError) {
        self.state.faults.lock().execute.push_back(error);
    }

    /// Fail the next transaction start with `error`
    pub fn fail_next_start_transaction(&self, error: NdbError) {
        self.state.faults.lock().start_transaction.push_back(error);
    }

    /// Fail the next auto-increment reservation with `error`
    pub fn fail_next_auto_increment(&self, error: NdbError) {
        self.state.faults.lock().auto_increment.push_back(error);
    }

    /// Fail every operation on the given primary key with `error`
    pub fn fail_operation_on_key(&self, db: &str, table: &str, key: Vec<Value>, error: NdbError) {
        self.state
            .faults
            .lock()
            .on_key
            .push((NdbTable::internal_name(db, table), key, error));
    }

    pub fn clear_faults(&self) {
        *self.state.faults.lock() = Faults::default();
    }

    /// Simulate a reconnect to the cluster
    pub fn reconnect(&self) {
        self.state.connect_count.fetch_add(1, Ordering::Relaxed);
    }

    // ---- Inspection ----

    pub fn operation_log(&self) -> Vec<LoggedOperation> {
        self.state.op_log.lock().clone()
    }

    pub fn execute_log(&self) -> Vec<LoggedExecute> {
        self.state.exec_log.lock().clone()
    }

    pub fn transaction_hints(&self) -> Vec<TransactionHint> {
        self.state.hints.lock().clone()
    }

    pub fn released_indexes(&self) -> Vec<(String, bool)> {
        self.state.released_indexes.lock().clone()
    }

    pub fn clear_logs(&self) {
        self.state.op_log.lock().clear();
        self.state.exec_log.lock().clear();
        self.state.hints.lock().clear();
    }

    /// Latest committed epoch
    pub fn current_epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::Acquire)
    }

    /// Committed row by primary key
    pub fn committed_row(&self, db: &str, table: &str, key: &[Value]) -> Option<StoredRow> {
        let name = NdbTable::internal_name(db, table);
        self.state
            .data
            .lock()
            .get(&name)
            .and_then(|t| t.rows.get(key))
            .cloned()
    }

    /// All committed rows in primary key order
    pub fn committed_rows(&self, db: &str, table: &str) -> Vec<StoredRow> {
        let name = NdbTable::internal_name(db, table);
        self.state
            .data
            .lock()
            .get(&name)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, db: &str, table: &str) -> usize {
        let name = NdbTable::internal_name(db, table);
        self.state
            .data
            .lock()
            .get(&name)
            .map_or(0, |t| t.rows.len())
    }

    /// Store a row directly, as if committed in `epoch` by `author`
    pub fn load_row(&self, table: &NdbTable, values: Vec<Value>, epoch: u64, author: u64) {
        let mut row = StoredRow::new(table.attr_count());
        for (attr, value) in values.into_iter().enumerate() {
            row.set_attr(attr as AttrId, value);
        }
        row.gci = epoch;
        row.author = author;
        let key = row.key(&table.primary_key);
        row.fragment = store::hash_fragment(&key, table.partition_count);
        self.state
            .data
            .lock()
            .entry(table.name.clone())
            .or_default()
            .rows
            .insert(key, row);
        self.state.epoch.fetch_max(epoch, Ordering::AcqRel);
    }
}

impl NdbDictionary for MemoryCluster {
    fn get_table(&self, db: &str, table: &str) -> Result<Arc<NdbTable>, NdbError> {
        self.state
            .tables
            .read()
            .get(&NdbTable::internal_name(db, table))
            .cloned()
            .ok_or_else(NdbError::no_such_table)
    }

    fn get_index(&self, table: &NdbTable, index_name: &str) -> Option<Arc<NdbIndex>> {
        self.state
            .indexes
            .read()
            .values()
            .find(|i| i.table == table.name && i.name == index_name)
            .cloned()
    }

    fn release_index(&self, index: &NdbIndex, invalidate: bool) {
        if invalidate {
            index.set_status_invalid();
        }
        self.state
            .released_indexes
            .lock()
            .push((index.name.clone(), invalidate));
    }

    fn invalidate_table(&self, table: &NdbTable) {
        table.set_status_invalid();
    }

    fn foreign_key_name(&self, fk_id: u32) -> Option<String> {
        self.state
            .foreign_keys
            .read()
            .iter()
            .find(|fk| fk.id == fk_id)
            .map(|fk| fk.name.clone())
    }
}

impl NdbClient for MemoryCluster {
    fn start_transaction(
        &self,
        hint: Option<&TransactionHint>,
    ) -> Result<Box<dyn NdbTransaction>, NdbError> {
        if let Some(err) = self.state.faults.lock().start_transaction.pop_front() {
            return Err(err);
        }
        if let Some(hint) = hint {
            self.state.hints.lock().push(hint.clone());
        }
        let id = self.state.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction::new(Arc::clone(&self.state), id)))
    }

    fn dictionary(&self) -> &dyn NdbDictionary {
        self
    }

    fn table_commit_count(&self, table: &NdbTable) -> Result<u64, NdbError> {
        self.state
            .data
            .lock()
            .get(&table.name)
            .map(|t| t.commit_count)
            .ok_or_else(NdbError::no_such_table)
    }

    fn table_statistics(&self, table: &NdbTable) -> Result<TableStatistics, NdbError> {
        let data = self.state.data.lock();
        let t = data.get(&table.name).ok_or_else(NdbError::no_such_table)?;
        let row_size = 8 * table.attr_count() as u64;
        let row_count = t.rows.len() as u64;
        Ok(TableStatistics {
            row_count,
            commit_count: t.commit_count,
            row_size,
            fragment_memory: row_count * row_size,
        })
    }

    fn get_auto_increment_value(
        &self,
        table: &NdbTable,
        range: &mut TupleIdRange,
        cache_size: u32,
        step: u64,
        start: u64,
    ) -> Result<u64, NdbError> {
        if let Some(err) = self.state.faults.lock().auto_increment.pop_front() {
            return Err(err);
        }
        let step = step.max(1);
        let start = start.max(1);
        loop {
            if range.first_tuple_id >= range.last_tuple_id {
                let mut data = self.state.data.lock();
                let t = data.get_mut(&table.name).ok_or_else(NdbError::no_such_table)?;
                let first = t.next_auto_increment.max(1);
                let count = u64::from(cache_size.max(1));
                t.next_auto_increment = first + count;
                range.first_tuple_id = first;
                range.last_tuple_id = first + count;
            }
            let value = range.first_tuple_id;
            range.first_tuple_id += 1;
            if value >= start && (value - start) % step == 0 {
                range.highest_seen = range.highest_seen.max(value);
                return Ok(value);
            }
        }
    }

    fn read_auto_increment_value(
        &self,
        table: &NdbTable,
        range: &TupleIdRange,
    ) -> Result<u64, NdbError> {
        if range.first_tuple_id < range.last_tuple_id {
            return Ok(range.first_tuple_id);
        }
        self.state
            .data
            .lock()
            .get(&table.name)
            .map(|t| t.next_auto_increment.max(1))
            .ok_or_else(NdbError::no_such_table)
    }

    fn set_auto_increment_value(
        &self,
        table: &NdbTable,
        range: &mut TupleIdRange,
        value: u64,
        modify: bool,
    ) -> Result<(), NdbError> {
        let mut data = self.state.data.lock();
        let t = data.get_mut(&table.name).ok_or_else(NdbError::no_such_table)?;
        if !modify || value > t.next_auto_increment {
            t.next_auto_increment = value;
        }
        if value >= range.last_tuple_id {
            range.first_tuple_id = 0;
            range.last_tuple_id = 0;
        } else if value > range.first_tuple_id {
            range.first_tuple_id = value;
        }
        range.highest_seen = range.highest_seen.max(value.saturating_sub(1));
        Ok(())
    }

    fn connect_count(&self) -> u64 {
        self.state.connect_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TableDefBuilder;

    fn users() -> TableDef {
        TableDefBuilder::new("test", "users")
            .add("id", FieldType::Integer)
            .add_nullable("email", FieldType::Varchar)
            .add_nullable("age", FieldType::Integer)
            .primary_key(&["id"])
            .unique_key("uk_email", &["email"])
            .index("ix_age", &["age"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_create_table_indexes() {
        let cluster = MemoryCluster::new();
        let table = cluster.create_table(&users()).unwrap();
        assert_eq!(table.name, "test/def/users");
        assert_eq!(table.primary_key, vec![0]);
        let dict = cluster.dictionary();
        assert!(dict.get_index(&table, "PRIMARY").is_some());
        let uk = dict.get_index(&table, "uk_email$unique").unwrap();
        assert_eq!(uk.kind, NdbIndexKind::UniqueHash);
        assert_eq!(uk.columns, vec![1]);
        assert!(dict.get_index(&table, "uk_email").is_some());
        assert!(dict.get_index(&table, "ix_age").is_some());
        assert!(dict.get_table("test", "missing").is_err());
    }

    #[test]
    fn test_skip_index_and_hidden_key() {
        let cluster = MemoryCluster::new();
        let def = TableDefBuilder::new("test", "log")
            .add("msg", FieldType::Varchar)
            .build()
            .unwrap();
        let table = cluster.create_table(&def).unwrap();
        assert_eq!(table.hidden_key, Some(1));
        assert_eq!(table.primary_key, vec![1]);

        let table = cluster
            .create_table_with(
                &users(),
                TableOptions {
                    skip_indexes: vec!["uk_email$unique".to_string()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(cluster.get_index(&table, "uk_email$unique").is_none());
    }

    #[test]
    fn test_auto_increment_ranges() {
        let cluster = MemoryCluster::new();
        let table = cluster.create_table(&users()).unwrap();
        let mut range = TupleIdRange::default();
        assert_eq!(cluster.get_auto_increment_value(&table, &mut range, 3, 1, 1).unwrap(), 1);
        assert_eq!(cluster.get_auto_increment_value(&table, &mut range, 3, 1, 1).unwrap(), 2);
        assert_eq!(range.remaining(), 1);

        let mut other = TupleIdRange::default();
        assert_eq!(cluster.get_auto_increment_value(&table, &mut other, 3, 1, 1).unwrap(), 4);

        cluster.set_auto_increment_value(&table, &mut range, 100, true).unwrap();
        assert_eq!(cluster.get_auto_increment_value(&table, &mut range, 3, 1, 1).unwrap(), 100);
        assert!(!cluster.check_update_auto_increment_value(&range, 50));
        assert!(cluster.check_update_auto_increment_value(&range, 150));

        cluster.fail_next_auto_increment(NdbError::timeout());
        assert!(cluster.get_auto_increment_value(&table, &mut range, 3, 1, 1).is_err());
    }

    #[test]
    fn test_alter_version_invalidates() {
        let cluster = MemoryCluster::new();
        let table = cluster.create_table(&users()).unwrap();
        cluster.alter_table_version("test", "users", 2).unwrap();
        assert_eq!(table.status(), crate::cluster::ObjectStatus::Invalid);
        assert_eq!(cluster.get_table("test", "users").unwrap().version, 2);
    }
}
