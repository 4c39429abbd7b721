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

//! Row storage for the in-memory cluster
//!
//! - [`StoredRow`] - A stored tuple with its pseudo columns
//! - [`TableData`] - Committed rows of one table keyed by primary key
//! - [`WriteSet`] - Transaction-local changes layered over committed data

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};

use crate::cluster::dictionary::{NdbIndex, NdbTable};
use crate::cluster::types::{AttrId, ExtraColumn, PseudoColumn};
use crate::core::Value;

/// A stored tuple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Attribute values indexed by attribute id
    pub values: Vec<Value>,
    /// Epoch of the last committed change
    pub gci: u64,
    pub author: u64,
    pub fragment: u32,
    pub partition_function: Option<i64>,
}

impl StoredRow {
    pub fn new(attr_count: usize) -> Self {
        Self {
            values: vec![Value::Null; attr_count],
            gci: 0,
            author: 0,
            fragment: 0,
            partition_function: None,
        }
    }

    pub fn attr(&self, attr: AttrId) -> Value {
        self.values
            .get(attr as usize)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn set_attr(&mut self, attr: AttrId, value: Value) {
        if let Some(slot) = self.values.get_mut(attr as usize) {
            *slot = value;
        }
    }

    /// Resolve a column for programs and extra get-values
    pub fn column(&self, column: ExtraColumn) -> Value {
        match column {
            ExtraColumn::Attr(a) => self.attr(a),
            ExtraColumn::Pseudo(PseudoColumn::Fragment) => Value::unsigned(u64::from(self.fragment)),
            ExtraColumn::Pseudo(PseudoColumn::RowGci64) => Value::unsigned(self.gci),
            ExtraColumn::Pseudo(PseudoColumn::RowAuthor) => Value::unsigned(self.author),
            ExtraColumn::Pseudo(PseudoColumn::PartitionFunction) => self
                .partition_function
                .map_or(Value::Null, Value::integer),
        }
    }

    /// Key values for the given attributes
    pub fn key(&self, attrs: &[AttrId]) -> Vec<Value> {
        attrs.iter().map(|a| self.attr(*a)).collect()
    }
}

/// Committed state of one table
#[derive(Debug, Default)]
pub struct TableData {
    pub rows: BTreeMap<Vec<Value>, StoredRow>,
    pub commit_count: u64,
    pub next_auto_increment: u64,
}

/// Transaction-local changes; `None` marks a deleted row
#[derive(Debug, Default, Clone)]
pub struct WriteSet {
    pub changes: FxHashMap<String, BTreeMap<Vec<Value>, Option<StoredRow>>>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.changes.values().all(|c| c.is_empty())
    }

    pub fn put(&mut self, table: &str, key: Vec<Value>, row: Option<StoredRow>) {
        self.changes
            .entry(table.to_string())
            .or_default()
            .insert(key, row);
    }

    /// `Some(change)` when the transaction touched the key
    pub fn get(&self, table: &str, key: &[Value]) -> Option<&Option<StoredRow>> {
        self.changes.get(table).and_then(|c| c.get(key))
    }
}

/// Read view merging committed rows with a write set
pub struct View<'a> {
    pub committed: &'a FxHashMap<String, TableData>,
    pub writes: &'a WriteSet,
}

impl<'a> View<'a> {
    pub fn get(&self, table: &str, key: &[Value]) -> Option<StoredRow> {
        if let Some(change) = self.writes.get(table, key) {
            return change.clone();
        }
        self.committed
            .get(table)
            .and_then(|t| t.rows.get(key))
            .cloned()
    }

    /// All visible rows of a table in primary key order
    pub fn rows(&self, table: &str) -> Vec<(Vec<Value>, StoredRow)> {
        let mut merged: BTreeMap<Vec<Value>, StoredRow> = self
            .committed
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default();
        if let Some(changes) = self.writes.changes.get(table) {
            for (k, change) in changes {
                match change {
                    Some(row) => {
                        merged.insert(k.clone(), row.clone());
                    }
                    None => {
                        merged.remove(k);
                    }
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Find a row by unique index values; NULL never matches
    pub fn find_unique(&self, table: &NdbTable, index: &NdbIndex, key: &[Value]) -> Option<StoredRow> {
        if key.iter().any(Value::is_null) {
            return None;
        }
        self.rows(&table.name)
            .into_iter()
            .map(|(_, row)| row)
            .find(|row| row.key(&index.columns) == key)
    }

    /// Primary key of another row holding the same unique values
    pub fn unique_conflict(
        &self,
        table: &NdbTable,
        index: &NdbIndex,
        row: &StoredRow,
        own_pk: &[Value],
    ) -> bool {
        let key = row.key(&index.columns);
        if key.iter().any(Value::is_null) {
            return false;
        }
        self.rows(&table.name)
            .iter()
            .any(|(pk, other)| pk.as_slice() != own_pk && other.key(&index.columns) == key)
    }
}

/// Fragment a natively distributed row lands in
pub fn hash_fragment(key: &[Value], partitions: u32) -> u32 {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_set_overrides_committed() {
        let mut committed: FxHashMap<String, TableData> = FxHashMap::default();
        let mut data = TableData::default();
        let mut row = StoredRow::new(2);
        row.set_attr(0, Value::integer(1));
        row.set_attr(1, Value::text("old"));
        data.rows.insert(vec![Value::integer(1)], row.clone());
        committed.insert("t".to_string(), data);

        let mut writes = WriteSet::default();
        let view = View {
            committed: &committed,
            writes: &writes,
        };
        assert_eq!(view.get("t", &[Value::integer(1)]), Some(row.clone()));

        writes.put("t", vec![Value::integer(1)], None);
        let mut added = StoredRow::new(2);
        added.set_attr(0, Value::integer(2));
        writes.put("t", vec![Value::integer(2)], Some(added));
        let view = View {
            committed: &committed,
            writes: &writes,
        };
        assert_eq!(view.get("t", &[Value::integer(1)]), None);
        let keys: Vec<_> = view.rows("t").into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![vec![Value::integer(2)]]);
    }

    #[test]
    fn test_pseudo_columns() {
        let mut row = StoredRow::new(1);
        row.gci = 42;
        row.fragment = 3;
        assert_eq!(
            row.column(ExtraColumn::Pseudo(PseudoColumn::RowGci64)),
            Value::unsigned(42)
        );
        assert_eq!(
            row.column(ExtraColumn::Pseudo(PseudoColumn::Fragment)),
            Value::unsigned(3)
        );
        assert_eq!(
            row.column(ExtraColumn::Pseudo(PseudoColumn::PartitionFunction)),
            Value::Null
        );
    }

    #[test]
    fn test_hash_fragment_in_range() {
        for i in 0..20 {
            assert!(hash_fragment(&[Value::integer(i)], 4) < 4);
        }
        assert_eq!(hash_fragment(&[Value::integer(5)], 0), 0);
    }
}
