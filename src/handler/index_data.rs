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

//! Per index metadata of an open table
//!
//! A server key can be backed by a cluster ordered index, a unique hash
//! index, both, or (for the primary key) the table's own distribution key.
//! [`IndexData`] resolves the handles at open, demotes the key when a
//! backing index is missing, and builds the records that lay out key
//! tuples and row images in cluster index order.

use std::sync::Arc;

use smallvec::SmallVec;

use super::column_map::ColumnMap;
use crate::cluster::{
    AttrId, KeyAccess, NdbDictionary, NdbIndex, NdbRecord, NdbTable, RecordColumn, RecordKind,
};
use crate::core::{
    Error, IndexFlags, KeyAlgorithm, KeyKind, Result, TableDef, Value,
};

/// How a server key is served by the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    /// No usable cluster index; the key cannot be read
    Undefined,
    /// Primary key, hash access only
    Primary,
    /// Primary key with an ordered index for ranges
    PrimaryOrdered,
    /// Unique hash index
    Unique,
    /// Unique hash index plus an ordered index
    UniqueOrdered,
    Ordered,
}

impl IndexType {
    pub fn is_primary(&self) -> bool {
        matches!(self, IndexType::Primary | IndexType::PrimaryOrdered)
    }

    pub fn is_unique(&self) -> bool {
        matches!(self, IndexType::Unique | IndexType::UniqueOrdered)
    }

    pub fn is_ordered(&self) -> bool {
        matches!(
            self,
            IndexType::PrimaryOrdered | IndexType::UniqueOrdered | IndexType::Ordered
        )
    }

    fn of_key(table_def: &TableDef, key_no: usize) -> IndexType {
        let key = &table_def.keys[key_no];
        let hash = key.algorithm == KeyAlgorithm::Hash;
        if table_def.primary_key == Some(key_no) {
            if hash {
                IndexType::Primary
            } else {
                IndexType::PrimaryOrdered
            }
        } else if key.kind == KeyKind::Multiple {
            IndexType::Ordered
        } else if hash {
            IndexType::Unique
        } else {
            IndexType::UniqueOrdered
        }
    }
}

#[derive(Debug)]
pub struct IndexData {
    name: String,
    index_type: IndexType,
    unique_index: Option<Arc<NdbIndex>>,
    ordered_index: Option<Arc<NdbIndex>>,
    /// Key tuple in server key order to unique key wire layout
    unique_key_record: Option<NdbRecord>,
    /// Row image to unique key wire layout
    unique_row_record: Option<NdbRecord>,
    /// Key tuple to ordered index bound layout
    ordered_key_record: Option<NdbRecord>,
    /// Position in the unique index of each key part, when it is not the
    /// key part's own position
    attrid_map: Option<SmallVec<[usize; 8]>>,
    /// A key part of the unique index allows NULL
    null_in_unique_index: bool,
    key_fields: SmallVec<[usize; 8]>,
}

fn key_record(kind: RecordKind, index_attrs: &[AttrId], key_attrs: &[AttrId]) -> Result<NdbRecord> {
    let columns = index_attrs
        .iter()
        .map(|attr| {
            key_attrs
                .iter()
                .position(|a| a == attr)
                .map(|source| RecordColumn { attr: *attr, source })
                .ok_or_else(|| Error::internal(format!("index attribute {} not in key", attr)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(NdbRecord::new(kind, columns))
}

fn row_record(
    kind: RecordKind,
    index_attrs: &[AttrId],
    key_attrs: &[AttrId],
    key_fields: &[usize],
) -> Result<NdbRecord> {
    let columns = index_attrs
        .iter()
        .map(|attr| {
            key_attrs
                .iter()
                .position(|a| a == attr)
                .and_then(|part| key_fields.get(part))
                .map(|field| RecordColumn {
                    attr: *attr,
                    source: *field,
                })
                .ok_or_else(|| Error::internal(format!("index attribute {} not in key", attr)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(NdbRecord::new(kind, columns))
}

impl IndexData {
    /// Resolve the cluster indexes behind key `key_no`
    pub fn open(
        dict: &dyn NdbDictionary,
        table: &NdbTable,
        table_def: &TableDef,
        key_no: usize,
        column_map: &ColumnMap,
    ) -> Result<Self> {
        let key = table_def
            .keys
            .get(key_no)
            .ok_or_else(|| Error::invalid_argument(format!("no key {}", key_no)))?;
        let index_type = IndexType::of_key(table_def, key_no);

        let ordered_index = if index_type.is_ordered() {
            dict.get_index(table, &key.name)
        } else {
            None
        };
        let unique_index = if index_type.is_unique() {
            dict.get_index(table, &NdbIndex::unique_index_name(&key.name))
        } else {
            None
        };

        let key_attrs = key
            .parts
            .iter()
            .map(|field| {
                column_map.attr(*field).ok_or_else(|| {
                    Error::table_def_changed(format!(
                        "key '{}' uses a column without cluster attribute",
                        key.name
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let nullable = key
            .parts
            .iter()
            .any(|f| table_def.fields.get(*f).map_or(false, |d| d.nullable));

        Self::from_handles(
            &key.name,
            index_type,
            table,
            &key_attrs,
            &key.parts,
            nullable,
            unique_index,
            ordered_index,
        )
    }

    /// Build from already resolved index handles
    ///
    /// `key_attrs` and `key_fields` follow server key part order.
    #[allow(clippy::too_many_arguments)]
    pub fn from_handles(
        name: &str,
        index_type: IndexType,
        table: &NdbTable,
        key_attrs: &[AttrId],
        key_fields: &[usize],
        nullable: bool,
        unique_index: Option<Arc<NdbIndex>>,
        ordered_index: Option<Arc<NdbIndex>>,
    ) -> Result<Self> {
        let index_type = demote(name, index_type, unique_index.is_some(), ordered_index.is_some());

        let mut data = IndexData {
            name: name.to_string(),
            index_type,
            unique_index: None,
            ordered_index: None,
            unique_key_record: None,
            unique_row_record: None,
            ordered_key_record: None,
            attrid_map: None,
            null_in_unique_index: false,
            key_fields: key_fields.iter().copied().collect(),
        };

        match index_type {
            IndexType::Undefined => return Ok(data),
            IndexType::Primary | IndexType::PrimaryOrdered => {
                data.unique_key_record = Some(key_record(
                    RecordKind::PrimaryKey,
                    &table.primary_key,
                    key_attrs,
                )?);
                data.unique_row_record = Some(row_record(
                    RecordKind::PrimaryKey,
                    &table.primary_key,
                    key_attrs,
                    key_fields,
                )?);
                data.attrid_map = permutation(key_attrs, &table.primary_key);
            }
            IndexType::Unique | IndexType::UniqueOrdered => {
                if let Some(unique) = &unique_index {
                    data.unique_key_record = Some(key_record(
                        RecordKind::UniqueKey(unique.object_id),
                        &unique.columns,
                        key_attrs,
                    )?);
                    data.unique_row_record = Some(row_record(
                        RecordKind::UniqueRow(unique.object_id),
                        &unique.columns,
                        key_attrs,
                        key_fields,
                    )?);
                    data.attrid_map = permutation(key_attrs, &unique.columns);
                    data.null_in_unique_index = nullable;
                }
            }
            IndexType::Ordered => {}
        }

        if index_type.is_ordered() {
            if let Some(ordered) = &ordered_index {
                data.ordered_key_record = Some(key_record(
                    RecordKind::OrderedKey(ordered.object_id),
                    &ordered.columns,
                    key_attrs,
                )?);
            }
        }

        data.unique_index = if index_type.is_unique() {
            unique_index
        } else {
            None
        };
        data.ordered_index = if index_type.is_ordered() {
            ordered_index
        } else {
            None
        };
        Ok(data)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn unique_index(&self) -> Option<&Arc<NdbIndex>> {
        self.unique_index.as_ref()
    }

    pub fn ordered_index(&self) -> Option<&Arc<NdbIndex>> {
        self.ordered_index.as_ref()
    }

    pub fn unique_key_record(&self) -> Option<&NdbRecord> {
        self.unique_key_record.as_ref()
    }

    pub fn unique_row_record(&self) -> Option<&NdbRecord> {
        self.unique_row_record.as_ref()
    }

    pub fn ordered_key_record(&self) -> Option<&NdbRecord> {
        self.ordered_key_record.as_ref()
    }

    pub fn null_in_unique_index(&self) -> bool {
        self.null_in_unique_index
    }

    /// Server fields of the key, in key part order
    pub fn key_fields(&self) -> &[usize] {
        &self.key_fields
    }

    /// Access path of a key lookup through this index
    pub fn access(&self) -> Option<KeyAccess> {
        self.unique_key_record.as_ref().map(NdbRecord::access)
    }

    /// Index position of every key part
    ///
    /// The identity mapping when key and index agree on column order.
    pub fn fill_column_map(&self) -> SmallVec<[usize; 8]> {
        match &self.attrid_map {
            Some(map) => map.clone(),
            None => (0..self.key_fields.len()).collect(),
        }
    }

    /// Reorder a key tuple into unique index order
    pub fn permute_key(&self, key: &[Value]) -> Vec<Value> {
        let map = self.fill_column_map();
        let mut out = vec![Value::Null; map.len()];
        for (part, value) in key.iter().enumerate() {
            if let Some(slot) = map.get(part).and_then(|pos| out.get_mut(*pos)) {
                *slot = value.clone();
            }
        }
        out
    }

    /// Ordered index bound values for a key prefix
    pub fn bound_values(&self, key: &[Value]) -> Vec<Value> {
        match &self.ordered_key_record {
            Some(record) => {
                let mut values = record.key_values(key);
                values.truncate(key.len());
                values
            }
            None => key.to_vec(),
        }
    }

    pub fn index_flags(&self) -> IndexFlags {
        match self.index_type {
            IndexType::Undefined => IndexFlags::default(),
            IndexType::Primary | IndexType::Unique => IndexFlags {
                only_whole_index: true,
                ..Default::default()
            },
            IndexType::PrimaryOrdered | IndexType::UniqueOrdered | IndexType::Ordered => {
                IndexFlags {
                    read_next: true,
                    read_prev: true,
                    read_range: true,
                    read_order: true,
                    only_whole_index: false,
                }
            }
        }
    }

    /// Give the index handles back to the dictionary
    pub fn release(&mut self, dict: &dyn NdbDictionary, invalidate: bool) {
        if let Some(index) = self.unique_index.take() {
            dict.release_index(&index, invalidate);
        }
        if let Some(index) = self.ordered_index.take() {
            dict.release_index(&index, invalidate);
        }
    }
}

/// Apply the demotion rules for missing backing indexes
fn demote(name: &str, index_type: IndexType, has_unique: bool, has_ordered: bool) -> IndexType {
    let demoted = match index_type {
        IndexType::PrimaryOrdered if !has_ordered => IndexType::Primary,
        IndexType::UniqueOrdered => match (has_unique, has_ordered) {
            (true, true) => IndexType::UniqueOrdered,
            (true, false) => IndexType::Unique,
            (false, true) => IndexType::Ordered,
            (false, false) => IndexType::Undefined,
        },
        IndexType::Unique if !has_unique => IndexType::Undefined,
        IndexType::Ordered if !has_ordered => IndexType::Undefined,
        other => other,
    };
    if demoted != index_type {
        tracing::warn!(
            index = name,
            from = ?index_type,
            to = ?demoted,
            "index offline in cluster, access restricted"
        );
    }
    demoted
}

/// Index position of each key part, `None` when they coincide
fn permutation(key_attrs: &[AttrId], index_attrs: &[AttrId]) -> Option<SmallVec<[usize; 8]>> {
    let map: SmallVec<[usize; 8]> = key_attrs
        .iter()
        .map(|a| index_attrs.iter().position(|i| i == a).unwrap_or(usize::MAX))
        .collect();
    if map.iter().enumerate().all(|(i, p)| i == *p) {
        None
    } else {
        Some(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{MemoryCluster, TableOptions};
    use crate::cluster::NdbIndexKind;
    use crate::core::{FieldType, Row, TableDefBuilder};

    fn def() -> TableDef {
        TableDefBuilder::new("test", "t")
            .add("id", FieldType::Integer)
            .add("a", FieldType::Integer)
            .add_nullable("b", FieldType::Integer)
            .primary_key(&["id"])
            .unique_key("uk_ab", &["a", "b"])
            .unique_hash_key("uk_a", &["a"])
            .index("ix_b", &["b"])
            .build()
            .unwrap()
    }

    fn open_all(cluster: &MemoryCluster, def: &TableDef, options: TableOptions) -> Vec<IndexData> {
        let table = cluster.create_table_with(def, options).unwrap();
        let map = ColumnMap::new(def, &table).unwrap();
        (0..def.keys.len())
            .map(|k| IndexData::open(cluster, &table, def, k, &map).unwrap())
            .collect()
    }

    #[test]
    fn test_index_types() {
        let cluster = MemoryCluster::new();
        let def = def();
        let idx = open_all(&cluster, &def, TableOptions::default());
        assert_eq!(idx[0].index_type(), IndexType::PrimaryOrdered);
        assert_eq!(idx[1].index_type(), IndexType::UniqueOrdered);
        assert_eq!(idx[2].index_type(), IndexType::Unique);
        assert_eq!(idx[3].index_type(), IndexType::Ordered);
        assert!(idx[1].null_in_unique_index());
        assert!(!idx[2].null_in_unique_index());
        assert!(idx[0].index_flags().read_range);
        assert!(idx[2].index_flags().only_whole_index);
    }

    #[test]
    fn test_demotion_when_indexes_are_offline() {
        let cluster = MemoryCluster::new();
        let def = def();
        let options = TableOptions {
            skip_indexes: vec![
                "PRIMARY".to_string(),
                "uk_ab$unique".to_string(),
                "uk_a$unique".to_string(),
                "ix_b".to_string(),
            ],
            ..Default::default()
        };
        let idx = open_all(&cluster, &def, options);
        assert_eq!(idx[0].index_type(), IndexType::Primary);
        assert_eq!(idx[1].index_type(), IndexType::Ordered);
        assert_eq!(idx[2].index_type(), IndexType::Undefined);
        assert_eq!(idx[3].index_type(), IndexType::Undefined);
        assert_eq!(idx[2].index_flags(), IndexFlags::default());
        assert!(idx[2].access().is_none());
    }

    #[test]
    fn test_unique_lookup_is_permutation_invariant() {
        let cluster = MemoryCluster::new();
        let def = def();
        let table = cluster.create_table(&def).unwrap();
        // Cluster index declared (b, a) while the server key is (a, b)
        let unique = Arc::new(NdbIndex::new(
            "uk_ab$unique",
            900,
            NdbIndexKind::UniqueHash,
            table.name.clone(),
            vec![2, 1],
        ));
        let data = IndexData::from_handles(
            "uk_ab",
            IndexType::Unique,
            &table,
            &[1, 2],
            &[1, 2],
            true,
            Some(unique),
            None,
        )
        .unwrap();

        assert_eq!(data.fill_column_map().as_slice(), &[1, 0]);
        let key = vec![Value::integer(10), Value::integer(20)];
        let row = Row::from_values(vec![Value::integer(1), Value::integer(10), Value::integer(20)]);
        let from_key = data.unique_key_record().unwrap().key_values(&key);
        let from_row = data.unique_row_record().unwrap().key_values(&row);
        assert_eq!(from_key, from_row);
        assert_eq!(data.permute_key(&key), from_row);
        assert_eq!(from_row, vec![Value::integer(20), Value::integer(10)]);
    }

    #[test]
    fn test_identity_column_map() {
        let cluster = MemoryCluster::new();
        let def = def();
        let idx = open_all(&cluster, &def, TableOptions::default());
        assert_eq!(idx[1].fill_column_map().as_slice(), &[0, 1]);
        assert_eq!(
            idx[3].bound_values(&[Value::integer(4)]),
            vec![Value::integer(4)]
        );
    }

    #[test]
    fn test_release_returns_handles() {
        let cluster = MemoryCluster::new();
        let def = def();
        let mut idx = open_all(&cluster, &def, TableOptions::default());
        for data in idx.iter_mut() {
            data.release(&cluster, true);
        }
        let released = cluster.released_indexes();
        assert!(released.iter().any(|(n, inv)| n == "uk_ab$unique" && *inv));
        assert!(released.iter().any(|(n, _)| n == "ix_b"));
        assert!(idx[1].unique_index().is_none());
    }
}
