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

//! Cluster dictionary objects: tables, columns and indexes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::NdbError;
use super::types::AttrId;
use crate::core::StorageType;

/// Cached object state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectStatus {
    Retrieved,
    Invalid,
}

/// How a column stores its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Regular,
    /// Large object stored in parts
    Blob,
    /// Character large object stored in parts
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdbColumn {
    pub name: String,
    pub attr_id: AttrId,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub primary_key: bool,
    pub storage: StorageType,
    pub has_default: bool,
}

impl NdbColumn {
    pub fn is_blob(&self) -> bool {
        !matches!(self.kind, ColumnKind::Regular)
    }
}

/// A cluster table
#[derive(Debug)]
pub struct NdbTable {
    /// Internal name, `db/def/table`
    pub name: String,
    pub id: u32,
    pub version: u32,
    pub columns: Vec<NdbColumn>,
    /// Primary key attributes in key order (the hidden key on hidden-PK tables)
    pub primary_key: Vec<AttrId>,
    /// Attribute holding the hidden primary key, if any
    pub hidden_key: Option<AttrId>,
    pub partition_count: u32,
    /// Partitioning is computed by the handler, not by the cluster
    pub user_partitioned: bool,
    /// Table has the extra row author bits used by conflict detection
    pub row_author_bits: bool,
    invalid: AtomicBool,
}

impl NdbTable {
    pub fn new(name: impl Into<String>, id: u32, version: u32, columns: Vec<NdbColumn>) -> Self {
        let primary_key = columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.attr_id)
            .collect();
        Self {
            name: name.into(),
            id,
            version,
            columns,
            primary_key,
            hidden_key: None,
            partition_count: 1,
            user_partitioned: false,
            row_author_bits: false,
            invalid: AtomicBool::new(false),
        }
    }

    /// Build the internal name from database and table
    pub fn internal_name(db: &str, table: &str) -> String {
        format!("{}/def/{}", db, table)
    }

    pub fn column(&self, attr: AttrId) -> Option<&NdbColumn> {
        self.columns.iter().find(|c| c.attr_id == attr)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&NdbColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn attr_count(&self) -> usize {
        self.columns.len()
    }

    pub fn has_blobs(&self) -> bool {
        self.columns.iter().any(NdbColumn::is_blob)
    }

    pub fn has_disk_columns(&self) -> bool {
        self.columns.iter().any(|c| c.storage == StorageType::Disk)
    }

    pub fn has_default_values(&self) -> bool {
        self.columns.iter().any(|c| c.has_default)
    }

    pub fn status(&self) -> ObjectStatus {
        if self.invalid.load(Ordering::Acquire) {
            ObjectStatus::Invalid
        } else {
            ObjectStatus::Retrieved
        }
    }

    /// Mark the cached definition invalid after a schema error
    pub fn set_status_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }
}

/// Kind of a cluster index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NdbIndexKind {
    UniqueHash,
    Ordered,
}

#[derive(Debug)]
pub struct NdbIndex {
    pub name: String,
    pub object_id: u32,
    pub kind: NdbIndexKind,
    pub table: String,
    /// Indexed attributes in index order
    pub columns: Vec<AttrId>,
    invalid: AtomicBool,
}

impl NdbIndex {
    pub fn new(
        name: impl Into<String>,
        object_id: u32,
        kind: NdbIndexKind,
        table: impl Into<String>,
        columns: Vec<AttrId>,
    ) -> Self {
        Self {
            name: name.into(),
            object_id,
            kind,
            table: table.into(),
            columns,
            invalid: AtomicBool::new(false),
        }
    }

    /// Name of the unique hash index backing a unique key
    pub fn unique_index_name(key_name: &str) -> String {
        format!("{}$unique", key_name)
    }

    pub fn status(&self) -> ObjectStatus {
        if self.invalid.load(Ordering::Acquire) {
            ObjectStatus::Invalid
        } else {
            ObjectStatus::Retrieved
        }
    }

    pub fn set_status_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }
}

/// Dictionary lookups used when opening and closing tables
pub trait NdbDictionary: Send + Sync {
    /// Fetch a table by database and table name
    fn get_table(&self, db: &str, table: &str) -> Result<Arc<NdbTable>, NdbError>;

    /// Fetch an index of `table`; `None` when the index does not exist
    fn get_index(&self, table: &NdbTable, index_name: &str) -> Option<Arc<NdbIndex>>;

    /// Drop the local reference to an index, optionally invalidating the cache
    fn release_index(&self, index: &NdbIndex, invalidate: bool);

    /// Drop the cached table definition
    fn invalidate_table(&self, table: &NdbTable);

    /// Canonical name of a foreign key by object id
    fn foreign_key_name(&self, fk_id: u32) -> Option<String>;
}
