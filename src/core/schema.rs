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

//! Server-side table definitions
//!
//! [`TableDef`] is the handler's view of the server data dictionary entry for
//! an open table: fields, keys and partitioning. It is built once and shared.

use std::fmt;

use super::error::{Error, Result};
use super::row::Row;
use super::value::Value;

/// Upper bound for values passed as the partition function result
pub const INT_MAX32: i64 = i32::MAX as i64;

/// Field data types as far as the handler needs to distinguish them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Integer,
    Unsigned,
    Char,
    Varchar,
    Binary,
    /// Character large object
    Text,
    /// Binary large object
    Blob,
}

impl FieldType {
    pub fn is_blob(&self) -> bool {
        matches!(self, FieldType::Text | FieldType::Blob)
    }

    pub fn is_character(&self) -> bool {
        matches!(self, FieldType::Char | FieldType::Varchar | FieldType::Text)
    }

    /// Fixed wire width for numeric types
    fn fixed_width(&self) -> Option<usize> {
        match self {
            FieldType::Integer | FieldType::Unsigned => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Integer => "INTEGER",
            FieldType::Unsigned => "INTEGER UNSIGNED",
            FieldType::Char => "CHAR",
            FieldType::Varchar => "VARCHAR",
            FieldType::Binary => "BINARY",
            FieldType::Text => "TEXT",
            FieldType::Blob => "BLOB",
        };
        write!(f, "{}", name)
    }
}

/// Where a column's data lives on the data nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Memory,
    Disk,
}

/// A field (column) definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub nullable: bool,
    /// Maximum data length in bytes
    pub max_length: usize,
    /// False for virtual generated columns, which have no cluster attribute
    pub stored: bool,
    pub storage: StorageType,
    /// Column has a native default value in the cluster
    pub has_default: bool,
    pub auto_increment: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let max_length = match field_type {
            FieldType::Integer | FieldType::Unsigned => 8,
            FieldType::Char | FieldType::Binary => 255,
            FieldType::Varchar => 255,
            FieldType::Text | FieldType::Blob => 65535,
        };
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            max_length,
            stored: true,
            storage: StorageType::Memory,
            has_default: false,
            auto_increment: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_max_length(mut self, len: usize) -> Self {
        self.max_length = len;
        self
    }

    pub fn on_disk(mut self) -> Self {
        self.storage = StorageType::Disk;
        self
    }

    pub fn virtual_column(mut self) -> Self {
        self.stored = false;
        self
    }

    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    pub fn is_blob(&self) -> bool {
        self.field_type.is_blob()
    }

    /// Bytes the field contributes to the in-row image
    pub fn pack_length(&self) -> usize {
        if self.is_blob() {
            // Blob head stored in row, parts stored separately
            return 8;
        }
        self.field_type.fixed_width().unwrap_or(self.max_length + 2)
    }
}

/// Key classification from the server dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Primary,
    Unique,
    Multiple,
}

/// Requested key algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyAlgorithm {
    #[default]
    BTree,
    Hash,
}

/// A key (index) definition; `parts` are field ordinals in key order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDef {
    pub name: String,
    pub kind: KeyKind,
    pub algorithm: KeyAlgorithm,
    pub parts: Vec<usize>,
}

impl KeyDef {
    pub fn is_unique(&self) -> bool {
        matches!(self.kind, KeyKind::Primary | KeyKind::Unique)
    }
}

/// How rows are distributed over partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionScheme {
    /// Native distribution by the cluster over the primary key
    Key,
    /// User-defined `HASH(field)`; the handler supplies the function value
    Hash { field: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub scheme: PartitionScheme,
    pub num_partitions: u32,
}

impl PartitionInfo {
    /// User-defined partitioning makes the handler route rows itself
    pub fn is_user_defined(&self) -> bool {
        matches!(self.scheme, PartitionScheme::Hash { .. })
    }

    /// Fields read to compute the partition of a row
    pub fn fields(&self) -> Vec<usize> {
        match self.scheme {
            PartitionScheme::Key => Vec::new(),
            PartitionScheme::Hash { field } => vec![field],
        }
    }

    /// Compute `(partition id, function value)` for a row
    ///
    /// Only meaningful for user-defined schemes.
    pub fn partition_id(&self, row: &Row) -> Result<(u32, i64)> {
        match self.scheme {
            PartitionScheme::Key => Err(Error::internal(
                "partition id requested for natively distributed table",
            )),
            PartitionScheme::Hash { field } => {
                let func_value = match row.value(field) {
                    Value::Null => 0,
                    v => v.as_i64().ok_or_else(|| {
                        Error::invalid_argument("partition function value is not an integer")
                    })?,
                };
                let parts = i64::from(self.num_partitions.max(1));
                Ok((func_value.rem_euclid(parts) as u32, func_value))
            }
        }
    }
}

/// A server table definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub db: String,
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub keys: Vec<KeyDef>,
    /// Key ordinal of the primary key; `None` means a hidden primary key
    pub primary_key: Option<usize>,
    pub partition: Option<PartitionInfo>,
    /// Schema version the server expects the cluster table to have
    pub version: u32,
}

impl TableDef {
    pub fn has_hidden_primary_key(&self) -> bool {
        self.primary_key.is_none()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn auto_increment_field(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.auto_increment)
    }

    pub fn blob_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_blob() && f.stored)
            .map(|(i, _)| i)
    }

    pub fn has_blobs(&self) -> bool {
        self.blob_fields().next().is_some()
    }

    pub fn has_disk_columns(&self) -> bool {
        self.fields.iter().any(|f| f.storage == StorageType::Disk)
    }

    pub fn has_unique_keys(&self) -> bool {
        self.keys
            .iter()
            .enumerate()
            .any(|(i, k)| k.kind == KeyKind::Unique && Some(i) != self.primary_key)
    }

    /// True when user-defined partitioning is in use
    pub fn is_user_partitioned(&self) -> bool {
        self.partition.as_ref().is_some_and(|p| p.is_user_defined())
    }

    /// Sum of in-row field widths
    pub fn row_size(&self) -> usize {
        self.fields.iter().map(|f| f.pack_length()).sum()
    }

    pub fn primary_key_fields(&self) -> &[usize] {
        match self.primary_key {
            Some(pk) => &self.keys[pk].parts,
            None => &[],
        }
    }
}

impl fmt::Display for TableDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} (", self.db, self.name)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", field.name, field.field_type)?;
            if !field.nullable {
                write!(f, " NOT NULL")?;
            }
        }
        write!(f, ")")
    }
}

/// Builder for creating table definitions
pub struct TableDefBuilder {
    db: String,
    name: String,
    fields: Vec<FieldDef>,
    keys: Vec<(String, KeyKind, KeyAlgorithm, Vec<String>)>,
    auto_increment: Option<String>,
    partition: Option<(Option<String>, u32)>,
    version: u32,
}

impl TableDefBuilder {
    pub fn new(db: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            name: name.into(),
            fields: Vec::new(),
            keys: Vec::new(),
            auto_increment: None,
            partition: None,
            version: 1,
        }
    }

    /// Add a field definition
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a simple non-nullable column
    pub fn add(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field(FieldDef::new(name, field_type))
    }

    /// Add a nullable column
    pub fn add_nullable(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.field(FieldDef::new(name, field_type).nullable())
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.keys.push((
            "PRIMARY".to_string(),
            KeyKind::Primary,
            KeyAlgorithm::BTree,
            columns.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    /// Primary key declared `USING HASH` (no ordered index)
    pub fn primary_key_hash(mut self, columns: &[&str]) -> Self {
        self.keys.push((
            "PRIMARY".to_string(),
            KeyKind::Primary,
            KeyAlgorithm::Hash,
            columns.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    pub fn unique_key(mut self, name: &str, columns: &[&str]) -> Self {
        self.keys.push((
            name.to_string(),
            KeyKind::Unique,
            KeyAlgorithm::BTree,
            columns.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    pub fn unique_hash_key(mut self, name: &str, columns: &[&str]) -> Self {
        self.keys.push((
            name.to_string(),
            KeyKind::Unique,
            KeyAlgorithm::Hash,
            columns.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    pub fn index(mut self, name: &str, columns: &[&str]) -> Self {
        self.keys.push((
            name.to_string(),
            KeyKind::Multiple,
            KeyAlgorithm::BTree,
            columns.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    pub fn auto_increment(mut self, column: &str) -> Self {
        self.auto_increment = Some(column.to_string());
        self
    }

    /// Partition natively by key into `parts` partitions
    pub fn partition_by_key(mut self, parts: u32) -> Self {
        self.partition = Some((None, parts));
        self
    }

    /// Partition by `HASH(column)` into `parts` partitions
    pub fn partition_by_hash(mut self, column: &str, parts: u32) -> Self {
        self.partition = Some((Some(column.to_string()), parts));
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Build the definition, resolving column names
    pub fn build(self) -> Result<TableDef> {
        let mut fields = self.fields;
        let find = |fields: &[FieldDef], name: &str| {
            fields
                .iter()
                .position(|f| f.name == name)
                .ok_or_else(|| Error::invalid_argument(format!("unknown column '{}'", name)))
        };

        if let Some(col) = &self.auto_increment {
            let idx = find(&fields, col)?;
            fields[idx].auto_increment = true;
        }

        let mut keys = Vec::with_capacity(self.keys.len());
        let mut primary_key = None;
        for (name, kind, algorithm, columns) in self.keys {
            let parts = columns
                .iter()
                .map(|c| find(&fields, c))
                .collect::<Result<Vec<_>>>()?;
            if kind == KeyKind::Primary {
                if primary_key.is_some() {
                    return Err(Error::invalid_argument("multiple primary keys defined"));
                }
                primary_key = Some(keys.len());
            }
            keys.push(KeyDef {
                name,
                kind,
                algorithm,
                parts,
            });
        }

        let partition = match self.partition {
            None => None,
            Some((None, parts)) => Some(PartitionInfo {
                scheme: PartitionScheme::Key,
                num_partitions: parts,
            }),
            Some((Some(col), parts)) => Some(PartitionInfo {
                scheme: PartitionScheme::Hash {
                    field: find(&fields, &col)?,
                },
                num_partitions: parts,
            }),
        };

        Ok(TableDef {
            db: self.db,
            name: self.name,
            fields,
            keys,
            primary_key,
            partition,
            version: self.version,
        })
    }
}
