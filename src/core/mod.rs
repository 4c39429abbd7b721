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

//! Core types and definitions for the handler
//!
//! - [`Value`] - Field values
//! - [`Row`] - A server row image
//! - [`FieldBitmap`] - Read/write sets and column masks
//! - [`TableDef`] - Server table definition
//! - [`Error`] - Error types for all handler operations

pub mod bitmap;
pub mod error;
pub mod row;
pub mod schema;
pub mod types;
pub mod value;

pub use bitmap::FieldBitmap;
pub use error::{Error, Result};
pub use row::Row;
pub use schema::{
    FieldDef, FieldType, KeyAlgorithm, KeyDef, KeyKind, PartitionInfo, PartitionScheme,
    StorageType, TableDef, TableDefBuilder, INT_MAX32,
};
pub use types::{
    ExtraOption, IndexFlags, InfoFlags, KeyRange, PushedAccess, ReadFlag, SqlCommand,
    ThrLockType,
};
pub use value::Value;

#[cfg(test)]
mod integration_tests {
    use super::*;

    /// Build a table definition, fill a row and project its key
    #[test]
    fn test_table_row_integration() {
        let table = TableDefBuilder::new("test", "orders")
            .add("id", FieldType::Integer)
            .add("customer", FieldType::Varchar)
            .add_nullable("note", FieldType::Text)
            .primary_key(&["id"])
            .index("ix_customer", &["customer"])
            .build()
            .unwrap();

        let mut row = Row::for_table(&table);
        row.set(0, Value::integer(7)).unwrap();
        row.set(1, Value::text("acme")).unwrap();

        assert_eq!(row.project(table.primary_key_fields()), vec![Value::integer(7)]);
        let mut written = FieldBitmap::new(table.fields.len());
        written.set(1);
        let pk = FieldBitmap::from_bits(table.fields.len(), table.primary_key_fields());
        assert!(!written.overlaps(&pk));
    }
}
