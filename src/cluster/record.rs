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

//! Record descriptors
//!
//! An [`NdbRecord`] describes how cluster attributes are laid out in a
//! handler-side buffer: each entry pairs an attribute with the position in
//! the buffer that holds its value. Row records read from full row images,
//! key records read from key tuples (one value per key part).

use super::types::{AttrId, AttrValues, KeyAccess};
use crate::core::{FieldBitmap, Result, Row, Value};

/// What a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Full table row image
    Table,
    /// Primary key columns, sourced from a row image
    PrimaryKey,
    /// Hidden key, sourced from a one-value buffer
    HiddenKey,
    /// Unique index columns sourced from a row image
    UniqueRow(u32),
    /// Unique index columns sourced from a key tuple
    UniqueKey(u32),
    /// Ordered index columns sourced from a key tuple
    OrderedKey(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordColumn {
    pub attr: AttrId,
    /// Position of the value in the source buffer
    pub source: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdbRecord {
    kind: RecordKind,
    columns: Vec<RecordColumn>,
}

impl NdbRecord {
    pub fn new(kind: RecordKind, columns: Vec<RecordColumn>) -> Self {
        Self { kind, columns }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn columns(&self) -> &[RecordColumn] {
        &self.columns
    }

    pub fn attrs(&self) -> impl Iterator<Item = AttrId> + '_ {
        self.columns.iter().map(|c| c.attr)
    }

    /// Key access used when the record addresses a row
    pub fn access(&self) -> KeyAccess {
        match self.kind {
            RecordKind::UniqueRow(id) | RecordKind::UniqueKey(id) => KeyAccess::UniqueIndex(id),
            _ => KeyAccess::PrimaryKey,
        }
    }

    /// Values in record column order taken from `buf`
    pub fn key_values(&self, buf: &[Value]) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| buf.get(c.source).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Attribute values taken from `buf`, restricted to `mask` when given
    pub fn row_values(&self, buf: &[Value], mask: Option<&FieldBitmap>) -> AttrValues {
        self.columns
            .iter()
            .filter(|c| mask.map_or(true, |m| m.is_set(c.attr as usize)))
            .map(|c| (c.attr, buf.get(c.source).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    /// Place attribute values back into a buffer at their source positions
    ///
    /// Fails when `row` is narrower than the record.
    pub fn unpack(&self, values: &AttrValues, row: &mut Row) -> Result<()> {
        for (attr, value) in values {
            if let Some(c) = self.columns.iter().find(|c| c.attr == *attr) {
                row.set(c.source, value.clone())?;
            }
        }
        Ok(())
    }

    /// True when any sourced value is NULL
    pub fn has_null(&self, buf: &[Value]) -> bool {
        self.columns
            .iter()
            .any(|c| buf.get(c.source).map_or(true, Value::is_null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(kind: RecordKind, pairs: &[(AttrId, usize)]) -> NdbRecord {
        NdbRecord::new(
            kind,
            pairs
                .iter()
                .map(|&(attr, source)| RecordColumn { attr, source })
                .collect(),
        )
    }

    #[test]
    fn test_key_values_follow_record_order() {
        let row = vec![Value::integer(1), Value::text("x"), Value::integer(3)];
        let r = rec(RecordKind::UniqueRow(9), &[(2, 2), (1, 1)]);
        assert_eq!(r.key_values(&row), vec![Value::integer(3), Value::text("x")]);
        assert_eq!(r.access(), KeyAccess::UniqueIndex(9));
    }

    #[test]
    fn test_row_values_with_mask() {
        let row = vec![Value::integer(1), Value::text("x"), Value::integer(3)];
        let r = rec(RecordKind::Table, &[(0, 0), (1, 1), (2, 2)]);
        let mask = FieldBitmap::from_bits(3, &[0, 2]);
        assert_eq!(
            r.row_values(&row, Some(&mask)),
            vec![(0, Value::integer(1)), (2, Value::integer(3))]
        );
        assert_eq!(r.row_values(&row, None).len(), 3);
    }

    #[test]
    fn test_unpack() {
        let r = rec(RecordKind::Table, &[(0, 1), (1, 0)]);
        let mut row = Row::new(2);
        r.unpack(&vec![(0, Value::integer(5)), (1, Value::integer(6))], &mut row)
            .unwrap();
        assert_eq!(row.as_slice(), &[Value::integer(6), Value::integer(5)]);
        assert!(r.has_null(&[Value::Null, Value::integer(1)]));
    }

    #[test]
    fn test_unpack_into_short_row_fails() {
        let r = rec(RecordKind::Table, &[(0, 0), (1, 1), (2, 2)]);
        let mut row = Row::new(2);
        let values = vec![(0, Value::integer(1)), (2, Value::integer(3))];
        assert!(r.unpack(&values, &mut row).is_err());
    }
}
