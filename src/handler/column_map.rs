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

//! Server field to cluster attribute mapping
//!
//! Virtual generated columns exist only in the server, so field ordinals and
//! attribute ids diverge as soon as a table has one. Every bitmap and row
//! image crossing the handler boundary goes through a [`ColumnMap`].

use crate::cluster::{AttrId, NdbTable};
use crate::core::{Error, FieldBitmap, Result, Row, TableDef, Value};

#[derive(Debug, Clone)]
pub struct ColumnMap {
    field_to_attr: Vec<Option<AttrId>>,
    attr_to_field: Vec<Option<usize>>,
    /// Field i maps to attribute i for every field
    identity: bool,
}

impl ColumnMap {
    /// Map the stored fields of `table_def` onto the columns of `table`
    pub fn new(table_def: &TableDef, table: &NdbTable) -> Result<Self> {
        let mut field_to_attr = Vec::with_capacity(table_def.fields.len());
        let mut attr_to_field = vec![None; table.attr_count()];
        for (i, field) in table_def.fields.iter().enumerate() {
            if !field.stored {
                field_to_attr.push(None);
                continue;
            }
            let column = table.column_by_name(&field.name).ok_or_else(|| {
                Error::table_def_changed(format!(
                    "column '{}' missing from {}",
                    field.name, table.name
                ))
            })?;
            let slot = attr_to_field
                .get_mut(column.attr_id as usize)
                .ok_or_else(|| Error::internal("attribute id out of range"))?;
            *slot = Some(i);
            field_to_attr.push(Some(column.attr_id));
        }
        let identity = field_to_attr
            .iter()
            .enumerate()
            .all(|(i, a)| *a == Some(i as AttrId));
        Ok(Self {
            field_to_attr,
            attr_to_field,
            identity,
        })
    }

    pub fn attr(&self, field: usize) -> Option<AttrId> {
        self.field_to_attr.get(field).copied().flatten()
    }

    pub fn field(&self, attr: AttrId) -> Option<usize> {
        self.attr_to_field.get(attr as usize).copied().flatten()
    }

    pub fn attr_count(&self) -> usize {
        self.attr_to_field.len()
    }

    pub fn field_count(&self) -> usize {
        self.field_to_attr.len()
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Attribute mask of a field bitmap; virtual fields drop out
    pub fn attr_mask(&self, fields: &FieldBitmap) -> FieldBitmap {
        let mut mask = FieldBitmap::new(self.attr_count());
        for field in fields.iter_set() {
            if let Some(attr) = self.attr(field) {
                mask.set(attr as usize);
            }
        }
        mask
    }

    /// Row image indexed by attribute id
    ///
    /// `hidden` places the hidden primary key value in its attribute.
    pub fn attr_image(&self, row: &Row, hidden: Option<(AttrId, &Value)>) -> Vec<Value> {
        let mut image = vec![Value::Null; self.attr_count()];
        for (attr, slot) in image.iter_mut().enumerate() {
            if let Some(field) = self.field(attr as AttrId) {
                *slot = row.value(field).clone();
            }
        }
        if let Some((attr, value)) = hidden {
            if let Some(slot) = image.get_mut(attr as usize) {
                *slot = value.clone();
            }
        }
        image
    }
}
