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

//! Row image - one value per server-visible field

use std::fmt;
use std::ops::{Deref, Index};

use super::error::{Error, Result};
use super::schema::TableDef;
use super::value::Value;

/// A server row image, indexed by field ordinal
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    /// Create a row of `len` NULL fields
    #[inline]
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![Value::Null; len],
        }
    }

    /// Create an all-NULL row shaped for `table`
    pub fn for_table(table: &TableDef) -> Self {
        Self::new(table.fields.len())
    }

    #[inline]
    pub fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value at `index`, NULL when out of range
    #[inline]
    pub fn value(&self, index: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(index).unwrap_or(&NULL)
    }

    pub fn set(&mut self, index: usize, value: Value) -> Result<()> {
        match self.values.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::invalid_argument(format!(
                "field {} out of range for row of {} fields",
                index,
                self.values.len()
            ))),
        }
    }

    #[inline]
    pub fn set_null(&mut self, index: usize) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = Value::Null;
        }
    }

    #[inline]
    pub fn is_null(&self, index: usize) -> bool {
        self.value(index).is_null()
    }

    /// Reset every field to NULL, keeping the shape
    pub fn clear(&mut self) {
        for v in self.values.iter_mut() {
            *v = Value::Null;
        }
    }

    /// Copy all fields from `other`, resizing if shapes differ
    pub fn copy_from(&mut self, other: &Row) {
        self.values.clone_from(&other.values);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Project the given field ordinals into a key tuple
    pub fn project(&self, fields: &[usize]) -> Vec<Value> {
        fields.iter().map(|&f| self.value(f).clone()).collect()
    }
}

impl Deref for Row {
    type Target = [Value];

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Self::Output {
        &self.values[index]
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}
