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

//! Field values as exchanged between the server row image and the cluster
//!
//! Character, binary and blob columns all carry their payload as raw bytes;
//! the column definition decides how those bytes are interpreted.

use std::fmt;

/// A single field value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Value {
    /// SQL NULL
    #[default]
    Null,
    /// Signed integer
    Integer(i64),
    /// Unsigned integer (auto-increment and hidden key values)
    Unsigned(u64),
    /// Character, binary or blob payload
    Bytes(Vec<u8>),
}

impl Value {
    pub fn null() -> Self {
        Value::Null
    }

    pub fn integer(v: i64) -> Self {
        Value::Integer(v)
    }

    pub fn unsigned(v: u64) -> Self {
        Value::Unsigned(v)
    }

    pub fn text(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }

    pub fn bytes(v: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(v.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, if it has one
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Unsigned(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Unsigned view of the value; negative integers have none
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(v) => u64::try_from(*v).ok(),
            Value::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Number of payload bytes the value occupies on the wire
    pub fn wire_len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Unsigned(_) => 8,
            Value::Bytes(b) => b.len(),
        }
    }

    /// Compare two values of the same column, treating NULL as lowest
    ///
    /// Integer and unsigned values compare numerically across variants.
    pub fn compare(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Value::Integer(a), Value::Unsigned(b)) => {
                if *a < 0 {
                    Ordering::Less
                } else {
                    (*a as u64).cmp(b)
                }
            }
            (Value::Unsigned(a), Value::Integer(b)) => {
                if *b < 0 {
                    Ordering::Greater
                } else {
                    a.cmp(&(*b as u64))
                }
            }
            _ => self.cmp(other),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_value_accessors() {
        assert!(Value::null().is_null());
        assert_eq!(Value::integer(-3).as_i64(), Some(-3));
        assert_eq!(Value::integer(-3).as_u64(), None);
        assert_eq!(Value::unsigned(7).as_i64(), Some(7));
        assert_eq!(Value::text("abc").as_bytes(), Some(&b"abc"[..]));
        assert_eq!(Value::text("abc").wire_len(), 3);
        assert_eq!(Value::Null.wire_len(), 0);
    }

    #[test]
    fn test_value_compare_mixed() {
        assert_eq!(Value::integer(5).compare(&Value::unsigned(5)), Ordering::Equal);
        assert_eq!(Value::integer(-1).compare(&Value::unsigned(0)), Ordering::Less);
        assert_eq!(Value::unsigned(9).compare(&Value::integer(3)), Ordering::Greater);
        assert_eq!(Value::Null.compare(&Value::integer(0)), Ordering::Less);
        assert_eq!(Value::text("a").compare(&Value::text("b")), Ordering::Less);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::integer(42).to_string(), "42");
        assert_eq!(Value::text("hi").to_string(), "hi");
    }
}
