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

//! Handler ABI types shared between the server executor and the handler
//!
//! Thread lock kinds, key read flags, key ranges, `extra()` options and
//! `info()` flags.

use std::fmt;
use std::ops::BitOr;

use super::value::Value;

/// Table lock kind requested by the server for the statement
///
/// Variants are ordered by strength; comparisons follow declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ThrLockType {
    Unlock,
    #[default]
    Read,
    /// `SELECT ... LOCK IN SHARE MODE`
    ReadWithSharedLocks,
    ReadHighPriority,
    ReadNoInsert,
    /// Row-level write lock (`SELECT ... FOR UPDATE`, DML)
    WriteAllowWrite,
    WriteConcurrentInsert,
    WriteLowPriority,
    Write,
    WriteOnly,
}

impl ThrLockType {
    /// Table locks weaker than `ReadNoInsert` do not take row locks, except
    /// shared-lock reads
    pub fn is_not_mapped_to_row_lock(&self) -> bool {
        *self < ThrLockType::ReadNoInsert && *self != ThrLockType::ReadWithSharedLocks
    }
}

/// Statement kind as reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SqlCommand {
    #[default]
    Select,
    Insert,
    InsertSelect,
    Replace,
    Update,
    UpdateMulti,
    Delete,
    DeleteMulti,
    LoadData,
    AlterTable,
    ShowTableStatus,
}

impl SqlCommand {
    pub fn is_show(&self) -> bool {
        matches!(self, SqlCommand::ShowTableStatus)
    }
}

/// How a key value positions a read (`ha_rkey_function`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReadFlag {
    #[default]
    KeyExact,
    KeyOrNext,
    KeyOrPrev,
    AfterKey,
    BeforeKey,
    Prefix,
    PrefixLast,
    PrefixLastOrPrev,
}

impl ReadFlag {
    /// Flags whose first row comes from reading backwards
    pub fn is_descending(&self) -> bool {
        matches!(
            self,
            ReadFlag::KeyOrPrev
                | ReadFlag::BeforeKey
                | ReadFlag::PrefixLast
                | ReadFlag::PrefixLastOrPrev
        )
    }
}

/// One end of a key range: a key prefix and how it bounds the range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Values for the leading key parts, in key order
    pub key: Vec<Value>,
    pub flag: ReadFlag,
}

impl KeyRange {
    pub fn new(key: Vec<Value>, flag: ReadFlag) -> Self {
        Self { key, flag }
    }

    /// Number of key parts covered by this range end
    pub fn parts(&self) -> usize {
        self.key.len()
    }

    pub fn has_null(&self) -> bool {
        self.key.iter().any(Value::is_null)
    }
}

/// Options the server passes through `extra()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtraOption {
    IgnoreDupKey,
    NoIgnoreDupKey,
    IgnoreNoKey,
    NoIgnoreNoKey,
    WriteCanReplace,
    WriteCannotReplace,
    DeleteCannotBatch,
    UpdateCannotBatch,
    KeyRead,
    NoKeyRead,
    BeginAlterCopy,
    EndAlterCopy,
    /// Anything the handler does not act on
    Other,
}

/// Access type of a pushed-join member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushedAccess {
    PrimaryKey,
    UniqueKey,
    OrderedIndexScan,
    TableScan,
}

/// Flag set for `info()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InfoFlags(u32);

impl InfoFlags {
    pub const CONST: InfoFlags = InfoFlags(1 << 0);
    pub const VARIABLE: InfoFlags = InfoFlags(1 << 1);
    pub const ERRKEY: InfoFlags = InfoFlags(1 << 2);
    pub const AUTO: InfoFlags = InfoFlags(1 << 3);
    pub const NO_LOCK: InfoFlags = InfoFlags(1 << 4);

    pub fn contains(&self, other: InfoFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for InfoFlags {
    type Output = InfoFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        InfoFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for InfoFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index capabilities reported through `index_flags()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IndexFlags {
    pub read_next: bool,
    pub read_prev: bool,
    pub read_range: bool,
    pub read_order: bool,
    /// Only whole-key lookups are possible
    pub only_whole_index: bool,
}
