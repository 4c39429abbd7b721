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

//! Operation, scan and transaction shapes exchanged with the cluster client

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::dictionary::NdbTable;
use super::error::NdbError;
use super::interpreted::InterpretedCode;
use crate::core::{FieldBitmap, Value};

/// Cluster attribute ordinal
pub type AttrId = u32;

/// Attribute values of a row or key, in definition order
pub type AttrValues = Vec<(AttrId, Value)>;

/// Opaque per-operation payload, returned unchanged on the completed operation
pub type CustomData = Arc<dyn Any + Send + Sync>;

/// Row lock mode of a read or scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    /// Shared lock
    Read,
    /// Exclusive lock
    Exclusive,
    /// Latest committed value, no lock
    #[default]
    CommittedRead,
}

/// Execute mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecType {
    NoCommit,
    Commit,
    Rollback,
}

/// What an operation error does to the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortOption {
    AbortOnError,
    IgnoreError,
}

/// Commit status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommitStatus {
    #[default]
    NotStarted,
    Started,
    Committed,
    Aborted,
}

/// Pseudo columns readable or settable on any row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoColumn {
    /// Partition (fragment) the row lives in
    Fragment,
    /// Replication author bits
    RowAuthor,
    /// Epoch of the last committed change to the row
    RowGci64,
    /// User-defined partitioning function value
    PartitionFunction,
}

/// A column addressed by an extra get/set value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtraColumn {
    Attr(AttrId),
    Pseudo(PseudoColumn),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetValue {
    pub column: ExtraColumn,
    pub value: Value,
}

/// Bits reported by [`OperationOptions::present`]
pub mod option_flags {
    pub const OO_PARTITION_ID: u32 = 1 << 0;
    pub const OO_ANYVALUE: u32 = 1 << 1;
    pub const OO_SETVALUE: u32 = 1 << 2;
    pub const OO_GETVALUE: u32 = 1 << 3;
    pub const OO_CUSTOMDATA: u32 = 1 << 4;
    pub const OO_INTERPRETED: u32 = 1 << 5;
    pub const OO_DEFERRED_CONSTAINTS: u32 = 1 << 6;
    pub const OO_DISABLE_FK: u32 = 1 << 7;
    pub const OO_ABORTOPTION: u32 = 1 << 8;
}

/// Options attached to a single operation
#[derive(Clone, Default)]
pub struct OperationOptions {
    pub partition_id: Option<u32>,
    pub any_value: Option<u32>,
    pub extra_set_values: SmallVec<[SetValue; 2]>,
    pub extra_get_values: SmallVec<[ExtraColumn; 2]>,
    pub custom_data: Option<CustomData>,
    pub interpreted_code: Option<Arc<InterpretedCode>>,
    pub deferred_constraints: bool,
    pub disable_fk: bool,
    pub abort_option: Option<AbortOption>,
}

impl OperationOptions {
    /// Bitfield of the options that are set
    pub fn present(&self) -> u32 {
        use option_flags::*;
        let mut flags = 0;
        if self.partition_id.is_some() {
            flags |= OO_PARTITION_ID;
        }
        if self.any_value.is_some() {
            flags |= OO_ANYVALUE;
        }
        if !self.extra_set_values.is_empty() {
            flags |= OO_SETVALUE;
        }
        if !self.extra_get_values.is_empty() {
            flags |= OO_GETVALUE;
        }
        if self.custom_data.is_some() {
            flags |= OO_CUSTOMDATA;
        }
        if self.interpreted_code.is_some() {
            flags |= OO_INTERPRETED;
        }
        if self.deferred_constraints {
            flags |= OO_DEFERRED_CONSTAINTS;
        }
        if self.disable_fk {
            flags |= OO_DISABLE_FK;
        }
        if self.abort_option.is_some() {
            flags |= OO_ABORTOPTION;
        }
        flags
    }

    pub fn set_value(&mut self, column: ExtraColumn, value: Value) {
        self.extra_set_values.push(SetValue { column, value });
    }

    pub fn get_value(&mut self, column: ExtraColumn) {
        self.extra_get_values.push(column);
    }
}

impl fmt::Debug for OperationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationOptions")
            .field("partition_id", &self.partition_id)
            .field("any_value", &self.any_value)
            .field("extra_set_values", &self.extra_set_values)
            .field("extra_get_values", &self.extra_get_values)
            .field("custom_data", &self.custom_data.is_some())
            .field("interpreted_code", &self.interpreted_code)
            .field("deferred_constraints", &self.deferred_constraints)
            .field("disable_fk", &self.disable_fk)
            .field("abort_option", &self.abort_option)
            .finish()
    }
}

/// Kind of a defined operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Insert,
    /// Insert or overwrite
    Write,
    Update,
    Delete,
    Refresh,
    LockCurrent,
    UpdateCurrent,
    DeleteCurrent,
}

/// Which key an operation addresses the row by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyAccess {
    /// Primary key, or the hidden key on tables without one
    PrimaryKey,
    /// Unique hash index, by object id
    UniqueIndex(u32),
}

/// A single-row operation to define on a transaction
#[derive(Debug, Clone)]
pub struct OperationDef {
    pub kind: OperationKind,
    pub table: Arc<NdbTable>,
    pub access: KeyAccess,
    /// Key values in index attribute order
    pub key: Vec<Value>,
    /// Attribute values to write
    pub values: AttrValues,
    /// Attributes to read back
    pub read_mask: Option<FieldBitmap>,
    pub lock_mode: LockMode,
    /// Blob attributes to stream back through the activation queue
    pub blob_reads: Vec<AttrId>,
    /// Blob attributes to set; `None` sets NULL
    pub blob_writes: Vec<(AttrId, Option<Arc<[u8]>>)>,
    pub options: OperationOptions,
}

impl OperationDef {
    fn base(kind: OperationKind, table: Arc<NdbTable>, access: KeyAccess, key: Vec<Value>) -> Self {
        Self {
            kind,
            table,
            access,
            key,
            values: Vec::new(),
            read_mask: None,
            lock_mode: LockMode::Exclusive,
            blob_reads: Vec::new(),
            blob_writes: Vec::new(),
            options: OperationOptions::default(),
        }
    }

    pub fn read(
        table: Arc<NdbTable>,
        access: KeyAccess,
        key: Vec<Value>,
        mask: FieldBitmap,
        lock_mode: LockMode,
    ) -> Self {
        let mut op = Self::base(OperationKind::Read, table, access, key);
        op.read_mask = Some(mask);
        op.lock_mode = lock_mode;
        op
    }

    pub fn insert(table: Arc<NdbTable>, key: Vec<Value>, values: AttrValues) -> Self {
        let mut op = Self::base(OperationKind::Insert, table, KeyAccess::PrimaryKey, key);
        op.values = values;
        op
    }

    pub fn write(table: Arc<NdbTable>, key: Vec<Value>, values: AttrValues) -> Self {
        let mut op = Self::base(OperationKind::Write, table, KeyAccess::PrimaryKey, key);
        op.values = values;
        op
    }

    pub fn update(
        table: Arc<NdbTable>,
        access: KeyAccess,
        key: Vec<Value>,
        values: AttrValues,
    ) -> Self {
        let mut op = Self::base(OperationKind::Update, table, access, key);
        op.values = values;
        op
    }

    pub fn delete(table: Arc<NdbTable>, access: KeyAccess, key: Vec<Value>) -> Self {
        Self::base(OperationKind::Delete, table, access, key)
    }

    pub fn refresh(table: Arc<NdbTable>, key: Vec<Value>) -> Self {
        Self::base(OperationKind::Refresh, table, KeyAccess::PrimaryKey, key)
    }

    pub fn with_options(mut self, options: OperationOptions) -> Self {
        self.options = options;
        self
    }
}

/// Handle of a defined operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

/// Handle of an open scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanId(pub u64);

/// Handle of a pushed query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId(pub u64);

/// An executed operation with its per-operation outcome
#[derive(Clone)]
pub struct CompletedOp {
    pub id: OpId,
    pub kind: OperationKind,
    pub table: String,
    pub access: KeyAccess,
    /// `code == 0` when the operation succeeded
    pub error: NdbError,
    /// Attributes read by a successful read
    pub values: Option<AttrValues>,
    pub extra: Vec<(ExtraColumn, Value)>,
    pub custom_data: Option<CustomData>,
}

impl CompletedOp {
    pub fn succeeded(&self) -> bool {
        self.error.code == 0
    }

    pub fn extra_value(&self, column: ExtraColumn) -> Option<&Value> {
        self.extra.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }
}

impl fmt::Debug for CompletedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedOp")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("table", &self.table)
            .field("error", &self.error.code)
            .field("custom_data", &self.custom_data.is_some())
            .finish()
    }
}

/// Scan option flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScanFlags(u32);

impl ScanFlags {
    pub const KEY_INFO: ScanFlags = ScanFlags(1 << 0);
    pub const ORDER_BY_FULL: ScanFlags = ScanFlags(1 << 1);
    pub const DESCENDING: ScanFlags = ScanFlags(1 << 2);
    pub const DISK_SCAN: ScanFlags = ScanFlags(1 << 3);

    pub fn empty() -> Self {
        ScanFlags(0)
    }

    pub fn contains(&self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ScanFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ScanFlags) {
        self.0 &= !other.0;
    }
}

/// Bounds of an ordered index scan, values in index attribute order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexBound {
    pub low: Vec<Value>,
    pub low_inclusive: bool,
    pub high: Vec<Value>,
    pub high_inclusive: bool,
}

/// A scan to open on a transaction
#[derive(Debug, Clone)]
pub struct ScanDef {
    pub table: Arc<NdbTable>,
    /// Ordered index object id; `None` scans the table
    pub index: Option<u32>,
    pub bound: Option<IndexBound>,
    pub read_mask: FieldBitmap,
    pub lock_mode: LockMode,
    pub flags: ScanFlags,
    pub partition_id: Option<u32>,
    pub extra_get_values: SmallVec<[ExtraColumn; 2]>,
    pub blob_reads: Vec<AttrId>,
    /// Equality filter evaluated on the data nodes
    pub filter: Option<AttrValues>,
}

/// Result of advancing a scan or pushed query
#[derive(Debug, Clone, PartialEq)]
pub enum ScanStep {
    Row(ScanRow),
    /// Scan is exhausted
    NoMoreRecords,
    /// Local cache exhausted; fetching more requires contacting the cluster
    NoMoreCached,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanRow {
    pub values: AttrValues,
    pub extra: Vec<(ExtraColumn, Value)>,
}

impl ScanRow {
    pub fn extra_value(&self, column: ExtraColumn) -> Option<&Value> {
        self.extra.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }
}

/// Locality hint for starting a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionHint {
    Key { table: String, key: Vec<Value> },
    Partition { table: String, partition_id: u32 },
}

/// Origin of a blob activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobSource {
    Operation(OpId),
    Scan(ScanId),
    Query(QueryId, usize),
}

/// Notification that a blob of the current row is ready to be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobActivation {
    pub source: BlobSource,
    pub attr: AttrId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlobInfo {
    pub is_null: bool,
    pub length: u64,
}

/// Locally cached range of auto-increment values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TupleIdRange {
    pub first_tuple_id: u64,
    pub last_tuple_id: u64,
    pub highest_seen: u64,
}

impl TupleIdRange {
    pub fn reset(&mut self) {
        *self = TupleIdRange::default();
    }

    /// Values left in the cached range
    pub fn remaining(&self) -> u64 {
        self.last_tuple_id.saturating_sub(self.first_tuple_id)
    }
}

/// Row and commit statistics of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TableStatistics {
    pub row_count: u64,
    pub commit_count: u64,
    pub row_size: u64,
    pub fragment_memory: u64,
}

/// How a pushed-join member finds its key values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Bound parameter at this position
    Param(usize),
    /// Attribute of the row fetched by an earlier member
    Parent { member: usize, attr: AttrId },
}

/// One table of a pushed join, looked up by key
#[derive(Debug, Clone)]
pub struct PushedMember {
    pub table: Arc<NdbTable>,
    pub access: KeyAccess,
    /// One source per key attribute, in index attribute order
    pub key: Vec<KeySource>,
    pub read_mask: FieldBitmap,
}

/// A prepared lookup join executed on the data nodes
#[derive(Debug, Clone)]
pub struct PushedJoinDef {
    pub members: Vec<PushedMember>,
}

#[cfg(test)]
mod tests {
    use super::option_flags::*;
    use super::*;

    #[test]
    fn test_options_present() {
        let mut opts = OperationOptions::default();
        assert_eq!(opts.present(), 0);
        opts.partition_id = Some(3);
        opts.set_value(ExtraColumn::Pseudo(PseudoColumn::RowAuthor), Value::unsigned(1));
        opts.disable_fk = true;
        let p = opts.present();
        assert_eq!(p, OO_PARTITION_ID | OO_SETVALUE | OO_DISABLE_FK);
    }

    #[test]
    fn test_scan_flags() {
        let mut f = ScanFlags::empty();
        f.insert(ScanFlags::KEY_INFO);
        f.insert(ScanFlags::DESCENDING);
        assert!(f.contains(ScanFlags::KEY_INFO));
        assert!(!f.contains(ScanFlags::ORDER_BY_FULL));
        f.remove(ScanFlags::KEY_INFO);
        assert!(!f.contains(ScanFlags::KEY_INFO));
    }

    #[test]
    fn test_tuple_id_range() {
        let mut r = TupleIdRange {
            first_tuple_id: 10,
            last_tuple_id: 20,
            highest_seen: 20,
        };
        assert_eq!(r.remaining(), 10);
        r.reset();
        assert_eq!(r, TupleIdRange::default());
    }
}
