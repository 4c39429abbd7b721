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

//! Cluster client contract
//!
//! The handler consumes these traits and never talks to data nodes itself.

use super::dictionary::{NdbDictionary, NdbTable};
use super::error::NdbError;
use super::types::{
    AbortOption, AttrId, AttrValues, BlobActivation, BlobInfo, BlobSource, CommitStatus,
    CompletedOp, ExecType, OpId, OperationDef, OperationOptions, PushedJoinDef, QueryId, ScanDef,
    ScanId, ScanStep, TableStatistics, TransactionHint, TupleIdRange,
};
use crate::core::Value;

/// Connection to the cluster shared by all sessions
pub trait NdbClient: Send + Sync {
    /// Start a transaction, optionally placed near the data it will touch
    fn start_transaction(
        &self,
        hint: Option<&TransactionHint>,
    ) -> Result<Box<dyn NdbTransaction>, NdbError>;

    /// Dictionary used to resolve tables and indexes
    fn dictionary(&self) -> &dyn NdbDictionary;

    /// Number of committed transactions that changed the table
    fn table_commit_count(&self, table: &NdbTable) -> Result<u64, NdbError>;

    /// Row count and related statistics of the table
    fn table_statistics(&self, table: &NdbTable) -> Result<TableStatistics, NdbError>;

    // ---- Auto-increment ----

    /// Reserve the next value, refilling `range` with `cache_size` values
    /// from the cluster when it is exhausted
    fn get_auto_increment_value(
        &self,
        table: &NdbTable,
        range: &mut TupleIdRange,
        cache_size: u32,
        step: u64,
        start: u64,
    ) -> Result<u64, NdbError>;

    /// Next value that would be handed out, without reserving it
    fn read_auto_increment_value(
        &self,
        table: &NdbTable,
        range: &TupleIdRange,
    ) -> Result<u64, NdbError>;

    /// Move the next value to at least `value`
    fn set_auto_increment_value(
        &self,
        table: &NdbTable,
        range: &mut TupleIdRange,
        value: u64,
        modify: bool,
    ) -> Result<(), NdbError>;

    /// True when `value` would move the high-water mark of `range`
    fn check_update_auto_increment_value(&self, range: &TupleIdRange, value: u64) -> bool {
        value > range.highest_seen
    }

    /// Times the client has (re)connected to the cluster
    fn connect_count(&self) -> u64;
}

/// A cluster transaction
///
/// Operations are defined in call order and sent on `execute`. After an
/// execute the defined operations are completed and carry their own error
/// and result values.
pub trait NdbTransaction: Send {
    // ---- Operations ----

    /// Define a single-row operation
    fn define_operation(&mut self, op: OperationDef) -> Result<OpId, NdbError>;

    /// Send all defined operations
    ///
    /// Returns an error when the execute itself failed; with
    /// `AbortOption::IgnoreError` per-operation errors do not fail it but
    /// are reported through [`NdbTransaction::error`].
    fn execute(
        &mut self,
        exec_type: ExecType,
        abort_option: AbortOption,
        force_send: bool,
    ) -> Result<(), NdbError>;

    /// First error of the last execute, `code == 0` when none
    fn error(&self) -> NdbError;

    fn commit_status(&self) -> CommitStatus;

    /// Epoch the transaction committed in, if it committed anything
    fn gci(&self) -> Option<u64>;

    /// Completed operations since the last release, in definition order
    fn completed_operations(&self) -> Vec<CompletedOp>;

    /// A completed operation by handle
    fn operation(&self, op: OpId) -> Option<CompletedOp>;

    /// Last operation defined on the transaction
    fn last_defined_operation(&self) -> Option<OpId>;

    /// Drop completed operations and pushed queries
    fn release_completed_operations(&mut self);

    /// Reuse the transaction object after a commit
    fn restart(&mut self) -> Result<(), NdbError>;

    // ---- Scans ----

    /// Define a table or ordered index scan
    fn scan(&mut self, def: ScanDef) -> Result<ScanId, NdbError>;

    /// Advance a scan; with `fetch_allowed` false only cached rows are returned
    fn next_result(
        &mut self,
        scan: ScanId,
        fetch_allowed: bool,
        force_send: bool,
    ) -> Result<ScanStep, NdbError>;

    /// Take over the lock of the current scan row
    fn lock_current_tuple(
        &mut self,
        scan: ScanId,
        options: OperationOptions,
    ) -> Result<OpId, NdbError>;

    /// Update the current scan row
    fn update_current_tuple(
        &mut self,
        scan: ScanId,
        values: AttrValues,
        blob_writes: Vec<(AttrId, Option<std::sync::Arc<[u8]>>)>,
        options: OperationOptions,
    ) -> Result<OpId, NdbError>;

    /// Delete the current scan row
    fn delete_current_tuple(
        &mut self,
        scan: ScanId,
        options: OperationOptions,
    ) -> Result<OpId, NdbError>;

    fn close_scan(&mut self, scan: ScanId);

    // ---- Blobs ----

    /// Drain blob activations raised since the last call
    fn take_blob_activations(&mut self) -> Vec<BlobActivation>;

    /// Null flag and length of a blob of the current row
    fn blob_info(&self, source: BlobSource, attr: AttrId) -> Result<BlobInfo, NdbError>;

    /// Read blob data into `buf`; returns the bytes read
    fn read_blob(
        &mut self,
        source: BlobSource,
        attr: AttrId,
        buf: &mut [u8],
    ) -> Result<usize, NdbError>;

    /// Release blob handles of a source
    fn close_blobs(&mut self, source: BlobSource);

    // ---- Pushed queries ----

    /// Instantiate a pushed join with bound parameters
    fn create_query(
        &mut self,
        def: &PushedJoinDef,
        params: Vec<Value>,
    ) -> Result<QueryId, NdbError>;

    /// Row of `member` for the current query result
    fn query_next(
        &mut self,
        query: QueryId,
        member: usize,
        fetch_allowed: bool,
    ) -> Result<ScanStep, NdbError>;

    fn close_query(&mut self, query: QueryId);
}
