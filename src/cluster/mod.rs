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

//! Cluster client interfaces
//!
//! - [`NdbClient`] - Connection level services (transactions, auto-increment)
//! - [`NdbTransaction`] - Operations, scans, blobs and pushed queries
//! - [`NdbDictionary`] - Table and index lookup
//! - [`NdbRecord`] - Buffer layout descriptors
//! - [`InterpretedCode`] - Programs evaluated on the data nodes
//! - [`memory`] - Deterministic in-process cluster

pub mod client;
pub mod dictionary;
pub mod error;
pub mod interpreted;
pub mod memory;
pub mod record;
pub mod types;

pub use client::{NdbClient, NdbTransaction};
pub use dictionary::{
    ColumnKind, NdbColumn, NdbDictionary, NdbIndex, NdbIndexKind, NdbTable, ObjectStatus,
};
pub use error::{NdbError, NdbErrorClassification, NdbErrorStatus};
pub use interpreted::{Condition, InterpretedCode};
pub use record::{NdbRecord, RecordColumn, RecordKind};
pub use types::{
    AbortOption, AttrId, AttrValues, BlobActivation, BlobInfo, BlobSource, CommitStatus,
    CompletedOp, CustomData, ExecType, ExtraColumn, IndexBound, KeyAccess, KeySource, LockMode,
    OpId, OperationDef, OperationKind, OperationOptions, PseudoColumn, PushedJoinDef,
    PushedMember, QueryId, ScanDef, ScanFlags, ScanId, ScanRow, ScanStep, SetValue,
    TableStatistics, TransactionHint, TupleIdRange,
};
