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

//! Cluster error reporting
//!
//! Errors are reported per operation and per transaction, each with a
//! numeric code, a status, a classification and the handler error the code
//! maps to (`mysql_code`, `-1` when unmapped).

use std::fmt;

use crate::core::error::{
    HA_ERR_FOUND_DUPP_KEY, HA_ERR_KEY_NOT_FOUND, HA_ERR_NO_CONNECTION, HA_ERR_NO_REFERENCED_ROW,
    HA_ERR_NO_SUCH_TABLE, HA_ERR_TABLE_DEF_CHANGED,
};

/// Tuple did not exist
pub const NDB_ERR_NO_DATA_FOUND: i32 = 626;
/// Tuple already existed when attempting to insert
pub const NDB_ERR_TUPLE_EXISTS: i32 = 630;
/// Duplicate value in a unique index; `details` holds the index object id
pub const NDB_ERR_UNIQUE_VIOLATION: i32 = 893;
/// Operation defined after a refresh of the same row
pub const ERROR_OP_AFTER_REFRESH_OP: i32 = 920;
/// Interpreted conflict program rejected the operation
pub const ERROR_CONFLICT_FN_VIOLATION: i32 = 9999;
/// Refresh requested on a table with blob columns
pub const NDBAPI_ERR_REFRESH_ON_BLOB_TABLE: i32 = 4343;
/// Time-out in NDB, probably caused by deadlock
pub const NDB_ERR_TIMEOUT: i32 = 266;
/// Invalid schema object version
pub const NDB_ERR_INVALID_SCHEMA_VERSION: i32 = 241;
/// Cluster failure
pub const NDB_ERR_CLUSTER_FAILURE: i32 = 4009;
/// No such table existed
pub const NDB_ERR_NO_SUCH_TABLE: i32 = 709;
/// Foreign key parent row missing; `details` holds the foreign key id
pub const NDB_ERR_FK_NO_PARENT: i32 = 255;

/// Handler code for lock wait timeout
const HA_ERR_LOCK_WAIT_TIMEOUT: i32 = 146;

/// Outcome status of a cluster request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NdbErrorStatus {
    #[default]
    Success,
    TemporaryError,
    PermanentError,
    UnknownResult,
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NdbErrorClassification {
    #[default]
    NoError,
    ApplicationError,
    NoDataFound,
    ConstraintViolation,
    SchemaError,
    UserDefinedError,
    InsufficientSpace,
    TemporaryResourceError,
    NodeRecoveryError,
    OverloadError,
    TimeoutExpired,
    UnknownResultError,
    InternalError,
    FunctionNotImplemented,
    NodeShutdown,
}

/// An error reported by the cluster client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NdbError {
    pub code: i32,
    /// Mapped handler error, `-1` or `0` when there is no mapping
    pub mysql_code: i32,
    pub status: NdbErrorStatus,
    pub classification: NdbErrorClassification,
    pub message: String,
    /// Object id related to the error (unique index, foreign key)
    pub details: Option<u32>,
}

impl NdbError {
    pub fn new(
        code: i32,
        mysql_code: i32,
        status: NdbErrorStatus,
        classification: NdbErrorClassification,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            mysql_code,
            status,
            classification,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: u32) -> Self {
        self.details = Some(details);
        self
    }

    pub fn no_data_found() -> Self {
        Self::new(
            NDB_ERR_NO_DATA_FOUND,
            HA_ERR_KEY_NOT_FOUND,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::NoDataFound,
            "Tuple did not exist",
        )
    }

    pub fn tuple_exists() -> Self {
        Self::new(
            NDB_ERR_TUPLE_EXISTS,
            HA_ERR_FOUND_DUPP_KEY,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::ConstraintViolation,
            "Tuple already existed when attempting to insert",
        )
    }

    pub fn unique_violation(index_object_id: u32) -> Self {
        Self::new(
            NDB_ERR_UNIQUE_VIOLATION,
            HA_ERR_FOUND_DUPP_KEY,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::ConstraintViolation,
            "Constraint violation e.g. duplicate value in unique index",
        )
        .with_details(index_object_id)
    }

    pub fn conflict_fn_violation() -> Self {
        Self::new(
            ERROR_CONFLICT_FN_VIOLATION,
            -1,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::ApplicationError,
            "Conflict detection function rejected operation",
        )
    }

    pub fn op_after_refresh() -> Self {
        Self::new(
            ERROR_OP_AFTER_REFRESH_OP,
            -1,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::ApplicationError,
            "Row operation defined after refreshTuple()",
        )
    }

    pub fn refresh_on_blob_table() -> Self {
        Self::new(
            NDBAPI_ERR_REFRESH_ON_BLOB_TABLE,
            -1,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::ApplicationError,
            "Refresh operation not supported on table with blobs",
        )
    }

    pub fn timeout() -> Self {
        Self::new(
            NDB_ERR_TIMEOUT,
            HA_ERR_LOCK_WAIT_TIMEOUT,
            NdbErrorStatus::TemporaryError,
            NdbErrorClassification::TimeoutExpired,
            "Time-out in NDB, probably caused by deadlock",
        )
    }

    pub fn invalid_schema_version() -> Self {
        Self::new(
            NDB_ERR_INVALID_SCHEMA_VERSION,
            HA_ERR_TABLE_DEF_CHANGED,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::SchemaError,
            "Invalid schema object version",
        )
    }

    pub fn cluster_failure() -> Self {
        Self::new(
            NDB_ERR_CLUSTER_FAILURE,
            HA_ERR_NO_CONNECTION,
            NdbErrorStatus::UnknownResult,
            NdbErrorClassification::UnknownResultError,
            "Cluster Failure",
        )
    }

    pub fn no_such_table() -> Self {
        Self::new(
            NDB_ERR_NO_SUCH_TABLE,
            HA_ERR_NO_SUCH_TABLE,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::SchemaError,
            "No such table existed",
        )
    }

    pub fn foreign_key_no_parent(fk_id: u32) -> Self {
        Self::new(
            NDB_ERR_FK_NO_PARENT,
            HA_ERR_NO_REFERENCED_ROW,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::ConstraintViolation,
            "Foreign key constraint violated: No parent row found",
        )
        .with_details(fk_id)
    }

    /// Generic permanent internal error
    pub fn internal(code: i32, message: impl Into<String>) -> Self {
        Self::new(
            code,
            -1,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::InternalError,
            message,
        )
    }

    #[inline]
    pub fn is_temporary(&self) -> bool {
        self.status == NdbErrorStatus::TemporaryError
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.code != 0
    }

    /// Constraint violation or no-data-found, which ignore modes filter
    #[inline]
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self.classification,
            NdbErrorClassification::NoError
                | NdbErrorClassification::ConstraintViolation
                | NdbErrorClassification::NoDataFound
        )
    }
}

impl fmt::Display for NdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NDB error {} '{}'", self.code, self.message)
    }
}
