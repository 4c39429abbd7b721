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

//! Error types for the handler
//!
//! Every handler entry point reports failures through [`Error`]. Cluster
//! failures travel unmapped as [`Error::Cluster`] inside the batch executor
//! and are translated into handler errors (with duplicate key resolution and
//! warnings) at the handler boundary.

use thiserror::Error;

use crate::cluster::error::NdbError;

/// Result type alias for handler operations
pub type Result<T> = std::result::Result<T, Error>;

// Handler error numbers understood by the server executor.
pub const HA_ERR_FIRST: i32 = 120;
pub const HA_ERR_KEY_NOT_FOUND: i32 = 120;
pub const HA_ERR_FOUND_DUPP_KEY: i32 = 121;
pub const HA_ERR_INTERNAL_ERROR: i32 = 122;
pub const HA_ERR_CRASHED: i32 = 126;
pub const HA_ERR_OUT_OF_MEM: i32 = 128;
pub const HA_ERR_END_OF_FILE: i32 = 137;
pub const HA_ERR_RECORD_DELETED: i32 = 134;
pub const HA_ERR_NO_SUCH_TABLE: i32 = 155;
pub const HA_ERR_NO_CONNECTION: i32 = 157;
pub const HA_ERR_TABLE_DEF_CHANGED: i32 = 159;
pub const HA_ERR_NO_REFERENCED_ROW: i32 = 151;
pub const HA_ERR_ROW_IS_REFERENCED: i32 = 152;
pub const HA_ERR_GENERIC: i32 = 168;

// Server error numbers used for replication failures.
pub const ER_REPLICA_CORRUPT_EVENT: i32 = 1610;
pub const ER_REPLICA_CONFIGURATION: i32 = 1794;
pub const ER_EXCEPTIONS_WRITE_ERROR: i32 = 1627;
pub const ER_TABLE_DEF_CHANGED: i32 = 1412;
pub const ER_GET_ERRMSG: i32 = 1296;
pub const ER_GET_TEMPORARY_ERRMSG: i32 = 1297;
pub const ER_OUTOFMEMORY: i32 = 1037;
pub const WARN_DATA_TRUNCATED: i32 = 1265;

/// Main error type for handler operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Row access errors
    // =========================================================================
    /// Key lookup found no row
    #[error("can't find record")]
    KeyNotFound,

    /// Scan or range read is exhausted
    #[error("end of file")]
    EndOfFile,

    /// Row referenced by a stored position no longer exists
    #[error("record was deleted")]
    RecordDeleted,

    /// Write collided with an existing key; `dupkey` is the key ordinal if known
    #[error("duplicate entry for key {}", dupkey.map_or("unknown".to_string(), |k| k.to_string()))]
    FoundDuplicateKey { dupkey: Option<usize> },

    // =========================================================================
    // Cluster errors
    // =========================================================================
    /// Raw cluster error, not yet mapped to a handler error
    #[error("cluster error {}: {}", .0.code, .0.message)]
    Cluster(NdbError),

    /// Cluster error mapped to a handler error code
    #[error("got error {code} '{message}' from NDB")]
    Ndb {
        code: i32,
        handler_code: i32,
        temporary: bool,
        message: String,
    },

    /// No connection to the cluster
    #[error("no connection to cluster: {0}")]
    NoConnection(String),

    /// Table definition changed underneath the handler
    #[error("table definition changed: {0}")]
    TableDefChanged(String),

    /// Source table changed while a copying ALTER was reading it
    #[error("detected change to data in source table during copying ALTER TABLE; alter aborted to avoid inconsistency")]
    CopyingAlterConflict { table: String },

    /// Index exists in the server dictionary but not in the cluster
    #[error("index '{index}' is offline")]
    IndexOffline { index: String },

    /// Buffer or arena allocation failed
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Foreign key constraint failed
    #[error("foreign key constraint '{constraint}' failed: {detail}")]
    ForeignKeyViolation { constraint: String, detail: String },

    // =========================================================================
    // Replication errors
    // =========================================================================
    /// Replicated event could not be applied as received
    #[error("replica corrupt event: {0}")]
    ReplicaCorruptEvent(String),

    /// Replica setup does not allow the event to be applied
    #[error("replica configuration error: {0}")]
    ReplicaConfiguration(String),

    /// Conflict handling could not write refresh or exception rows
    #[error("exceptions write error: {0}")]
    ExceptionsWriteError(String),

    // =========================================================================
    // Generic errors
    // =========================================================================
    /// Invalid argument passed to a handler call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new FoundDuplicateKey error
    pub fn duplicate_key(dupkey: Option<usize>) -> Self {
        Error::FoundDuplicateKey { dupkey }
    }

    /// Create a new TableDefChanged error
    pub fn table_def_changed(message: impl Into<String>) -> Self {
        Error::TableDefChanged(message.into())
    }

    /// Wrap an unmapped cluster error
    pub fn from_ndb(err: NdbError) -> Self {
        Error::Cluster(err)
    }

    /// Create a new CopyingAlterConflict error
    pub fn copying_alter_conflict(table: impl Into<String>) -> Self {
        Error::CopyingAlterConflict {
            table: table.into(),
        }
    }

    /// Create a new IndexOffline error
    pub fn index_offline(index: impl Into<String>) -> Self {
        Error::IndexOffline {
            index: index.into(),
        }
    }

    /// Create a new OutOfMemory error
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Error::OutOfMemory(message.into())
    }

    /// Create a new ReplicaCorruptEvent error
    pub fn replica_corrupt_event(message: impl Into<String>) -> Self {
        Error::ReplicaCorruptEvent(message.into())
    }

    /// Create a new ReplicaConfiguration error
    pub fn replica_configuration(message: impl Into<String>) -> Self {
        Error::ReplicaConfiguration(message.into())
    }

    /// Create a new ExceptionsWriteError error
    pub fn exceptions_write(message: impl Into<String>) -> Self {
        Error::ExceptionsWriteError(message.into())
    }

    /// Create a new InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Handler error number reported to the server executor
    pub fn handler_code(&self) -> i32 {
        match self {
            Error::KeyNotFound => HA_ERR_KEY_NOT_FOUND,
            Error::EndOfFile => HA_ERR_END_OF_FILE,
            Error::RecordDeleted => HA_ERR_RECORD_DELETED,
            Error::FoundDuplicateKey { .. } => HA_ERR_FOUND_DUPP_KEY,
            Error::Cluster(err) => {
                if err.mysql_code > 0 {
                    err.mysql_code
                } else {
                    HA_ERR_INTERNAL_ERROR
                }
            }
            Error::Ndb { handler_code, .. } => *handler_code,
            Error::NoConnection(_) => HA_ERR_NO_CONNECTION,
            Error::TableDefChanged(_) | Error::CopyingAlterConflict { .. } => {
                HA_ERR_TABLE_DEF_CHANGED
            }
            Error::IndexOffline { .. } => HA_ERR_CRASHED,
            Error::OutOfMemory(_) => HA_ERR_OUT_OF_MEM,
            Error::ForeignKeyViolation { .. } => HA_ERR_NO_REFERENCED_ROW,
            Error::ReplicaCorruptEvent(_) => ER_REPLICA_CORRUPT_EVENT,
            Error::ReplicaConfiguration(_) => ER_REPLICA_CONFIGURATION,
            Error::ExceptionsWriteError(_) => ER_EXCEPTIONS_WRITE_ERROR,
            Error::InvalidArgument(_) | Error::Internal { .. } => HA_ERR_GENERIC,
        }
    }

    /// Check if the statement may succeed when retried
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Cluster(err) => err.is_temporary(),
            Error::Ndb { temporary, .. } => *temporary,
            _ => false,
        }
    }

    /// Check if this is a "key not found" error
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Error::KeyNotFound)
    }

    /// Check if this is an end of scan
    pub fn is_end_of_file(&self) -> bool {
        matches!(self, Error::EndOfFile)
    }

    /// Check if this is a duplicate key error
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Error::FoundDuplicateKey { .. })
    }

    /// Check if this error stops the replication applier
    pub fn is_applier_fatal(&self) -> bool {
        matches!(
            self,
            Error::ReplicaCorruptEvent(_)
                | Error::ReplicaConfiguration(_)
                | Error::ExceptionsWriteError(_)
        )
    }
}

impl From<NdbError> for Error {
    fn from(err: NdbError) -> Self {
        Error::from_ndb(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::KeyNotFound.to_string(), "can't find record");
        assert_eq!(Error::EndOfFile.to_string(), "end of file");
        assert_eq!(
            Error::duplicate_key(Some(2)).to_string(),
            "duplicate entry for key 2"
        );
        assert_eq!(
            Error::duplicate_key(None).to_string(),
            "duplicate entry for key unknown"
        );
        assert_eq!(
            Error::index_offline("uk_email").to_string(),
            "index 'uk_email' is offline"
        );
    }

    #[test]
    fn test_handler_codes() {
        assert_eq!(Error::KeyNotFound.handler_code(), HA_ERR_KEY_NOT_FOUND);
        assert_eq!(Error::EndOfFile.handler_code(), HA_ERR_END_OF_FILE);
        assert_eq!(Error::RecordDeleted.handler_code(), HA_ERR_RECORD_DELETED);
        assert_eq!(
            Error::duplicate_key(None).handler_code(),
            HA_ERR_FOUND_DUPP_KEY
        );
        assert_eq!(
            Error::table_def_changed("x").handler_code(),
            HA_ERR_TABLE_DEF_CHANGED
        );
        assert_eq!(Error::index_offline("i").handler_code(), HA_ERR_CRASHED);
        assert_eq!(Error::out_of_memory("m").handler_code(), HA_ERR_OUT_OF_MEM);
    }

    #[test]
    fn test_error_classification() {
        let temp = Error::Ndb {
            code: 266,
            handler_code: 146,
            temporary: true,
            message: "Time-out in NDB".to_string(),
        };
        assert!(temp.is_temporary());
        assert!(!Error::KeyNotFound.is_temporary());
        assert!(Error::KeyNotFound.is_key_not_found());
        assert!(Error::EndOfFile.is_end_of_file());
        assert!(Error::duplicate_key(Some(0)).is_duplicate_key());
        assert!(Error::replica_corrupt_event("bad").is_applier_fatal());
        assert!(!Error::KeyNotFound.is_applier_fatal());
    }

    #[test]
    fn test_cluster_error_conversion() {
        let err: Error = NdbError::no_data_found().into();
        assert!(matches!(err, Error::Cluster(_)));
        assert_eq!(err.handler_code(), HA_ERR_KEY_NOT_FOUND);
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(Error::duplicate_key(Some(1)), Error::duplicate_key(Some(1)));
        assert_ne!(Error::duplicate_key(Some(1)), Error::duplicate_key(Some(2)));
        assert_ne!(Error::KeyNotFound, Error::EndOfFile);
    }
}
