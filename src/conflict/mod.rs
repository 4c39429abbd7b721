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

//! Conflict detection and resolution for replicated writes
//!
//! Active only for sessions owned by a replication applier. Each applied row
//! event may carry extra row info (transaction id and conflict flags). Tables
//! configured with a conflict function get an interpreted program attached
//! to their operations; after execute, rejected operations are resolved by
//! refreshing the row and logging it to the exceptions table.
//!
//! - [`Applier`] - Channel state, role, epochs and conflict counters
//! - [`ConflictFnShare`] - Per-table conflict function configuration
//! - [`ExceptionsTableWriter`] - Writes exception rows on conflict
//! - [`ExtraRowInfo`] - Parser for the extra row info of an event
//! - [`handle_conflict_op_error`] / [`handle_row_conflict`] - Resolution

pub mod any_value;
pub mod applier;
pub mod exceptions;
pub mod extra_row_info;
pub mod function;
pub mod resolve;

use std::fmt;

pub use applier::{Applier, EpochState, OPS_DEFINED};
pub use exceptions::{ExceptionData, ExceptionsTableWriter};
pub use extra_row_info::{ExtraRowInfo, INVALID_TRANSACTION_ID};
pub use function::{ConflictFnDef, ConflictFnShare, ConflictFnType, RowImages};
pub use resolve::{handle_conflict_op_error, handle_row_conflict, RowConflict};

/// Kind of replicated row change that met a conflict
///
/// Values are what the exceptions table records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictingOpType {
    WriteRow = 1,
    UpdateRow = 2,
    DeleteRow = 3,
    /// Refresh generated by conflict handling
    RefreshRow = 4,
    /// Read recorded upstream as an exclusive read
    ReadRow = 5,
}

impl fmt::Display for ConflictingOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictingOpType::WriteRow => "WRITE_ROW",
            ConflictingOpType::UpdateRow => "UPDATE_ROW",
            ConflictingOpType::DeleteRow => "DELETE_ROW",
            ConflictingOpType::RefreshRow => "REFRESH_ROW",
            ConflictingOpType::ReadRow => "READ_ROW",
        };
        write!(f, "{}", name)
    }
}

/// Why a row was declared in conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictCause {
    RowAlreadyExists = 1,
    RowDoesNotExist = 2,
    RowInConflict = 3,
    /// Row belongs to a transaction already marked in conflict
    TransInConflict = 4,
}

impl fmt::Display for ConflictCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictCause::RowAlreadyExists => "ROW_ALREADY_EXISTS",
            ConflictCause::RowDoesNotExist => "ROW_DOES_NOT_EXIST",
            ConflictCause::RowInConflict => "ROW_IN_CONFLICT",
            ConflictCause::TransInConflict => "TRANS_IN_CONFLICT",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_codes() {
        assert_eq!(ConflictingOpType::DeleteRow as u8, 3);
        assert_eq!(ConflictingOpType::RefreshRow as u8, 4);
        assert_eq!(ConflictCause::TransInConflict as u8, 4);
        assert_eq!(ConflictCause::RowDoesNotExist.to_string(), "ROW_DOES_NOT_EXIST");
        assert_eq!(ConflictingOpType::UpdateRow.to_string(), "UPDATE_ROW");
    }
}
