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

//! Conflict resolution after execute
//!
//! A rejected operation is resolved by refreshing the row, so the winning
//! version is replicated back to the other cluster, and by logging the
//! losing change to the exceptions table.

use std::sync::Arc;

use super::any_value::ANYVALUE_REFRESH_OP;
use super::applier::Applier;
use super::exceptions::{ExceptionData, ExceptionRow};
use super::extra_row_info::INVALID_TRANSACTION_ID;
use super::function::{
    ConflictFnShare, CFF_REFRESH_ROWS, CF_DEL_DEL_CFT, CF_TRANSACTIONAL, CF_USE_ROLE_VAR,
};
use super::{ConflictCause, ConflictingOpType};
use crate::cluster::error::{
    NdbError, NdbErrorClassification, ERROR_CONFLICT_FN_VIOLATION, ERROR_OP_AFTER_REFRESH_OP,
    NDBAPI_ERR_REFRESH_ON_BLOB_TABLE,
};
use crate::cluster::types::{CompletedOp, CustomData, OperationDef, OperationOptions};
use crate::cluster::{NdbTable, NdbTransaction};
use crate::config::ConflictRole;
use crate::core::error::ER_EXCEPTIONS_WRITE_ERROR;
use crate::core::{Error, FieldBitmap, Result, Value};
use crate::session::warning::{push_warning, Warning, WarningLevel};

/// A row found in conflict
#[derive(Debug, Clone, Copy)]
pub struct RowConflict<'a> {
    pub table: &'a Arc<NdbTable>,
    pub cfn_share: Option<&'a ConflictFnShare>,
    pub op_type: ConflictingOpType,
    pub cause: ConflictCause,
    /// Cluster error that reported the conflict, 0 when detected up front
    pub error_code: i32,
    pub old_row: Option<&'a [Value]>,
    pub new_row: Option<&'a [Value]>,
    pub write_set: Option<&'a FieldBitmap>,
    pub trans_id: u64,
}

fn exceptions_write_error(warnings: &mut Vec<Warning>, msg: String) -> Error {
    push_warning(
        warnings,
        WarningLevel::Warning,
        ER_EXCEPTIONS_WRITE_ERROR,
        format!("Write to exceptions table failed. Message: {}", msg),
    );
    Error::exceptions_write(msg)
}

/// Refresh the row and write an exception row for it
pub fn handle_row_conflict(
    applier: &mut Applier,
    trans: &mut dyn NdbTransaction,
    warnings: &mut Vec<Warning>,
    handling_type: &str,
    conflict: &RowConflict<'_>,
) -> Result<()> {
    let table = conflict.table;
    let table_name = table.name.as_str();
    let row = match conflict.op_type {
        ConflictingOpType::DeleteRow => conflict.old_row,
        _ => conflict.new_row,
    };

    let refresh = conflict.cause == ConflictCause::TransInConflict
        || conflict
            .cfn_share
            .map_or(false, |s| s.has_flag(CFF_REFRESH_ROWS));
    if refresh {
        let skip = if conflict.cause == ConflictCause::RowInConflict
            && conflict.error_code == ERROR_OP_AFTER_REFRESH_OP
        {
            // Row already refreshed in this transaction
            true
        } else if conflict.op_type == ConflictingOpType::DeleteRow
            && conflict.cause == ConflictCause::RowDoesNotExist
        {
            applier.increment_delete_delete_count();
            true
        } else {
            false
        };

        if !skip {
            let key: Vec<Value> = table
                .primary_key
                .iter()
                .map(|a| {
                    row.and_then(|r| r.get(*a as usize))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect();
            let marker: CustomData = Arc::new(ExceptionData::refresh_marker());
            let options = OperationOptions {
                any_value: Some(ANYVALUE_REFRESH_OP),
                custom_data: Some(marker),
                ..Default::default()
            };
            let op = OperationDef::refresh(Arc::clone(table), key).with_options(options);
            if let Err(err) = trans.define_operation(op) {
                if err.is_temporary() {
                    return Err(Error::from_ndb(err));
                }
                let msg = if err.code == NDBAPI_ERR_REFRESH_ON_BLOB_TABLE {
                    format!(
                        "{} conflict handling on table {} failed as table has Blobs which cannot be refreshed.",
                        handling_type, table_name
                    )
                } else {
                    format!(
                        "Row conflict handling on table {} hit Ndb error {} '{}'",
                        table_name, err.code, err.message
                    )
                };
                return Err(exceptions_write_error(warnings, msg));
            }
            tracing::debug!(table = table_name, op = %conflict.op_type, "row refresh defined");
        }
    }

    if let Some(writer) = conflict.cfn_share.and_then(ConflictFnShare::ex_writer) {
        let epoch = applier.current_epoch_state();
        let ex_row = ExceptionRow {
            own_server_id: epoch.own_server_id,
            source_server_id: epoch.source_server_id,
            source_epoch: epoch.epoch_value,
            op_type: conflict.op_type,
            cause: conflict.cause,
            trans_id: conflict.trans_id,
            old_row: conflict.old_row,
            new_row: conflict.new_row,
            write_set: conflict.write_set,
        };
        if let Err(err) = writer.write_row(trans, &ex_row) {
            if err.is_temporary() {
                return Err(Error::from_ndb(err));
            }
            let msg = format!(
                "{} conflict handling on table {} hit Ndb error {} '{}'",
                handling_type, table_name, err.code, err.message
            );
            return Err(exceptions_write_error(warnings, msg));
        }
    }
    Ok(())
}

/// Resolve the error of an operation defined under conflict detection
///
/// Returns Ok when the error is absorbed by conflict handling and the
/// original error otherwise.
pub fn handle_conflict_op_error(
    applier: &mut Applier,
    trans: &mut dyn NdbTransaction,
    warnings: &mut Vec<Warning>,
    err: &NdbError,
    op: &CompletedOp,
) -> Result<()> {
    let cause = if err.code == ERROR_CONFLICT_FN_VIOLATION || err.code == ERROR_OP_AFTER_REFRESH_OP
    {
        ConflictCause::RowInConflict
    } else {
        match err.classification {
            NdbErrorClassification::ConstraintViolation => ConflictCause::RowAlreadyExists,
            NdbErrorClassification::NoDataFound => ConflictCause::RowDoesNotExist,
            _ => return Err(Error::from_ndb(err.clone())),
        }
    };

    let data = op
        .custom_data
        .as_ref()
        .and_then(|d| d.downcast_ref::<ExceptionData>())
        .ok_or_else(|| Error::internal("conflict error on operation without exception data"))?;

    if data.op_type == ConflictingOpType::RefreshRow {
        return if err.code == ERROR_OP_AFTER_REFRESH_OP {
            Ok(())
        } else {
            Err(Error::from_ndb(err.clone()))
        };
    }

    if data.reflected {
        applier.increment_reflected_op_discard_count();
        tracing::debug!(table = %data.table_name, code = err.code, "reflected operation discarded");
        return Ok(());
    }

    let Some(share) = data.cfn_share.as_deref() else {
        return Ok(());
    };
    let def = share.def();
    if def.has_flag(CF_USE_ROLE_VAR) && applier.role() == ConflictRole::Secondary {
        // The primary resolves; the secondary applies what it is sent
        return Ok(());
    }

    if def.has_flag(CF_TRANSACTIONAL) {
        let del_del = data.op_type == ConflictingOpType::DeleteRow
            && cause == ConflictCause::RowDoesNotExist;
        if !del_del || def.has_flag(CF_DEL_DEL_CFT) {
            applier.at_trans_conflict_detected(data.trans_id)?;
        }
    }

    applier.increment_violation_count(share.fn_type());
    tracing::info!(
        table = %data.table_name,
        function = def.name,
        op = %data.op_type,
        cause = %cause,
        code = err.code,
        "conflict detected"
    );

    let Some(table) = data.table.as_ref() else {
        return Err(Error::internal("exception data without table"));
    };
    let conflict = RowConflict {
        table,
        cfn_share: Some(share),
        op_type: data.op_type,
        cause,
        error_code: err.code,
        old_row: data.old_row.as_deref(),
        new_row: data.new_row.as_deref(),
        write_set: data.write_set.as_ref(),
        trans_id: INVALID_TRANSACTION_ID,
    };
    handle_row_conflict(applier, trans, warnings, "Row", &conflict)
}
