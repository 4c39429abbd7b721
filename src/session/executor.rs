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

//! Batch execution
//!
//! Every handler call that needs results sends the pending operations of the
//! session transaction through one of the `execute_*` functions here. They
//! keep the session counters in step, classify the errors of completed
//! operations and, in applier sessions, hand conflict errors to the conflict
//! engine.

use super::warning::{push_warning, Warning, WarningLevel};
use super::ThdNdb;
use crate::cluster::error::ERROR_OP_AFTER_REFRESH_OP;
use crate::cluster::types::{AbortOption, CompletedOp, ExecType, OpId};
use crate::cluster::{NdbError, NdbTransaction};
use crate::conflict::{handle_conflict_op_error, Applier};
use crate::core::error::{
    ER_EXCEPTIONS_WRITE_ERROR, ER_GET_ERRMSG, ER_GET_TEMPORARY_ERRMSG, HA_ERR_FIRST,
    HA_ERR_FOUND_DUPP_KEY, HA_ERR_INTERNAL_ERROR, HA_ERR_KEY_NOT_FOUND, HA_ERR_NO_CONNECTION,
    HA_ERR_NO_SUCH_TABLE, HA_ERR_TABLE_DEF_CHANGED,
};
use crate::core::{Error, Result};

/// Map a cluster error to a handler error number
///
/// Pushes a warning carrying the cluster code and message unless the error
/// is one the server reports without detail.
pub fn ndb_to_mysql_error(err: &NdbError, warnings: &mut Vec<Warning>) -> i32 {
    let code = match err.mysql_code {
        HA_ERR_NO_SUCH_TABLE | HA_ERR_KEY_NOT_FOUND => return err.mysql_code,
        -1 | 0 => {
            // Never map below the first handler error number
            if err.code < HA_ERR_FIRST {
                HA_ERR_INTERNAL_ERROR
            } else {
                err.code
            }
        }
        mapped => mapped,
    };
    if err.is_temporary() {
        push_warning(
            warnings,
            WarningLevel::Warning,
            ER_GET_TEMPORARY_ERRMSG,
            format!("Got temporary error {} '{}' from NDB", err.code, err.message),
        );
    } else {
        push_warning(
            warnings,
            WarningLevel::Warning,
            ER_GET_ERRMSG,
            format!("Got error {} '{}' from NDB", err.code, err.message),
        );
    }
    code
}

/// Handler error for a mapped cluster error
pub(crate) fn error_for_handler_code(err: &NdbError, handler_code: i32) -> Error {
    match handler_code {
        HA_ERR_KEY_NOT_FOUND => Error::KeyNotFound,
        HA_ERR_FOUND_DUPP_KEY => Error::duplicate_key(None),
        HA_ERR_TABLE_DEF_CHANGED => Error::table_def_changed(err.message.clone()),
        HA_ERR_NO_CONNECTION => Error::NoConnection(err.message.clone()),
        _ => Error::Ndb {
            code: err.code,
            handler_code,
            temporary: err.is_temporary(),
            message: err.message.clone(),
        },
    }
}

/// Check the completed operations of a commit batch
///
/// Only constraint violations and missing rows may be ignored. Returns the
/// number of ignored operations.
fn check_completed_operations(completed: &[CompletedOp]) -> Result<u32> {
    let mut ignores = 0;
    for op in completed.iter().filter(|op| op.error.is_error()) {
        if !op.error.is_ignorable() {
            return Err(Error::Cluster(op.error.clone()));
        }
        ignores += 1;
    }
    Ok(ignores)
}

/// Check the completed operations of a no-commit batch
///
/// Operations carrying conflict data have their errors resolved by the
/// conflict engine, which may define refresh and exception operations. Those
/// are executed here and their failures turn into an exceptions write error.
fn check_completed_operations_pre_commit(
    trans: &mut dyn NdbTransaction,
    applier: Option<&mut Applier>,
    warnings: &mut Vec<Warning>,
    force_send: bool,
) -> Result<u32> {
    let last_user_op = trans.last_defined_operation();
    let mut applier = applier;
    let mut ignores = 0;

    for op in trans.completed_operations() {
        let err = &op.error;
        if !err.is_error() {
            continue;
        }
        if op.custom_data.is_none() {
            if !err.is_ignorable() {
                return Err(Error::Cluster(err.clone()));
            }
        } else {
            let applier = applier
                .as_deref_mut()
                .ok_or_else(|| Error::internal("conflict data on operation outside applier"))?;
            handle_conflict_op_error(applier, trans, warnings, err, &op)?;
        }
        ignores += 1;
    }

    if trans.last_defined_operation() == last_user_op {
        return Ok(ignores);
    }

    // Conflict handling defined operations of its own
    let non_masked = match trans.execute(ExecType::NoCommit, AbortOption::IgnoreError, force_send) {
        Err(err) => Some(err),
        Ok(()) if trans.error().is_error() => {
            let first_extra = last_user_op.map_or(0, |OpId(id)| id);
            trans.completed_operations().into_iter().find_map(|op| {
                let extra = op.id.0 > first_extra;
                (extra && op.error.is_error() && op.error.code != ERROR_OP_AFTER_REFRESH_OP)
                    .then_some(op.error)
            })
        }
        Ok(()) => None,
    };

    if let Some(err) = non_masked {
        if err.is_temporary() {
            return Err(Error::Cluster(err));
        }
        ndb_to_mysql_error(&err, warnings);
        let msg = "Failed executing extra operations for conflict handling";
        push_warning(warnings, WarningLevel::Warning, ER_EXCEPTIONS_WRITE_ERROR, msg);
        return Err(Error::exceptions_write(msg));
    }
    Ok(ignores)
}

impl ThdNdb {
    /// Send pending operations without committing
    ///
    /// With `ignore_no_key` constraint violations and missing rows do not
    /// fail the batch; the number of such operations is returned.
    pub fn execute_no_commit(&mut self, ignore_no_key: bool) -> Result<u32> {
        let force_send = self.config.force_send;
        let result = self.execute_no_commit_inner(ignore_no_key, force_send);
        if result.is_err() {
            if let Some(applier) = self.applier.as_mut() {
                applier.at_transaction_abort();
            }
        }
        result
    }

    fn execute_no_commit_inner(&mut self, ignore_no_key: bool, force_send: bool) -> Result<u32> {
        let ThdNdb {
            trans,
            applier,
            warnings,
            counters,
            unsent_bytes,
            unsent_blob_ops,
            ..
        } = self;
        let trans = trans
            .as_deref_mut()
            .ok_or_else(|| Error::internal("execute without transaction"))?;

        trans.release_completed_operations();
        counters.execute_count += 1;
        *unsent_bytes = 0;
        *unsent_blob_ops = false;

        trans
            .execute(ExecType::NoCommit, AbortOption::IgnoreError, force_send)
            .map_err(Error::Cluster)?;

        let trans_err = trans.error();
        if !ignore_no_key || !trans_err.is_error() {
            return if trans_err.is_error() {
                Err(Error::Cluster(trans_err))
            } else {
                Ok(0)
            };
        }
        check_completed_operations_pre_commit(trans, applier.as_mut(), warnings, force_send)
    }

    /// Commit the transaction
    ///
    /// Unsent operations are aborted on error unless `ignore_error` is set,
    /// in which case ignorable errors are counted and returned.
    pub fn execute_commit(&mut self, force_send: bool, ignore_error: bool) -> Result<u32> {
        let result = self.execute_commit_inner(force_send, ignore_error);
        match &result {
            Ok(_) => {
                if let Some(gci) = self.trans.as_deref().and_then(|t| t.gci()) {
                    if gci != 0 {
                        let last = &mut self.counters.last_commit_epoch_session;
                        *last = (*last).max(gci);
                    }
                }
                let epoch = self.counters.last_commit_epoch_session;
                if let Some(applier) = self.applier.as_mut() {
                    applier.at_transaction_commit(epoch);
                }
            }
            Err(_) => {
                if let Some(applier) = self.applier.as_mut() {
                    applier.at_transaction_abort();
                }
            }
        }
        result
    }

    fn execute_commit_inner(&mut self, force_send: bool, ignore_error: bool) -> Result<u32> {
        let abort_option = if self.unsent_bytes > 0 && !ignore_error {
            AbortOption::AbortOnError
        } else {
            AbortOption::IgnoreError
        };
        let ThdNdb {
            trans,
            counters,
            unsent_bytes,
            unsent_blob_ops,
            ..
        } = self;
        let trans = trans
            .as_deref_mut()
            .ok_or_else(|| Error::internal("commit without transaction"))?;

        let already_completed = trans.completed_operations().len();
        counters.execute_count += 1;
        *unsent_bytes = 0;
        *unsent_blob_ops = false;

        trans
            .execute(ExecType::Commit, abort_option, force_send)
            .map_err(Error::Cluster)?;

        let trans_err = trans.error();
        if !ignore_error || !trans_err.is_error() {
            return if trans_err.is_error() {
                Err(Error::Cluster(trans_err))
            } else {
                Ok(0)
            };
        }
        let completed = trans.completed_operations();
        check_completed_operations(completed.get(already_completed..).unwrap_or(&[]))
    }

    /// Send pending operations, ignoring their errors
    ///
    /// Used when the statement inspects completed operations itself.
    pub fn execute_no_commit_ie(&mut self) -> Result<()> {
        let force_send = self.config.force_send;
        let ThdNdb {
            trans,
            counters,
            unsent_bytes,
            unsent_blob_ops,
            ..
        } = self;
        let trans = trans
            .as_deref_mut()
            .ok_or_else(|| Error::internal("execute without transaction"))?;
        trans.release_completed_operations();
        let result = trans.execute(ExecType::NoCommit, AbortOption::IgnoreError, force_send);
        *unsent_bytes = 0;
        counters.execute_count += 1;
        *unsent_blob_ops = false;
        result.map_err(Error::Cluster)
    }

    /// Map an error raised by the session to the error reported to the server
    ///
    /// Raw cluster errors are converted through [`ndb_to_mysql_error`],
    /// which records the cluster detail as a session warning.
    pub fn map_error(&mut self, err: Error) -> Error {
        match err {
            Error::Cluster(ndb) => {
                let code = ndb_to_mysql_error(&ndb, &mut self.warnings);
                error_for_handler_code(&ndb, code)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::error::{NdbErrorClassification, NdbErrorStatus};
    use crate::cluster::memory::MemoryCluster;
    use crate::cluster::types::{KeyAccess, OperationDef};
    use crate::cluster::NdbTable;
    use crate::config::SessionConfig;
    use crate::core::{FieldType, TableDefBuilder, Value};

    fn setup() -> (MemoryCluster, Arc<NdbTable>, ThdNdb) {
        let cluster = MemoryCluster::new();
        let def = TableDefBuilder::new("test", "t")
            .add("id", FieldType::Integer)
            .add_nullable("v", FieldType::Integer)
            .primary_key(&["id"])
            .build()
            .unwrap();
        let table = cluster.create_table(&def).unwrap();
        let thd = ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default());
        (cluster, table, thd)
    }

    fn insert(table: &Arc<NdbTable>, id: i64) -> OperationDef {
        OperationDef::insert(
            Arc::clone(table),
            vec![Value::integer(id)],
            vec![(0, Value::integer(id)), (1, Value::integer(id * 10))],
        )
    }

    #[test]
    fn test_ndb_to_mysql_error_mapping() {
        let mut warnings = Vec::new();
        assert_eq!(
            ndb_to_mysql_error(&NdbError::no_data_found(), &mut warnings),
            HA_ERR_KEY_NOT_FOUND
        );
        assert!(warnings.is_empty());

        let unmapped = NdbError::new(
            4000,
            -1,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::InternalError,
            "boom",
        );
        assert_eq!(ndb_to_mysql_error(&unmapped, &mut warnings), 4000);
        assert_eq!(warnings[0].code, ER_GET_ERRMSG);
        assert_eq!(warnings[0].message, "Got error 4000 'boom' from NDB");

        let low = NdbError::new(
            99,
            0,
            NdbErrorStatus::PermanentError,
            NdbErrorClassification::InternalError,
            "low",
        );
        assert_eq!(ndb_to_mysql_error(&low, &mut warnings), HA_ERR_INTERNAL_ERROR);

        ndb_to_mysql_error(&NdbError::timeout(), &mut warnings);
        assert_eq!(warnings[2].code, ER_GET_TEMPORARY_ERRMSG);
        assert!(warnings[2].message.starts_with("Got temporary error 266"));
    }

    #[test]
    fn test_execute_no_commit_counts_and_resets() {
        let (_, table, mut thd) = setup();
        thd.acquire_transaction(None).unwrap().define_operation(insert(&table, 1)).unwrap();
        thd.add_row_check_if_batch_full(64);
        thd.unsent_blob_ops = true;

        assert_eq!(thd.execute_no_commit(false).unwrap(), 0);
        assert_eq!(thd.counters().execute_count, 1);
        assert_eq!(thd.unsent_bytes(), 0);
        assert!(!thd.has_unsent_blob_ops());
    }

    #[test]
    fn test_execute_no_commit_ignores_duplicates() {
        let (cluster, table, mut thd) = setup();
        cluster.load_row(&table, vec![Value::integer(1), Value::integer(1)], 1, 0);
        let trans = thd.acquire_transaction(None).unwrap();
        trans.define_operation(insert(&table, 1)).unwrap();
        trans.define_operation(insert(&table, 2)).unwrap();

        assert_eq!(thd.execute_no_commit(true).unwrap(), 1);
    }

    #[test]
    fn test_execute_no_commit_reports_error() {
        let (cluster, table, mut thd) = setup();
        cluster.load_row(&table, vec![Value::integer(1), Value::integer(1)], 1, 0);
        thd.acquire_transaction(None).unwrap().define_operation(insert(&table, 1)).unwrap();

        let err = thd.execute_no_commit(false).unwrap_err();
        let mapped = thd.map_error(err);
        assert!(mapped.is_duplicate_key());
    }

    #[test]
    fn test_execute_no_commit_fails_non_ignorable() {
        let (cluster, table, mut thd) = setup();
        cluster.fail_operation_on_key("test", "t", vec![Value::integer(3)], NdbError::timeout());
        thd.acquire_transaction(None).unwrap().define_operation(insert(&table, 3)).unwrap();

        let err = thd.execute_no_commit(true).unwrap_err();
        assert!(err.is_temporary());
    }

    #[test]
    fn test_execute_commit_records_epoch() {
        let (cluster, table, mut thd) = setup();
        thd.acquire_transaction(None).unwrap().define_operation(insert(&table, 1)).unwrap();
        thd.add_row_check_if_batch_full(10);

        assert_eq!(thd.execute_commit(false, false).unwrap(), 0);
        assert!(thd.last_commit_epoch() > 0);
        assert!(thd.last_commit_epoch() <= cluster.current_epoch());
        assert_eq!(cluster.row_count("test", "t"), 1);
    }

    #[test]
    fn test_execute_commit_ignores_only_new_operations() {
        let (cluster, table, mut thd) = setup();
        cluster.load_row(&table, vec![Value::integer(1), Value::integer(1)], 1, 0);
        let trans = thd.acquire_transaction(None).unwrap();
        trans.define_operation(insert(&table, 1)).unwrap();
        thd.execute_no_commit_ie().unwrap();

        let key = vec![Value::integer(9)];
        let del = OperationDef::delete(Arc::clone(&table), KeyAccess::PrimaryKey, key);
        thd.transaction().unwrap().define_operation(del).unwrap();
        assert_eq!(thd.execute_commit(false, true).unwrap(), 1);
    }

    #[test]
    fn test_execute_commit_injected_failure() {
        let (cluster, table, mut thd) = setup();
        thd.acquire_transaction(None).unwrap().define_operation(insert(&table, 1)).unwrap();
        cluster.fail_next_execute(NdbError::timeout());

        let err = thd.commit().unwrap_err();
        assert!(err.is_temporary());
        assert!(!thd.has_transaction());
        assert_eq!(thd.warnings()[0].code, ER_GET_TEMPORARY_ERRMSG);
        assert_eq!(cluster.row_count("test", "t"), 0);
    }
}
