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

//! Conflict detection setup for rows applied by a replication applier

use std::sync::Arc;

use super::Ha;
use crate::cluster::{CustomData, OperationOptions};
use crate::config::ConflictRole;
use crate::conflict::any_value::set_reflect_op;
use crate::conflict::extra_row_info::{CFT_READ_OP, CFT_REFLECT_OP, CFT_REFRESH_OP};
use crate::conflict::function::{
    CF_REFLECT_SEC_OPS, CF_TRANSACTIONAL, CF_USE_INTERP_WRITE, CF_USE_ROLE_VAR,
};
use crate::conflict::{
    handle_row_conflict, ConflictCause, ConflictingOpType, ExceptionData, ExtraRowInfo,
    RowConflict, RowImages, INVALID_TRANSACTION_ID, OPS_DEFINED,
};
use crate::core::{Error, Result, Row, Value};
use crate::session::ThdNdb;

impl Ha {
    /// Row images indexed by attribute, hidden key included
    fn conflict_image(&self, row: Option<&Row>) -> Option<Vec<Value>> {
        let hidden = self
            .table
            .hidden_key
            .zip(self.hidden_key_value.as_ref());
        row.map(|r| self.column_map.attr_image(r, hidden))
    }

    /// Prepare conflict detection for an applied row operation
    ///
    /// May attach an interpreted program and exception data to `options`,
    /// and may switch the operation between write-tuple and its natural
    /// kind through `avoid_write`. Returns true when the row was handled
    /// up front (refreshed because its transaction is in conflict) and no
    /// operation must be defined for it.
    pub(crate) fn prepare_conflict_detection(
        &self,
        thd: &mut ThdNdb,
        op_type: ConflictingOpType,
        old_row: Option<&Row>,
        new_row: Option<&Row>,
        options: &mut OperationOptions,
        avoid_write: &mut bool,
    ) -> Result<bool> {
        let Some(cfn_share) = self.share.conflict_fn() else {
            return Ok(false);
        };
        let Some(applier) = thd.get_applier() else {
            return Ok(false);
        };
        let def = cfn_share.def();

        let info = applier.extra_row_info().map(ExtraRowInfo::load).transpose()?;
        let trans_id = info.map_or(INVALID_TRANSACTION_ID, |i| i.transaction_id());
        let cft_flags = info.map_or(0, |i| i.conflict_flags());
        let role = applier.role();

        if def.has_flag(CF_TRANSACTIONAL) && trans_id == INVALID_TRANSACTION_ID {
            tracing::error!(table = %self.table.name, function = def.name, "row event without transaction id");
            return Err(Error::replica_corrupt_event(format!(
                "Conflict detection function {} on table {} requires a transaction id, \
                 the row event has none",
                def.name, self.table_def.name
            )));
        }

        if op_type == ConflictingOpType::WriteRow && !def.has_flag(CF_USE_INTERP_WRITE) {
            // Without a guarded write an existing row must fail the insert
            *avoid_write = true;
        }

        if def.has_flag(CF_USE_ROLE_VAR) {
            match role {
                ConflictRole::None => {
                    return Err(Error::replica_configuration(format!(
                        "Conflict function {} on table {} requires the replica conflict role \
                         to be set",
                        def.name, self.table_def.name
                    )));
                }
                ConflictRole::Pass => return Ok(false),
                ConflictRole::Secondary => {
                    let reflect = def.has_flag(CF_REFLECT_SEC_OPS);
                    prepare_secondary(thd, op_type, cft_flags, reflect, options, avoid_write);
                    return Ok(false);
                }
                ConflictRole::Primary => {}
            }
        }

        let read_mask = self.column_map.attr_mask(&self.read_set);
        let write_mask = self.column_map.attr_mask(&self.write_set);
        let old_image = self.conflict_image(old_row);
        let new_image = self.conflict_image(new_row);

        if def.has_flag(CF_TRANSACTIONAL) {
            let ThdNdb {
                applier,
                trans,
                warnings,
                ..
            } = thd;
            let applier = applier
                .as_mut()
                .ok_or_else(|| Error::internal("applier vanished"))?;
            if applier.at_prepare_conflict_detection(&self.table.name, trans_id) {
                let trans = trans
                    .as_deref_mut()
                    .ok_or_else(|| Error::internal("no transaction for conflict handling"))?;
                let conflict = RowConflict {
                    table: &self.table,
                    cfn_share: Some(cfn_share.as_ref()),
                    op_type,
                    cause: ConflictCause::TransInConflict,
                    error_code: 0,
                    old_row: old_image.as_deref(),
                    new_row: new_image.as_deref(),
                    write_set: Some(&write_mask),
                    trans_id,
                };
                handle_row_conflict(applier, trans, warnings, "Transaction", &conflict)?;
                return Ok(true);
            }
        }

        let reflected = cft_flags & CFT_REFLECT_OP != 0;
        let op_type = if cft_flags & CFT_READ_OP != 0 {
            ConflictingOpType::ReadRow
        } else {
            op_type
        };

        if !reflected {
            let max_rep_epoch = thd.get_applier().map_or(0, |a| a.max_rep_epoch());
            let images = RowImages {
                old_row: old_image.as_deref(),
                new_row: new_image.as_deref(),
                read_set: &read_mask,
                write_set: &write_mask,
            };
            let code = cfn_share.prepare_program(op_type, &images, max_rep_epoch)?;
            if code.words_used() > 0 {
                options.interpreted_code = Some(Arc::new(code));
            }
        }

        let data = ExceptionData {
            table: Some(Arc::clone(&self.table)),
            table_name: self.table_def.name.clone(),
            cfn_share: Some(Arc::clone(&cfn_share)),
            op_type,
            reflected,
            trans_id,
            old_row: old_image.map(Arc::from),
            new_row: new_image.map(Arc::from),
            write_set: Some(write_mask),
        };
        let size = data.byte_size();
        let custom: CustomData = Arc::new(data);
        options.custom_data = Some(thd.arena.park(custom, size)?);

        if let Some(applier) = thd.get_applier_mut() {
            if reflected {
                applier.increment_reflected_op_prepare_count();
            }
            applier.set_flag(OPS_DEFINED);
        }
        tracing::trace!(table = %self.table.name, op = %op_type, reflected, trans_id, "conflict detection prepared");
        Ok(false)
    }
}

/// The secondary applies what the primary sends and reflects its own ops
///
/// Writes and updates become write-tuple so the row converges on the
/// primary's image; no program guards them.
fn prepare_secondary(
    thd: &mut ThdNdb,
    op_type: ConflictingOpType,
    cft_flags: u16,
    reflect: bool,
    options: &mut OperationOptions,
    avoid_write: &mut bool,
) {
    if op_type != ConflictingOpType::DeleteRow {
        *avoid_write = false;
    }
    let Some(applier) = thd.get_applier_mut() else {
        return;
    };
    if cft_flags & CFT_REFRESH_OP != 0 {
        applier.increment_refresh_op_count();
        return;
    }
    if reflect {
        let any_value = options
            .any_value
            .get_or_insert(applier.row_event_server_id());
        set_reflect_op(any_value);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::config::SessionConfig;
    use crate::conflict::extra_row_info::ExtraRowInfo;
    use crate::conflict::{Applier, ConflictFnShare};
    use crate::core::SqlCommand;
    use crate::session::ThdNdb;

    fn applier_fixture(spec: &str, role: ConflictRole) -> (MemoryCluster, crate::session::SharedSession, Ha) {
        let cluster = MemoryCluster::new();
        let session = ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default())
            .with_applier(Applier::new("chan", 1).with_role(role))
            .into_shared();
        let ha = open(&cluster, &session, &simple_def());
        let cfn = ConflictFnShare::setup(ha.table(), spec, None).unwrap();
        ha.share().set_conflict_fn(Some(Arc::new(cfn)));
        statement(&session, SqlCommand::Update);
        (cluster, session, ha)
    }

    #[test]
    fn test_missing_transaction_id_is_fatal() {
        let (_, session, ha) = applier_fixture("NDB$EPOCH_TRANS()", ConflictRole::Primary);
        let mut thd = session.lock();
        thd.get_applier_mut().unwrap().set_row_event(2, None);
        let mut options = OperationOptions::default();
        let mut avoid_write = true;
        let r = row(&[1, 1, 1]);
        let err = ha
            .prepare_conflict_detection(
                &mut thd,
                ConflictingOpType::UpdateRow,
                Some(&r),
                Some(&r),
                &mut options,
                &mut avoid_write,
            )
            .unwrap_err();
        assert!(matches!(err, Error::ReplicaCorruptEvent(_)));
    }

    #[test]
    fn test_role_not_set_is_configuration_error() {
        let (_, session, ha) = applier_fixture("NDB$EPOCH2()", ConflictRole::None);
        let mut thd = session.lock();
        let mut options = OperationOptions::default();
        let mut avoid_write = true;
        let r = row(&[1, 1, 1]);
        let err = ha
            .prepare_conflict_detection(
                &mut thd,
                ConflictingOpType::UpdateRow,
                None,
                Some(&r),
                &mut options,
                &mut avoid_write,
            )
            .unwrap_err();
        assert!(matches!(err, Error::ReplicaConfiguration(_)));
    }

    #[test]
    fn test_pass_role_skips_detection() {
        let (_, session, ha) = applier_fixture("NDB$EPOCH2()", ConflictRole::Pass);
        let mut thd = session.lock();
        let mut options = OperationOptions::default();
        let mut avoid_write = true;
        let r = row(&[1, 1, 1]);
        let handled = ha
            .prepare_conflict_detection(
                &mut thd,
                ConflictingOpType::UpdateRow,
                Some(&r),
                Some(&r),
                &mut options,
                &mut avoid_write,
            )
            .unwrap();
        assert!(!handled);
        assert!(options.interpreted_code.is_none());
        assert!(options.custom_data.is_none());
    }

    #[test]
    fn test_epoch_attaches_program_and_exception_data() {
        let (_, session, ha) = applier_fixture("NDB$EPOCH()", ConflictRole::Primary);
        let mut thd = session.lock();
        thd.get_applier_mut().unwrap().set_row_event(2, None);
        let mut options = OperationOptions::default();
        let mut avoid_write = true;
        let r = row(&[1, 1, 1]);
        let handled = ha
            .prepare_conflict_detection(
                &mut thd,
                ConflictingOpType::UpdateRow,
                Some(&r),
                Some(&r),
                &mut options,
                &mut avoid_write,
            )
            .unwrap();
        assert!(!handled);
        assert!(options.interpreted_code.is_some());
        let data = options
            .custom_data
            .as_ref()
            .and_then(|d| d.downcast_ref::<ExceptionData>())
            .unwrap();
        assert_eq!(data.op_type, ConflictingOpType::UpdateRow);
        assert!(!data.reflected);
        assert!(thd.get_applier().unwrap().has_flag(OPS_DEFINED));
    }

    #[test]
    fn test_secondary_reflects_operations() {
        let (_, session, ha) = applier_fixture("NDB$EPOCH2()", ConflictRole::Secondary);
        let mut thd = session.lock();
        thd.get_applier_mut().unwrap().set_row_event(2, None);
        let mut options = OperationOptions::default();
        let mut avoid_write = true;
        let r = row(&[1, 1, 1]);
        ha.prepare_conflict_detection(
            &mut thd,
            ConflictingOpType::UpdateRow,
            Some(&r),
            Some(&r),
            &mut options,
            &mut avoid_write,
        )
        .unwrap();
        assert!(!avoid_write);
        assert!(options.interpreted_code.is_none());
        let any_value = options.any_value.unwrap();
        assert!(crate::conflict::any_value::is_reflect_op(any_value));
    }

    #[test]
    fn test_reflected_op_on_primary_is_counted() {
        let (_, session, ha) = applier_fixture("NDB$EPOCH2()", ConflictRole::Primary);
        let mut thd = session.lock();
        let info = ExtraRowInfo::new().with_conflict_flags(CFT_REFLECT_OP).to_bytes();
        thd.get_applier_mut().unwrap().set_row_event(2, Some(info));
        let mut options = OperationOptions::default();
        let mut avoid_write = true;
        let r = row(&[1, 1, 1]);
        ha.prepare_conflict_detection(
            &mut thd,
            ConflictingOpType::UpdateRow,
            Some(&r),
            Some(&r),
            &mut options,
            &mut avoid_write,
        )
        .unwrap();
        assert!(options.interpreted_code.is_none());
        assert_eq!(
            thd.get_applier().unwrap().counters().reflected_op_prepare_count,
            1
        );
    }
}
