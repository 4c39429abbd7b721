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

//! End-to-end DML scenarios
//!
//! Each test drives a handler the way the server would for one statement
//! and checks what reached the in-memory cluster.

use std::sync::Arc;

use ndb_handler::cluster::memory::MemoryCluster;
use ndb_handler::cluster::{ExecType, ExtraColumn, OperationKind, SetValue};
use ndb_handler::conflict::extra_row_info::ExtraRowInfo;
use ndb_handler::conflict::ConflictFnShare;
use ndb_handler::core::{FieldType, SqlCommand, TableDefBuilder, ThrLockType};
use ndb_handler::{
    Applier, ConflictRole, Error, FieldBitmap, Ha, NdbShare, Row, SessionConfig, SharedSession,
    StatementContext, TableDef, ThdNdb, Value,
};

fn new_session(cluster: &MemoryCluster) -> SharedSession {
    ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default()).into_shared()
}

fn open_table(cluster: &MemoryCluster, session: &SharedSession, def: &TableDef) -> Ha {
    cluster.create_table(def).expect("Failed to create table");
    open_existing(session, def)
}

fn open_existing(session: &SharedSession, def: &TableDef) -> Ha {
    let share = Arc::new(NdbShare::new(def.db.clone(), def.name.clone()));
    Ha::open(session, share, Arc::new(def.clone())).expect("Failed to open table")
}

/// `t(id PK, u UNIQUE, v)`
fn keyed_def() -> TableDef {
    TableDefBuilder::new("test", "t")
        .add("id", FieldType::Integer)
        .add_nullable("u", FieldType::Integer)
        .add_nullable("v", FieldType::Integer)
        .primary_key(&["id"])
        .unique_key("uk_u", &["u"])
        .build()
        .expect("Failed to build table definition")
}

fn ints(values: &[i64]) -> Row {
    Row::from_values(values.iter().map(|v| Value::integer(*v)).collect())
}

fn load(cluster: &MemoryCluster, ha: &Ha, rows: i64) {
    for id in 1..=rows {
        cluster.load_row(
            ha.table(),
            vec![Value::integer(id), Value::integer(id * 10), Value::integer(id * 100)],
            1,
            0,
        );
    }
}

fn begin(session: &SharedSession, command: SqlCommand, autocommit: bool) {
    session
        .lock()
        .start_statement(StatementContext::new(command).with_autocommit(autocommit));
}

// ─── Inserts ───────────────────────────────────────────────────────

#[test_log::test]
fn test_autocommit_insert_hidden_primary_key() {
    let cluster = MemoryCluster::new();
    let session = new_session(&cluster);
    let def = TableDefBuilder::new("test", "h")
        .add_nullable("a", FieldType::Integer)
        .build()
        .expect("Failed to build table definition");
    let mut ha = open_table(&cluster, &session, &def);

    begin(&session, SqlCommand::Insert, true);
    ha.write_row(&mut ints(&[42])).expect("Failed to insert row");
    session.lock().commit().expect("Failed to commit");

    let executes = cluster.execute_log();
    assert_eq!(executes.len(), 1, "Expected a single execute");
    assert_eq!(executes[0].exec_type, ExecType::Commit);
    assert_eq!(session.lock().counters().execute_count, 1);
    assert_eq!(ha.rows_updated(), 0);

    let hidden = ha.table().hidden_key.expect("Hidden key attribute missing");
    let ops = cluster.operation_log();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OperationKind::Insert);
    assert!(ops[0].set_values.contains(&SetValue {
        column: ExtraColumn::Attr(hidden),
        value: Value::unsigned(1),
    }));
    assert_eq!(cluster.row_count("test", "h"), 1);
}

#[test]
fn test_insert_ignore_reports_colliding_key() {
    let cluster = MemoryCluster::new();
    let session = new_session(&cluster);
    let mut ha = open_table(&cluster, &session, &keyed_def());
    load(&cluster, &ha, 1);
    cluster.clear_logs();

    begin(&session, SqlCommand::Insert, false);
    ha.extra(ndb_handler::core::ExtraOption::IgnoreDupKey);

    // Both the primary key and the unique key are taken
    let err = ha.write_row(&mut ints(&[1, 10, 0])).unwrap_err();
    assert_eq!(err, Error::duplicate_key(Some(0)));
    assert_eq!(ha.dupkey(), ha.table_def().primary_key);
    let reads = cluster
        .operation_log()
        .iter()
        .filter(|op| op.kind == OperationKind::Read)
        .count();
    assert_eq!(reads, 2, "Expected one read per key");

    // Only the unique key is taken
    let err = ha.write_row(&mut ints(&[2, 10, 0])).unwrap_err();
    assert_eq!(err, Error::duplicate_key(Some(1)));
    assert_eq!(ha.dupkey(), Some(1));
}

// ─── Updates ───────────────────────────────────────────────────────

#[test_log::test]
fn test_primary_key_update_rolls_back_failed_insert() {
    let cluster = MemoryCluster::new();
    let session = new_session(&cluster);
    let mut ha = open_table(&cluster, &session, &keyed_def());
    load(&cluster, &ha, 2);
    cluster.clear_logs();

    begin(&session, SqlCommand::Update, false);
    let write_set = FieldBitmap::from_bits(3, &[0]);
    ha.set_write_set(write_set.clone());

    let err = ha
        .update_row(&ints(&[1, 10, 100]), &mut ints(&[2, 10, 100]))
        .unwrap_err();
    assert!(err.is_duplicate_key(), "Expected duplicate key, got {:?}", err);
    assert_eq!(ha.write_set(), &write_set);

    let ops = cluster.operation_log();
    let kinds: Vec<_> = ops.iter().map(|op| op.kind).collect();
    assert_eq!(kinds, vec![OperationKind::Delete, OperationKind::Insert]);
    assert_eq!(ops[0].transaction, ops[1].transaction);

    let executes = cluster.execute_log();
    assert_eq!(executes.last().map(|e| e.exec_type), Some(ExecType::Rollback));
    let thd = session.lock();
    assert_eq!(thd.unsent_bytes(), 0);
    assert!(!thd.has_unsent_blob_ops());
    drop(thd);

    assert!(cluster
        .committed_row("test", "t", &[Value::integer(1)])
        .is_some());
}

// ─── Scans ─────────────────────────────────────────────────────────

#[test]
fn test_select_for_update_takes_over_every_row_lock() {
    let cluster = MemoryCluster::new();
    let session = new_session(&cluster);
    let mut ha = open_table(&cluster, &session, &keyed_def());
    load(&cluster, &ha, 3);
    cluster.clear_logs();

    begin(&session, SqlCommand::Select, false);
    ha.store_lock(ThrLockType::Write);
    ha.external_lock(ThrLockType::WriteAllowWrite)
        .expect("Failed to lock table");
    ha.index_init(1, true).expect("Failed to init index");

    let mut row = Row::for_table(ha.table_def());
    let mut fetched = 0;
    let mut result = ha.index_first(&mut row);
    while result.is_ok() {
        fetched += 1;
        assert!(ha.has_pending_row_lock());
        result = ha.index_next(&mut row);
        if fetched == 2 {
            // Two rows taken over so far, each worth one operation
            assert_eq!(session.lock().unsent_bytes(), 24);
        }
    }
    assert_eq!(result.unwrap_err(), Error::EndOfFile);
    ha.index_end().expect("Failed to close scan");

    assert_eq!(fetched, 3);
    let takeovers = cluster
        .operation_log()
        .iter()
        .filter(|op| op.kind == OperationKind::LockCurrent)
        .count();
    assert_eq!(takeovers, 3);
    assert_eq!(ha.rows_updated(), 0);
    session.lock().commit().expect("Failed to commit");
}

#[test]
fn test_copying_alter_fails_on_concurrent_commit() {
    let cluster = MemoryCluster::with_scan_batch(2);
    let session = new_session(&cluster);
    let mut source = open_table(&cluster, &session, &keyed_def());
    load(&cluster, &source, 3);

    begin(&session, SqlCommand::AlterTable, false);
    source.rnd_init(true).expect("Failed to start scan");
    let mut row = Row::for_table(source.table_def());
    source.rnd_next(&mut row).expect("Failed to read first row");

    let other = new_session(&cluster);
    let mut writer = open_existing(&other, &keyed_def());
    begin(&other, SqlCommand::Insert, true);
    writer
        .external_lock(ThrLockType::WriteAllowWrite)
        .expect("Failed to lock table");
    writer
        .write_row(&mut ints(&[9, 90, 900]))
        .expect("Failed to insert row");
    other.lock().commit().expect("Failed to commit");

    let mut result = Ok(());
    while result.is_ok() {
        result = source.rnd_next(&mut row);
    }
    let err = result.unwrap_err();
    assert!(
        matches!(err, Error::CopyingAlterConflict { .. }),
        "Expected copy conflict, got {:?}",
        err
    );
}

// ─── Replication ───────────────────────────────────────────────────

#[test_log::test]
fn test_applier_refreshes_row_of_transaction_in_conflict() {
    let cluster = MemoryCluster::new();
    let base = TableDefBuilder::new("test", "t")
        .add("id", FieldType::Integer)
        .add_nullable("v", FieldType::Integer)
        .primary_key(&["id"])
        .build()
        .expect("Failed to build table definition");
    let exceptions = TableDefBuilder::new("test", "t$EX")
        .add("NDB$server_id", FieldType::Integer)
        .add("NDB$master_server_id", FieldType::Integer)
        .add("NDB$master_epoch", FieldType::Integer)
        .add("NDB$count", FieldType::Integer)
        .add_nullable("NDB$OP_TYPE", FieldType::Integer)
        .add_nullable("NDB$CFT_CAUSE", FieldType::Integer)
        .add_nullable("NDB$ORIG_TRANSID", FieldType::Integer)
        .add("id", FieldType::Integer)
        .add_nullable("v$old", FieldType::Integer)
        .add_nullable("v$new", FieldType::Integer)
        .primary_key(&[
            "NDB$server_id",
            "NDB$master_server_id",
            "NDB$master_epoch",
            "NDB$count",
        ])
        .build()
        .expect("Failed to build exceptions table definition");
    let ex_table = cluster
        .create_table(&exceptions)
        .expect("Failed to create exceptions table");
    let ex_name = ex_table.name.clone();

    let session = ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default())
        .with_applier(Applier::new("chan", 1).with_role(ConflictRole::Primary))
        .into_shared();
    let mut ha = open_table(&cluster, &session, &base);
    cluster.load_row(ha.table(), vec![Value::integer(1), Value::integer(5)], 1, 0);
    let cfn = ConflictFnShare::setup(ha.table(), "NDB$EPOCH2_TRANS()", Some(ex_table))
        .expect("Failed to set up conflict function");
    ha.share().set_conflict_fn(Some(Arc::new(cfn)));
    cluster.clear_logs();

    begin(&session, SqlCommand::Update, false);
    {
        let mut thd = session.lock();
        let applier = thd.get_applier_mut().expect("Session is not an applier");
        let info = ExtraRowInfo::new().with_transaction_id(42).to_bytes();
        applier.set_row_event(2, Some(info));
        // An earlier row of transaction 42 already conflicted
        applier.mark_transaction_in_conflict(42);
    }

    ha.set_write_set(FieldBitmap::from_bits(2, &[1]));
    ha.update_row(&ints(&[1, 5]), &mut ints(&[1, 6]))
        .expect("Failed to apply row");

    let ops = cluster.operation_log();
    assert!(ops.iter().all(|op| op.kind != OperationKind::Update));
    assert!(ops
        .iter()
        .any(|op| op.kind == OperationKind::Refresh && op.key == vec![Value::integer(1)]));
    assert!(ops
        .iter()
        .any(|op| op.kind == OperationKind::Insert && op.table == ex_name));

    let thd = session.lock();
    let counters = thd.get_applier().expect("Session is not an applier").counters();
    assert_eq!(counters.reflected_op_prepare_count, 0);
    assert_eq!(counters.trans_reject_count, 1);
    assert_eq!(counters.trans_row_reject_count, 1);
}
