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

//! Handler DML Tests
//!
//! Row life cycles across statements and transactions, driven through the
//! public handler API.

use std::sync::Arc;

use ndb_handler::cluster::memory::MemoryCluster;
use ndb_handler::core::{FieldType, InfoFlags, ReadFlag, SqlCommand, TableDefBuilder};
use ndb_handler::stats::InMemoryStatsPublisher;
use ndb_handler::{
    FieldBitmap, Ha, NdbShare, Row, SessionConfig, SharedSession, StatementContext, TableDef,
    ThdNdb, Value,
};

fn items_def() -> TableDef {
    TableDefBuilder::new("shop", "items")
        .add("id", FieldType::Integer)
        .add_nullable("sku", FieldType::Integer)
        .add_nullable("qty", FieldType::Integer)
        .primary_key(&["id"])
        .unique_key("uk_sku", &["sku"])
        .build()
        .expect("Failed to build table definition")
}

fn open(cluster: &MemoryCluster, session: &SharedSession) -> Ha {
    let def = items_def();
    cluster.create_table(&def).expect("Failed to create table");
    let share = Arc::new(NdbShare::new("shop", "items"));
    Ha::open(session, share, Arc::new(def)).expect("Failed to open table")
}

fn ints(values: &[i64]) -> Row {
    Row::from_values(values.iter().map(|v| Value::integer(*v)).collect())
}

fn begin(session: &SharedSession, command: SqlCommand) {
    session
        .lock()
        .start_statement(StatementContext::new(command).with_autocommit(false));
}

#[test]
fn test_row_life_cycle() {
    let cluster = MemoryCluster::new();
    let session = ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default()).into_shared();
    let mut ha = open(&cluster, &session);

    // Insert
    begin(&session, SqlCommand::Insert);
    ha.start_bulk_insert(3);
    for id in 1..=3 {
        ha.write_row(&mut ints(&[id, id * 10, 5]))
            .expect("Failed to insert row");
    }
    ha.end_bulk_insert().expect("Failed to flush inserts");
    session.lock().commit().expect("Failed to commit inserts");
    assert_eq!(cluster.row_count("shop", "items"), 3);

    // Read by primary key and update
    ha.reset();
    begin(&session, SqlCommand::Update);
    ha.set_write_set(FieldBitmap::from_bits(3, &[2]));
    ha.index_init(0, false).expect("Failed to init index");
    let mut row = Row::for_table(ha.table_def());
    ha.index_read(&mut row, &[Value::integer(2)], ReadFlag::KeyExact)
        .expect("Failed to read row 2");
    assert_eq!(row.value(1), &Value::integer(20));
    let mut changed = row.clone();
    changed.set(2, Value::integer(4)).expect("Failed to set qty");
    ha.update_row(&row, &mut changed)
        .expect("Failed to update row");
    ha.index_end().expect("Failed to end index");
    session.lock().commit().expect("Failed to commit update");
    assert_eq!(ha.rows_updated(), 1);

    let stored = cluster
        .committed_row("shop", "items", &[Value::integer(2)])
        .expect("Row 2 missing");
    assert_eq!(stored.values[2], Value::integer(4));

    // Read by position and delete
    ha.reset();
    begin(&session, SqlCommand::Delete);
    ha.rnd_init(true).expect("Failed to start scan");
    let mut first = Row::for_table(ha.table_def());
    ha.rnd_next(&mut first).expect("Failed to read first row");
    ha.position(&first);
    let pos = ha.ref_().to_vec();
    ha.rnd_end().expect("Failed to end scan");

    ha.rnd_init(false).expect("Failed to init positioned reads");
    let mut again = Row::for_table(ha.table_def());
    ha.rnd_pos(&mut again, &pos).expect("Failed to read by position");
    assert_eq!(again, first);
    ha.delete_row(&again).expect("Failed to delete row");
    ha.rnd_end().expect("Failed to end positioned reads");
    session.lock().commit().expect("Failed to commit delete");

    assert_eq!(ha.rows_deleted(), 1);
    assert_eq!(cluster.row_count("shop", "items"), 2);
}

#[test]
fn test_uncommitted_rows_counted_in_info() {
    let cluster = MemoryCluster::new();
    let session = ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default()).into_shared();
    let mut ha = open(&cluster, &session);

    begin(&session, SqlCommand::Insert);
    for id in 1..=4 {
        ha.write_row(&mut ints(&[id, id, 0]))
            .expect("Failed to insert row");
    }
    let stats = ha.info(InfoFlags::VARIABLE).expect("Failed to get info");
    assert_eq!(stats.records, 4);

    session.lock().rollback().expect("Failed to roll back");
    assert_eq!(cluster.row_count("shop", "items"), 0);
}

#[test]
fn test_commit_epochs_published() {
    let cluster = MemoryCluster::new();
    let publisher = Arc::new(InMemoryStatsPublisher::new());
    let session = ThdNdb::new(Arc::new(cluster.clone()), SessionConfig::default())
        .with_publisher(publisher.clone())
        .into_shared();
    let mut ha = open(&cluster, &session);

    let mut epochs = Vec::new();
    for id in 1..=3 {
        begin(&session, SqlCommand::Insert);
        ha.write_row(&mut ints(&[id, id, 0]))
            .expect("Failed to insert row");
        session.lock().commit().expect("Failed to commit");
        epochs.push(session.lock().last_commit_epoch());
    }

    assert!(epochs.windows(2).all(|w| w[0] <= w[1]), "Epochs went backwards: {:?}", epochs);
    assert_eq!(publisher.session_publishes(), 3);
    assert_eq!(
        publisher.session_totals().last_commit_epoch_session,
        epochs[2]
    );
}
