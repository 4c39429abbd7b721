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

//! Exception snapshots and the exceptions table writer
//!
//! An exceptions table starts with four mandatory key columns
//! (`server_id`, `master_server_id`, `master_epoch`, `count`), optionally
//! followed by `NDB$OP_TYPE`, `NDB$CFT_CAUSE` and `NDB$ORIG_TRANSID`. Every
//! other column names a column of the base table, optionally suffixed with
//! `$old` or `$new` to select the before or after image.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::extra_row_info::INVALID_TRANSACTION_ID;
use super::function::ConflictFnShare;
use super::{ConflictCause, ConflictingOpType};
use crate::cluster::error::NdbError;
use crate::cluster::types::{AttrId, OperationDef};
use crate::cluster::{NdbTable, NdbTransaction};
use crate::core::{Error, FieldBitmap, Result, Value};

const MANDATORY_COLUMNS: [&str; 4] = ["server_id", "master_server_id", "master_epoch", "count"];

/// Snapshot attached to an operation defined under conflict detection
///
/// Travels as the operation's custom data and is read back from the
/// completed operation when its error is classified. Row images are indexed
/// by attribute id.
#[derive(Debug, Clone)]
pub struct ExceptionData {
    pub table: Option<Arc<NdbTable>>,
    pub table_name: String,
    pub cfn_share: Option<Arc<ConflictFnShare>>,
    pub op_type: ConflictingOpType,
    /// Operation was reflected back from the primary
    pub reflected: bool,
    pub trans_id: u64,
    pub old_row: Option<Arc<[Value]>>,
    pub new_row: Option<Arc<[Value]>>,
    pub write_set: Option<FieldBitmap>,
}

impl ExceptionData {
    /// Marker carried by refresh operations defined during conflict handling
    pub fn refresh_marker() -> Self {
        Self {
            table: None,
            table_name: String::new(),
            cfn_share: None,
            op_type: ConflictingOpType::RefreshRow,
            reflected: false,
            trans_id: INVALID_TRANSACTION_ID,
            old_row: None,
            new_row: None,
            write_set: None,
        }
    }

    /// Approximate bytes held by the snapshot
    pub fn byte_size(&self) -> usize {
        let row_bytes = |row: &Option<Arc<[Value]>>| {
            row.as_ref()
                .map_or(0, |r| r.iter().map(Value::wire_len).sum::<usize>())
        };
        std::mem::size_of::<Self>()
            + row_bytes(&self.old_row)
            + row_bytes(&self.new_row)
            + self.write_set.as_ref().map_or(0, |w| w.len().div_ceil(8))
    }
}

/// Where an exceptions table column takes its value from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExColumnSource {
    ServerId,
    SourceServerId,
    SourceEpoch,
    Count,
    OpType,
    Cause,
    OrigTransId,
    /// Base column, key columns from whichever image exists
    Default(AttrId),
    Old(AttrId),
    New(AttrId),
}

/// Values of one exception row
#[derive(Debug, Clone, Copy)]
pub struct ExceptionRow<'a> {
    pub own_server_id: u32,
    pub source_server_id: u32,
    pub source_epoch: u64,
    pub op_type: ConflictingOpType,
    pub cause: ConflictCause,
    pub trans_id: u64,
    pub old_row: Option<&'a [Value]>,
    pub new_row: Option<&'a [Value]>,
    pub write_set: Option<&'a FieldBitmap>,
}

/// Writes exception rows for one base table
#[derive(Debug)]
pub struct ExceptionsTableWriter {
    ex_table: Arc<NdbTable>,
    columns: Vec<(AttrId, ExColumnSource)>,
    base_key: Vec<AttrId>,
    count: AtomicU64,
}

impl ExceptionsTableWriter {
    /// Check the layout of `ex_table` against `base` and build the column map
    pub fn init(base: &NdbTable, ex_table: Arc<NdbTable>) -> Result<Self> {
        let invalid = |msg: String| {
            Error::invalid_argument(format!("exceptions table {}: {}", ex_table.name, msg))
        };
        if ex_table.columns.len() < MANDATORY_COLUMNS.len() {
            return Err(invalid("too few columns".to_string()));
        }

        let mut columns = Vec::with_capacity(ex_table.columns.len());
        for (pos, column) in ex_table.columns.iter().enumerate() {
            let name = column.name.as_str();
            if let Some(expected) = MANDATORY_COLUMNS.get(pos) {
                let bare = strip_prefix_ci(name, "NDB$").unwrap_or(name);
                if !bare.eq_ignore_ascii_case(expected) || !column.primary_key {
                    return Err(invalid(format!(
                        "column {} must be key column '{}'",
                        pos, expected
                    )));
                }
                let source = match pos {
                    0 => ExColumnSource::ServerId,
                    1 => ExColumnSource::SourceServerId,
                    2 => ExColumnSource::SourceEpoch,
                    _ => ExColumnSource::Count,
                };
                columns.push((column.attr_id, source));
                continue;
            }

            let source = if name.eq_ignore_ascii_case("NDB$OP_TYPE") {
                ExColumnSource::OpType
            } else if name.eq_ignore_ascii_case("NDB$CFT_CAUSE") {
                ExColumnSource::Cause
            } else if name.eq_ignore_ascii_case("NDB$ORIG_TRANSID") {
                ExColumnSource::OrigTransId
            } else {
                let (base_name, image) = match name.rsplit_once('$') {
                    Some((b, s)) if s.eq_ignore_ascii_case("old") => (b, Some(false)),
                    Some((b, s)) if s.eq_ignore_ascii_case("new") => (b, Some(true)),
                    _ => (name, None),
                };
                match base.column_by_name(base_name) {
                    Some(bc) => match image {
                        None => ExColumnSource::Default(bc.attr_id),
                        Some(false) => ExColumnSource::Old(bc.attr_id),
                        Some(true) => ExColumnSource::New(bc.attr_id),
                    },
                    None if column.nullable || column.has_default => continue,
                    None => {
                        return Err(invalid(format!(
                            "column '{}' not found in table {} and has no default",
                            name, base.name
                        )))
                    }
                }
            };
            columns.push((column.attr_id, source));
        }

        for attr in &base.primary_key {
            let present = columns
                .iter()
                .any(|(_, s)| *s == ExColumnSource::Default(*attr));
            if !present {
                return Err(invalid(format!(
                    "missing primary key column of table {}",
                    base.name
                )));
            }
        }

        Ok(Self {
            ex_table,
            columns,
            base_key: base.primary_key.clone(),
            count: AtomicU64::new(0),
        })
    }

    pub fn table(&self) -> &Arc<NdbTable> {
        &self.ex_table
    }

    /// Exception rows written so far
    pub fn rows_written(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Define an insert of one exception row on `trans`
    pub fn write_row(
        &self,
        trans: &mut dyn NdbTransaction,
        row: &ExceptionRow<'_>,
    ) -> std::result::Result<(), NdbError> {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let image = |r: Option<&[Value]>, attr: AttrId| {
            r.and_then(|r| r.get(attr as usize))
                .cloned()
                .unwrap_or(Value::Null)
        };

        let mut values = Vec::with_capacity(self.columns.len());
        for (attr, source) in &self.columns {
            let value = match *source {
                ExColumnSource::ServerId => Value::unsigned(u64::from(row.own_server_id)),
                ExColumnSource::SourceServerId => Value::unsigned(u64::from(row.source_server_id)),
                ExColumnSource::SourceEpoch => Value::unsigned(row.source_epoch),
                ExColumnSource::Count => Value::unsigned(count),
                ExColumnSource::OpType => Value::integer(row.op_type as i64),
                ExColumnSource::Cause => Value::integer(row.cause as i64),
                ExColumnSource::OrigTransId => {
                    if row.trans_id == INVALID_TRANSACTION_ID {
                        Value::Null
                    } else {
                        Value::unsigned(row.trans_id)
                    }
                }
                ExColumnSource::Old(a) => image(row.old_row, a),
                ExColumnSource::New(a) => image(row.new_row, a),
                ExColumnSource::Default(a) => {
                    let written = row.write_set.map_or(true, |w| w.is_set(a as usize));
                    if self.base_key.contains(&a) {
                        image(row.new_row.or(row.old_row), a)
                    } else if row.new_row.is_some() && written {
                        image(row.new_row, a)
                    } else {
                        image(row.old_row, a)
                    }
                }
            };
            values.push((*attr, value));
        }

        let key = self
            .ex_table
            .primary_key
            .iter()
            .map(|k| {
                values
                    .iter()
                    .find(|(a, _)| a == k)
                    .map_or(Value::Null, |(_, v)| v.clone())
            })
            .collect();
        let op = OperationDef::insert(Arc::clone(&self.ex_table), key, values);
        trans.define_operation(op)?;
        Ok(())
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryCluster;
    use crate::cluster::types::{AbortOption, ExecType};
    use crate::cluster::NdbClient;
    use crate::core::{FieldType, TableDefBuilder};

    fn setup() -> (MemoryCluster, Arc<NdbTable>, Arc<NdbTable>) {
        let cluster = MemoryCluster::new();
        let base = TableDefBuilder::new("test", "t")
            .add("id", FieldType::Integer)
            .add_nullable("v", FieldType::Integer)
            .primary_key(&["id"])
            .build()
            .unwrap();
        let ex = TableDefBuilder::new("test", "t$EX")
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
            .unwrap();
        let base = cluster.create_table(&base).unwrap();
        let ex = cluster.create_table(&ex).unwrap();
        (cluster, base, ex)
    }

    #[test]
    fn test_writer_layout() {
        let (_cluster, base, ex) = setup();
        let writer = ExceptionsTableWriter::init(&base, ex).unwrap();
        assert_eq!(writer.columns.len(), 10);
        assert_eq!(writer.columns[7].1, ExColumnSource::Default(0));
        assert_eq!(writer.columns[8].1, ExColumnSource::Old(1));
        assert_eq!(writer.columns[9].1, ExColumnSource::New(1));
    }

    #[test]
    fn test_writer_rejects_bad_layout() {
        let cluster = MemoryCluster::new();
        let base = cluster
            .create_table(
                &TableDefBuilder::new("test", "b")
                    .add("id", FieldType::Integer)
                    .primary_key(&["id"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        // Mandatory columns missing
        let ex = cluster
            .create_table(
                &TableDefBuilder::new("test", "b$EX")
                    .add("id", FieldType::Integer)
                    .add("a", FieldType::Integer)
                    .add("b", FieldType::Integer)
                    .add("c", FieldType::Integer)
                    .primary_key(&["id"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(ExceptionsTableWriter::init(&base, ex).is_err());
    }

    #[test]
    fn test_write_row_values() {
        let (cluster, base, ex) = setup();
        let writer = ExceptionsTableWriter::init(&base, ex).unwrap();
        let old = [Value::integer(1), Value::integer(10)];
        let new = [Value::integer(1), Value::integer(20)];
        let mut trans = cluster.start_transaction(None).unwrap();
        writer
            .write_row(
                trans.as_mut(),
                &ExceptionRow {
                    own_server_id: 2,
                    source_server_id: 1,
                    source_epoch: 77,
                    op_type: ConflictingOpType::UpdateRow,
                    cause: ConflictCause::RowInConflict,
                    trans_id: INVALID_TRANSACTION_ID,
                    old_row: Some(&old),
                    new_row: Some(&new),
                    write_set: None,
                },
            )
            .unwrap();
        trans
            .execute(ExecType::Commit, AbortOption::AbortOnError, true)
            .unwrap();
        assert_eq!(writer.rows_written(), 1);

        let key = [
            Value::unsigned(2),
            Value::unsigned(1),
            Value::unsigned(77),
            Value::unsigned(1),
        ];
        let row = cluster.committed_row("test", "t$EX", &key).unwrap();
        assert_eq!(row.attr(4), Value::integer(2));
        assert_eq!(row.attr(5), Value::integer(3));
        assert_eq!(row.attr(6), Value::Null);
        assert_eq!(row.attr(7), Value::integer(1));
        assert_eq!(row.attr(8), Value::integer(10));
        assert_eq!(row.attr(9), Value::integer(20));
    }

    #[test]
    fn test_refresh_marker() {
        let m = ExceptionData::refresh_marker();
        assert_eq!(m.op_type, ConflictingOpType::RefreshRow);
        assert!(m.cfn_share.is_none());
        assert!(m.byte_size() >= std::mem::size_of::<ExceptionData>());
    }
}
