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

//! Conflict functions and their interpreted programs
//!
//! A conflict function is configured per table with a spec such as
//! `NDB$MAX(ts)` or `NDB$EPOCH2()`. Row based functions compare a resolve
//! column of the applied images with the stored row; epoch based functions
//! compare the stored row's commit epoch with the highest epoch of our own
//! changes that has been replicated back.

use std::sync::Arc;

use super::exceptions::ExceptionsTableWriter;
use super::ConflictingOpType;
use crate::cluster::error::ERROR_CONFLICT_FN_VIOLATION;
use crate::cluster::interpreted::{Condition, InterpretedCode};
use crate::cluster::types::{AttrId, ExtraColumn, PseudoColumn};
use crate::cluster::NdbTable;
use crate::core::{Error, FieldBitmap, Result, Value};

/// Function applies conflicts per transaction
pub const CF_TRANSACTIONAL: u32 = 1 << 0;
/// Operations applied on the primary are reflected to the secondary
pub const CF_REFLECT_SEC_OPS: u32 = 1 << 1;
/// Function behaviour depends on the configured conflict role
pub const CF_USE_ROLE_VAR: u32 = 1 << 2;
/// A delete of a missing row marks the transaction in conflict
pub const CF_DEL_DEL_CFT: u32 = 1 << 3;
/// Inserts are applied as writes guarded by the program
pub const CF_USE_INTERP_WRITE: u32 = 1 << 4;

/// Share flag: rows in conflict are refreshed
pub const CFF_REFRESH_ROWS: u8 = 1 << 0;

/// Conflict function kind, ordered as its violation counter index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictFnType {
    Max = 0,
    Old = 1,
    MaxDelWin = 2,
    MaxIns = 3,
    MaxDelWinIns = 4,
    Epoch = 5,
    EpochTrans = 6,
    Epoch2 = 7,
    Epoch2Trans = 8,
}

impl ConflictFnType {
    /// Index of the violation counter
    pub fn counter_index(&self) -> usize {
        *self as usize
    }

    fn is_epoch(&self) -> bool {
        matches!(
            self,
            ConflictFnType::Epoch
                | ConflictFnType::EpochTrans
                | ConflictFnType::Epoch2
                | ConflictFnType::Epoch2Trans
        )
    }
}

/// Static description of a conflict function
#[derive(Debug, PartialEq, Eq)]
pub struct ConflictFnDef {
    pub name: &'static str,
    pub fn_type: ConflictFnType,
    pub flags: u32,
    /// Function takes a resolve column argument
    pub column_arg: bool,
}

impl ConflictFnDef {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

pub static CONFLICT_FNS: [ConflictFnDef; 9] = [
    ConflictFnDef {
        name: "NDB$MAX",
        fn_type: ConflictFnType::Max,
        flags: 0,
        column_arg: true,
    },
    ConflictFnDef {
        name: "NDB$OLD",
        fn_type: ConflictFnType::Old,
        flags: 0,
        column_arg: true,
    },
    ConflictFnDef {
        name: "NDB$MAX_DELETE_WIN",
        fn_type: ConflictFnType::MaxDelWin,
        flags: 0,
        column_arg: true,
    },
    ConflictFnDef {
        name: "NDB$MAX_INS",
        fn_type: ConflictFnType::MaxIns,
        flags: CF_USE_INTERP_WRITE,
        column_arg: true,
    },
    ConflictFnDef {
        name: "NDB$MAX_DEL_WIN_INS",
        fn_type: ConflictFnType::MaxDelWinIns,
        flags: CF_USE_INTERP_WRITE,
        column_arg: true,
    },
    ConflictFnDef {
        name: "NDB$EPOCH",
        fn_type: ConflictFnType::Epoch,
        flags: 0,
        column_arg: false,
    },
    ConflictFnDef {
        name: "NDB$EPOCH_TRANS",
        fn_type: ConflictFnType::EpochTrans,
        flags: CF_TRANSACTIONAL,
        column_arg: false,
    },
    ConflictFnDef {
        name: "NDB$EPOCH2",
        fn_type: ConflictFnType::Epoch2,
        flags: CF_REFLECT_SEC_OPS | CF_USE_ROLE_VAR,
        column_arg: false,
    },
    ConflictFnDef {
        name: "NDB$EPOCH2_TRANS",
        fn_type: ConflictFnType::Epoch2Trans,
        flags: CF_REFLECT_SEC_OPS | CF_USE_ROLE_VAR | CF_TRANSACTIONAL | CF_DEL_DEL_CFT,
        column_arg: false,
    },
];

/// Look up a function definition by type
pub fn conflict_fn_def(fn_type: ConflictFnType) -> &'static ConflictFnDef {
    &CONFLICT_FNS[fn_type.counter_index()]
}

/// Before and after images of an applied row, by attribute id
#[derive(Debug, Clone, Copy)]
pub struct RowImages<'a> {
    pub old_row: Option<&'a [Value]>,
    pub new_row: Option<&'a [Value]>,
    /// Attributes present in the before image
    pub read_set: &'a FieldBitmap,
    /// Attributes present in the after image
    pub write_set: &'a FieldBitmap,
}

impl<'a> RowImages<'a> {
    fn old_value(&self, attr: AttrId) -> Option<&'a Value> {
        if !self.read_set.is_set(attr as usize) {
            return None;
        }
        self.old_row.and_then(|r| r.get(attr as usize))
    }

    fn new_value(&self, attr: AttrId) -> Option<&'a Value> {
        if !self.write_set.is_set(attr as usize) {
            return None;
        }
        self.new_row.and_then(|r| r.get(attr as usize))
    }
}

/// Conflict configuration shared by all handlers of a table
#[derive(Debug)]
pub struct ConflictFnShare {
    def: &'static ConflictFnDef,
    /// Resolve column of row based functions
    resolve_column: Option<AttrId>,
    flags: u8,
    ex_writer: Option<ExceptionsTableWriter>,
}

impl ConflictFnShare {
    /// Configure a table from a function spec, e.g. `NDB$MAX(ts)`
    pub fn setup(
        table: &NdbTable,
        spec: &str,
        exceptions_table: Option<Arc<NdbTable>>,
    ) -> Result<Self> {
        let (name, arg) = parse_spec(spec)?;
        let def = CONFLICT_FNS
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                Error::invalid_argument(format!("unknown conflict function '{}'", name))
            })?;

        let resolve_column = if def.column_arg {
            let column_name = arg.ok_or_else(|| {
                Error::invalid_argument(format!("{} requires a column argument", def.name))
            })?;
            let column = table.column_by_name(column_name).ok_or_else(|| {
                Error::invalid_argument(format!(
                    "{}: column '{}' not found in table {}",
                    def.name, column_name, table.name
                ))
            })?;
            Some(column.attr_id)
        } else {
            if let Some(a) = arg {
                // Optional number of extra gci bits; must be numeric
                a.parse::<u32>().map_err(|_| {
                    Error::invalid_argument(format!("{}: invalid argument '{}'", def.name, a))
                })?;
            }
            None
        };

        let ex_writer = match exceptions_table {
            Some(ex) => Some(ExceptionsTableWriter::init(table, ex)?),
            None => None,
        };

        let flags = if def.fn_type.is_epoch() {
            CFF_REFRESH_ROWS
        } else {
            0
        };

        tracing::info!(
            table = %table.name,
            function = def.name,
            exceptions = ex_writer.is_some(),
            "conflict detection configured"
        );

        Ok(Self {
            def,
            resolve_column,
            flags,
            ex_writer,
        })
    }

    pub fn def(&self) -> &'static ConflictFnDef {
        self.def
    }

    pub fn fn_type(&self) -> ConflictFnType {
        self.def.fn_type
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn resolve_column(&self) -> Option<AttrId> {
        self.resolve_column
    }

    pub fn ex_writer(&self) -> Option<&ExceptionsTableWriter> {
        self.ex_writer.as_ref()
    }

    /// Build the program guarding an applied operation
    ///
    /// An empty program means the operation needs no guard. Fails when the
    /// images lack a column the function needs.
    pub fn prepare_program(
        &self,
        op_type: ConflictingOpType,
        images: &RowImages<'_>,
        max_rep_epoch: u64,
    ) -> Result<InterpretedCode> {
        let mut code = InterpretedCode::new();
        match self.def.fn_type {
            ConflictFnType::Max | ConflictFnType::MaxIns => match op_type {
                ConflictingOpType::DeleteRow => self.max_delete(&mut code, images)?,
                _ => self.max_update(&mut code, images)?,
            },
            ConflictFnType::MaxDelWin | ConflictFnType::MaxDelWinIns => match op_type {
                ConflictingOpType::DeleteRow => {}
                _ => self.max_update(&mut code, images)?,
            },
            ConflictFnType::Old => self.old(&mut code, images)?,
            ConflictFnType::Epoch | ConflictFnType::EpochTrans => {
                epoch_program(&mut code, max_rep_epoch, false)
            }
            ConflictFnType::Epoch2 | ConflictFnType::Epoch2Trans => {
                epoch_program(&mut code, max_rep_epoch, true)
            }
        }
        if code.words_used() > 0 {
            code.finalise()?;
        }
        Ok(code)
    }

    fn column(&self) -> Result<AttrId> {
        self.resolve_column
            .ok_or_else(|| Error::internal("conflict function without resolve column"))
    }

    /// Accept when the applied value is higher than the stored one
    fn max_update(&self, code: &mut InterpretedCode, images: &RowImages<'_>) -> Result<()> {
        let attr = self.column()?;
        let new_value = images.new_value(attr).ok_or_else(missing_info)?;
        compare_program(code, attr, new_value.clone(), Condition::Gt);
        Ok(())
    }

    /// Accept when the before value is at least the stored one
    fn max_delete(&self, code: &mut InterpretedCode, images: &RowImages<'_>) -> Result<()> {
        let attr = self.column()?;
        let old_value = images.old_value(attr).ok_or_else(missing_info)?;
        compare_program(code, attr, old_value.clone(), Condition::Ge);
        Ok(())
    }

    /// Accept when the stored value still equals the before value
    fn old(&self, code: &mut InterpretedCode, images: &RowImages<'_>) -> Result<()> {
        let attr = self.column()?;
        let old_value = images.old_value(attr).ok_or_else(missing_info)?;
        compare_program(code, attr, old_value.clone(), Condition::Eq);
        Ok(())
    }
}

fn missing_info() -> Error {
    Error::replica_corrupt_event("missing info necessary for conflict detection")
}

const LABEL_OK: u32 = 0;

/// `applied <cond> stored` accepts, anything else exits with a violation
fn compare_program(code: &mut InterpretedCode, attr: AttrId, applied: Value, cond: Condition) {
    code.load_const(1, applied)
        .read_attr(2, ExtraColumn::Attr(attr))
        .branch(cond, 1, 2, LABEL_OK)
        .interpret_exit_nok(ERROR_CONFLICT_FN_VIOLATION)
        .def_label(LABEL_OK)
        .interpret_exit_ok();
}

/// Stored changes newer than the max replicated epoch are in conflict
///
/// With `check_author`, rows last written by the applier never conflict.
fn epoch_program(code: &mut InterpretedCode, max_rep_epoch: u64, check_author: bool) {
    if check_author {
        code.read_attr(3, ExtraColumn::Pseudo(PseudoColumn::RowAuthor))
            .load_const(4, Value::unsigned(0))
            .branch(Condition::Ne, 3, 4, LABEL_OK);
    }
    code.load_const(1, Value::unsigned(max_rep_epoch))
        .read_attr(2, ExtraColumn::Pseudo(PseudoColumn::RowGci64))
        .branch(Condition::Le, 2, 1, LABEL_OK)
        .interpret_exit_nok(ERROR_CONFLICT_FN_VIOLATION)
        .def_label(LABEL_OK)
        .interpret_exit_ok();
}

/// Split `NAME(arg)` into name and optional argument
fn parse_spec(spec: &str) -> Result<(&str, Option<&str>)> {
    let spec = spec.trim();
    let invalid = || Error::invalid_argument(format!("malformed conflict function '{}'", spec));
    let open = spec.find('(').ok_or_else(invalid)?;
    if !spec.ends_with(')') {
        return Err(invalid());
    }
    let name = spec[..open].trim();
    let arg = spec[open + 1..spec.len() - 1].trim();
    if name.is_empty() || arg.contains(['(', ')', ',']) {
        return Err(invalid());
    }
    Ok((name, if arg.is_empty() { None } else { Some(arg) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::dictionary::{ColumnKind, NdbColumn};
    use crate::core::StorageType;

    fn table() -> NdbTable {
        let col = |name: &str, attr: AttrId, pk: bool| NdbColumn {
            name: name.to_string(),
            attr_id: attr,
            kind: ColumnKind::Regular,
            nullable: !pk,
            primary_key: pk,
            storage: StorageType::Memory,
            has_default: false,
        };
        NdbTable::new(
            "test/def/t",
            1,
            1,
            vec![col("id", 0, true), col("ts", 1, false), col("v", 2, false)],
        )
    }

    fn stored(ts: i64, gci: u64, author: u64) -> impl Fn(ExtraColumn) -> Value {
        move |c| match c {
            ExtraColumn::Attr(1) => Value::integer(ts),
            ExtraColumn::Pseudo(PseudoColumn::RowGci64) => Value::unsigned(gci),
            ExtraColumn::Pseudo(PseudoColumn::RowAuthor) => Value::unsigned(author),
            _ => Value::Null,
        }
    }

    #[test]
    fn test_function_flags() {
        let f = conflict_fn_def(ConflictFnType::Epoch2Trans);
        assert_eq!(f.name, "NDB$EPOCH2_TRANS");
        assert!(f.has_flag(CF_TRANSACTIONAL));
        assert!(f.has_flag(CF_DEL_DEL_CFT));
        assert!(f.has_flag(CF_USE_ROLE_VAR));
        assert!(!conflict_fn_def(ConflictFnType::EpochTrans).has_flag(CF_DEL_DEL_CFT));
        assert!(conflict_fn_def(ConflictFnType::MaxIns).has_flag(CF_USE_INTERP_WRITE));
        for (i, f) in CONFLICT_FNS.iter().enumerate() {
            assert_eq!(f.fn_type.counter_index(), i);
        }
    }

    #[test]
    fn test_parse_spec() {
        assert_eq!(parse_spec("NDB$MAX(ts)").unwrap(), ("NDB$MAX", Some("ts")));
        assert_eq!(parse_spec(" NDB$EPOCH2() ").unwrap(), ("NDB$EPOCH2", None));
        assert!(parse_spec("NDB$MAX").is_err());
        assert!(parse_spec("NDB$MAX(a,b)").is_err());
    }

    #[test]
    fn test_setup_validates() {
        let t = table();
        let share = ConflictFnShare::setup(&t, "NDB$MAX(ts)", None).unwrap();
        assert_eq!(share.resolve_column(), Some(1));
        assert!(!share.has_flag(CFF_REFRESH_ROWS));
        assert!(ConflictFnShare::setup(&t, "NDB$MAX()", None).is_err());
        assert!(ConflictFnShare::setup(&t, "NDB$MAX(nope)", None).is_err());
        assert!(ConflictFnShare::setup(&t, "NDB$UNKNOWN()", None).is_err());
        assert!(ConflictFnShare::setup(&t, "NDB$EPOCH(x)", None).is_err());
        let share = ConflictFnShare::setup(&t, "NDB$EPOCH(7)", None).unwrap();
        assert!(share.has_flag(CFF_REFRESH_ROWS));
    }

    #[test]
    fn test_max_program() {
        let t = table();
        let share = ConflictFnShare::setup(&t, "NDB$MAX(ts)", None).unwrap();
        let all = FieldBitmap::all(3);
        let new_row = [Value::integer(1), Value::integer(10), Value::integer(0)];
        let images = RowImages {
            old_row: None,
            new_row: Some(&new_row),
            read_set: &all,
            write_set: &all,
        };
        let code = share
            .prepare_program(ConflictingOpType::UpdateRow, &images, 0)
            .unwrap();
        assert_eq!(code.evaluate(stored(5, 0, 0)), Ok(()));
        assert_eq!(code.evaluate(stored(10, 0, 0)), Err(9999));

        // Resolve column missing from the after image
        let none = FieldBitmap::new(3);
        let images = RowImages {
            write_set: &none,
            ..images
        };
        let err = share
            .prepare_program(ConflictingOpType::UpdateRow, &images, 0)
            .unwrap_err();
        assert!(matches!(err, Error::ReplicaCorruptEvent(_)));
    }

    #[test]
    fn test_delete_programs() {
        let t = table();
        let all = FieldBitmap::all(3);
        let old_row = [Value::integer(1), Value::integer(7), Value::integer(0)];
        let images = RowImages {
            old_row: Some(&old_row),
            new_row: None,
            read_set: &all,
            write_set: &all,
        };
        let max = ConflictFnShare::setup(&t, "NDB$MAX(ts)", None).unwrap();
        let code = max
            .prepare_program(ConflictingOpType::DeleteRow, &images, 0)
            .unwrap();
        assert_eq!(code.evaluate(stored(7, 0, 0)), Ok(()));
        assert_eq!(code.evaluate(stored(8, 0, 0)), Err(9999));

        let del_win = ConflictFnShare::setup(&t, "NDB$MAX_DELETE_WIN(ts)", None).unwrap();
        let code = del_win
            .prepare_program(ConflictingOpType::DeleteRow, &images, 0)
            .unwrap();
        assert_eq!(code.words_used(), 0);

        let old = ConflictFnShare::setup(&t, "NDB$OLD(ts)", None).unwrap();
        let code = old
            .prepare_program(ConflictingOpType::DeleteRow, &images, 0)
            .unwrap();
        assert_eq!(code.evaluate(stored(7, 0, 0)), Ok(()));
        assert_eq!(code.evaluate(stored(6, 0, 0)), Err(9999));
    }

    #[test]
    fn test_epoch_programs() {
        let t = table();
        let all = FieldBitmap::all(3);
        let images = RowImages {
            old_row: None,
            new_row: None,
            read_set: &all,
            write_set: &all,
        };
        let epoch = ConflictFnShare::setup(&t, "NDB$EPOCH()", None).unwrap();
        let code = epoch
            .prepare_program(ConflictingOpType::UpdateRow, &images, 100)
            .unwrap();
        assert_eq!(code.evaluate(stored(0, 100, 0)), Ok(()));
        assert_eq!(code.evaluate(stored(0, 101, 1)), Err(9999));

        let epoch2 = ConflictFnShare::setup(&t, "NDB$EPOCH2()", None).unwrap();
        let code = epoch2
            .prepare_program(ConflictingOpType::UpdateRow, &images, 100)
            .unwrap();
        // Last written by the applier
        assert_eq!(code.evaluate(stored(0, 101, 1)), Ok(()));
        assert_eq!(code.evaluate(stored(0, 101, 0)), Err(9999));
    }
}
