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

//! Interpreted programs attached to operations
//!
//! A program runs on the data node against the stored row before the
//! operation is applied. It either exits OK (the operation proceeds) or
//! exits with an error code (the operation fails with that code). Conflict
//! detection builds one program per replicated row.

use std::cmp::Ordering;
use std::fmt;

use rustc_hash::FxHashSet;

use super::error::NdbError;
use super::types::ExtraColumn;
use crate::core::Value;

/// Number of registers available to a program
pub const NUM_REGISTERS: u8 = 8;

/// Comparison used by a conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Condition {
    fn holds(&self, ord: Ordering) -> bool {
        match self {
            Condition::Eq => ord == Ordering::Equal,
            Condition::Ne => ord != Ordering::Equal,
            Condition::Lt => ord == Ordering::Less,
            Condition::Le => ord != Ordering::Greater,
            Condition::Gt => ord == Ordering::Greater,
            Condition::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Load a stored column (or pseudo column) into a register
    ReadAttr { reg: u8, column: ExtraColumn },
    LoadConst { reg: u8, value: Value },
    /// Jump to `label` when `lhs <cond> rhs`
    Branch {
        cond: Condition,
        lhs: u8,
        rhs: u8,
        label: u32,
    },
    /// Jump to `label` when the register holds NULL
    BranchNull { reg: u8, label: u32 },
    Label(u32),
    ExitOk,
    ExitNok(i32),
}

/// Builder and container for an interpreted program
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InterpretedCode {
    instructions: Vec<Instruction>,
    finalised: bool,
}

impl InterpretedCode {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, ins: Instruction) -> &mut Self {
        self.instructions.push(ins);
        self
    }

    pub fn read_attr(&mut self, reg: u8, column: ExtraColumn) -> &mut Self {
        self.push(Instruction::ReadAttr { reg, column })
    }

    pub fn load_const(&mut self, reg: u8, value: Value) -> &mut Self {
        self.push(Instruction::LoadConst { reg, value })
    }

    pub fn branch(&mut self, cond: Condition, lhs: u8, rhs: u8, label: u32) -> &mut Self {
        self.push(Instruction::Branch {
            cond,
            lhs,
            rhs,
            label,
        })
    }

    pub fn branch_null(&mut self, reg: u8, label: u32) -> &mut Self {
        self.push(Instruction::BranchNull { reg, label })
    }

    pub fn def_label(&mut self, label: u32) -> &mut Self {
        self.push(Instruction::Label(label))
    }

    pub fn interpret_exit_ok(&mut self) -> &mut Self {
        self.push(Instruction::ExitOk)
    }

    pub fn interpret_exit_nok(&mut self, code: i32) -> &mut Self {
        self.push(Instruction::ExitNok(code))
    }

    /// Validate registers and branch targets; the program is immutable after
    pub fn finalise(&mut self) -> Result<(), NdbError> {
        let labels: FxHashSet<u32> = self
            .instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Label(l) => Some(*l),
                _ => None,
            })
            .collect();
        for ins in &self.instructions {
            let (regs, target): (Vec<u8>, Option<u32>) = match ins {
                Instruction::ReadAttr { reg, .. } | Instruction::LoadConst { reg, .. } => {
                    (vec![*reg], None)
                }
                Instruction::Branch {
                    lhs, rhs, label, ..
                } => (vec![*lhs, *rhs], Some(*label)),
                Instruction::BranchNull { reg, label } => (vec![*reg], Some(*label)),
                _ => (Vec::new(), None),
            };
            if regs.iter().any(|r| *r >= NUM_REGISTERS) {
                return Err(NdbError::internal(4200, "Invalid register in interpreted program"));
            }
            if let Some(label) = target {
                if !labels.contains(&label) {
                    return Err(NdbError::internal(4223, "Label not found in program"));
                }
            }
        }
        self.finalised = true;
        Ok(())
    }

    /// Number of instructions, the analogue of words used
    pub fn words_used(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Run the program against a stored row
    ///
    /// `read` resolves stored columns. Returns `Err(code)` when the program
    /// exits with an error. Running off the end counts as exit OK. Only
    /// finalised programs run.
    pub fn evaluate<F>(&self, mut read: F) -> Result<(), i32>
    where
        F: FnMut(ExtraColumn) -> Value,
    {
        if !self.finalised && !self.instructions.is_empty() {
            return Err(4200);
        }
        let mut regs: [Value; NUM_REGISTERS as usize] = Default::default();
        let mut pc = 0;
        let mut steps = 0usize;
        while pc < self.instructions.len() {
            steps += 1;
            if steps > 10_000 {
                return Err(4237);
            }
            match &self.instructions[pc] {
                Instruction::ReadAttr { reg, column } => {
                    regs[*reg as usize] = read(*column);
                }
                Instruction::LoadConst { reg, value } => {
                    regs[*reg as usize] = value.clone();
                }
                Instruction::Branch {
                    cond,
                    lhs,
                    rhs,
                    label,
                } => {
                    let ord = regs[*lhs as usize].compare(&regs[*rhs as usize]);
                    if cond.holds(ord) {
                        pc = self.label_position(*label).ok_or(4223)?;
                        continue;
                    }
                }
                Instruction::BranchNull { reg, label } => {
                    if regs[*reg as usize].is_null() {
                        pc = self.label_position(*label).ok_or(4223)?;
                        continue;
                    }
                }
                Instruction::Label(_) => {}
                Instruction::ExitOk => return Ok(()),
                Instruction::ExitNok(code) => return Err(*code),
            }
            pc += 1;
        }
        Ok(())
    }

    fn label_position(&self, label: u32) -> Option<usize> {
        self.instructions
            .iter()
            .position(|i| *i == Instruction::Label(label))
    }
}

impl fmt::Debug for InterpretedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterpretedCode[{} words]", self.instructions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::PseudoColumn;

    /// Accept only when the stored column is lower than the new value
    fn max_program(new_value: i64) -> InterpretedCode {
        let mut code = InterpretedCode::new();
        code.load_const(1, Value::integer(new_value))
            .read_attr(2, ExtraColumn::Attr(1))
            .branch(Condition::Gt, 1, 2, 0)
            .interpret_exit_nok(9999)
            .def_label(0)
            .interpret_exit_ok();
        code.finalise().unwrap();
        code
    }

    #[test]
    fn test_program_accepts_and_rejects() {
        let code = max_program(10);
        assert_eq!(code.words_used(), 6);
        assert_eq!(code.evaluate(|_| Value::integer(5)), Ok(()));
        assert_eq!(code.evaluate(|_| Value::integer(10)), Err(9999));
        assert_eq!(code.evaluate(|_| Value::integer(11)), Err(9999));
    }

    #[test]
    fn test_branch_null_and_pseudo() {
        let mut code = InterpretedCode::new();
        code.read_attr(0, ExtraColumn::Pseudo(PseudoColumn::RowGci64))
            .branch_null(0, 1)
            .interpret_exit_nok(9999)
            .def_label(1)
            .interpret_exit_ok();
        code.finalise().unwrap();
        assert_eq!(code.evaluate(|_| Value::Null), Ok(()));
        assert_eq!(code.evaluate(|_| Value::unsigned(3)), Err(9999));
    }

    #[test]
    fn test_finalise_rejects_missing_label() {
        let mut code = InterpretedCode::new();
        code.branch(Condition::Eq, 0, 1, 7).interpret_exit_ok();
        assert!(code.finalise().is_err());

        let mut code = InterpretedCode::new();
        code.load_const(NUM_REGISTERS, Value::Null);
        assert!(code.finalise().is_err());
    }

    #[test]
    fn test_empty_program() {
        let code = InterpretedCode::new();
        assert_eq!(code.words_used(), 0);
        assert_eq!(code.evaluate(|_| Value::Null), Ok(()));
    }
}
