//! Partial concrete emulation for address inference.
//!
//! Jump targets, call targets, and v-call selectors are never immediates in
//! the obfuscated stream - they are computed on the VM stack. The
//! [`PartialEmulator`] executes just enough of the instruction set to redo
//! those computations concretely: integer immediates, register loads, integer
//! arithmetic and bitwise operators, and the extension/truncation family.
//!
//! Given a data source (a producer instruction), the emulator first recurses
//! depth-first through every producer reachable via the instruction's
//! dependency slots, pushing their concrete results, then executes the
//! instruction itself; the final top of stack is the inferred value. Results
//! are memoized per emulator instance, so shared sub-expressions execute once.
//!
//! Anything outside the supported subset fails with
//! [`Error::InferenceFailed`], which the instruction processor converts into
//! an unresolved-target warning rather than a fatal condition.

use rustc_hash::FxHashMap;

use crate::{
    architecture::ILCode,
    disassembler::{export::VMExportDisassembly, symbolic::SymbolicValue},
    Error, Result,
};

/// A concrete value produced by partial emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmValue {
    /// A 32-bit slot.
    Dword(u32),
    /// A 64-bit slot (pointers included).
    Qword(u64),
}

impl EmValue {
    /// The value zero-extended to 64 bits.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        match self {
            EmValue::Dword(v) => u64::from(v),
            EmValue::Qword(v) => v,
        }
    }

    /// The value truncated to 32 bits.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            EmValue::Dword(v) => v,
            EmValue::Qword(v) => v as u32,
        }
    }
}

/// Emulates the address-computation subset over a disassembly's producer graph.
///
/// One emulator instance serves one inference request; its memo table is only
/// coherent for a single consistent snapshot of the dependency graph.
pub struct PartialEmulator<'a> {
    disasm: &'a VMExportDisassembly,
    stack: Vec<EmValue>,
    memo: FxHashMap<u64, EmValue>,
    max_depth: usize,
}

impl<'a> PartialEmulator<'a> {
    /// Creates an emulator over `disasm`'s instruction arena.
    #[must_use]
    pub fn new(disasm: &'a VMExportDisassembly, max_depth: usize) -> Self {
        Self {
            disasm,
            stack: Vec::new(),
            memo: FxHashMap::default(),
            max_depth,
        }
    }

    /// Emulates the data source at `offset` and returns its concrete value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InferenceFailed`] when the producer chain leaves the
    /// supported subset, exceeds the depth ceiling, or references an offset
    /// the disassembly has not recorded.
    pub fn infer_source(&mut self, offset: u64) -> Result<EmValue> {
        self.emulate(offset, 0)?;
        self.stack.pop().ok_or_else(|| Error::InferenceFailed {
            offset,
            message: "emulation produced no value".into(),
        })
    }

    fn emulate(&mut self, offset: u64, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(Error::InferenceFailed {
                offset,
                message: format!("producer chain deeper than {}", self.max_depth),
            });
        }

        if let Some(&value) = self.memo.get(&offset) {
            self.stack.push(value);
            return Ok(());
        }

        let disasm = self.disasm;
        let Some(instr) = disasm.instruction(offset) else {
            return Err(Error::InferenceFailed {
                offset,
                message: "data source is not a recorded instruction".into(),
            });
        };

        for dependency in instr.dependencies.iter() {
            for source in dependency.data_sources() {
                self.emulate(source, depth + 1)?;
            }
        }

        self.execute(instr.opcode, instr.offset, instr.operand)?;

        let top = *self.stack.last().ok_or_else(|| Error::InferenceFailed {
            offset,
            message: "instruction left the emulation stack empty".into(),
        })?;
        self.memo.insert(offset, top);
        Ok(())
    }

    fn pop(&mut self, offset: u64) -> Result<EmValue> {
        self.stack.pop().ok_or_else(|| Error::InferenceFailed {
            offset,
            message: "emulation stack underflow".into(),
        })
    }

    fn execute(
        &mut self,
        opcode: ILCode,
        offset: u64,
        operand: crate::disassembler::instruction::Operand,
    ) -> Result<()> {
        use crate::disassembler::instruction::Operand;

        match opcode {
            ILCode::PUSHI_DWORD => {
                let Operand::ImmediateDword(value) = operand else {
                    return Err(internal_error!("PUSHI_DWORD without dword operand"));
                };
                self.stack.push(EmValue::Dword(value));
            }
            ILCode::PUSHI_QWORD => {
                let Operand::ImmediateQword(value) = operand else {
                    return Err(internal_error!("PUSHI_QWORD without qword operand"));
                };
                self.stack.push(EmValue::Qword(value));
            }

            // Register loads: the register's producer already pushed its value;
            // coerce it to the load width.
            ILCode::PUSHR_BYTE => {
                let value = self.pop(offset)?;
                self.stack.push(EmValue::Dword(value.as_u32() & 0xFF));
            }
            ILCode::PUSHR_WORD => {
                let value = self.pop(offset)?;
                self.stack.push(EmValue::Dword(value.as_u32() & 0xFFFF));
            }
            ILCode::PUSHR_DWORD => {
                let value = self.pop(offset)?;
                self.stack.push(EmValue::Dword(value.as_u32()));
            }
            ILCode::PUSHR_QWORD => {
                let value = self.pop(offset)?;
                self.stack.push(EmValue::Qword(value.as_u64()));
            }

            // A register store's value is the value it popped.
            ILCode::POP => {}

            ILCode::SX_BYTE => {
                let value = self.pop(offset)?.as_u32();
                self.stack.push(EmValue::Dword(value as u8 as i8 as i32 as u32));
            }
            ILCode::SX_WORD => {
                let value = self.pop(offset)?.as_u32();
                self.stack.push(EmValue::Dword(value as u16 as i16 as i32 as u32));
            }
            ILCode::SX_DWORD => {
                let value = self.pop(offset)?.as_u32();
                self.stack.push(EmValue::Qword(value as i32 as i64 as u64));
            }
            ILCode::ZX_BYTE => {
                let value = self.pop(offset)?.as_u32();
                self.stack.push(EmValue::Dword(value & 0xFF));
            }
            ILCode::ZX_WORD => {
                let value = self.pop(offset)?.as_u32();
                self.stack.push(EmValue::Dword(value & 0xFFFF));
            }
            ILCode::ICONV_PTR => {
                let value = self.pop(offset)?;
                self.stack.push(EmValue::Qword(value.as_u64()));
            }

            ILCode::NOR_DWORD => self.binary_dword(offset, |a, b| !(a | b))?,
            ILCode::NOR_QWORD => self.binary_qword(offset, |a, b| !(a | b))?,
            ILCode::ADD_DWORD => self.binary_dword(offset, u32::wrapping_add)?,
            ILCode::ADD_QWORD => self.binary_qword(offset, u64::wrapping_add)?,
            ILCode::MUL_DWORD => self.binary_dword(offset, u32::wrapping_mul)?,
            ILCode::MUL_QWORD => self.binary_qword(offset, u64::wrapping_mul)?,
            ILCode::DIV_DWORD => self.binary_dword_checked(offset, u32::checked_div)?,
            ILCode::DIV_QWORD => self.binary_qword_checked(offset, u64::checked_div)?,
            ILCode::REM_DWORD => self.binary_dword_checked(offset, u32::checked_rem)?,
            ILCode::REM_QWORD => self.binary_qword_checked(offset, u64::checked_rem)?,
            ILCode::SHL_DWORD => self.shift_dword(offset, |v, c| v.wrapping_shl(c))?,
            ILCode::SHL_QWORD => self.shift_qword(offset, |v, c| v.wrapping_shl(c))?,
            ILCode::SHR_DWORD => self.shift_dword(offset, |v, c| v.wrapping_shr(c))?,
            ILCode::SHR_QWORD => self.shift_qword(offset, |v, c| v.wrapping_shr(c))?,

            other => {
                return Err(Error::InferenceFailed {
                    offset,
                    message: format!("{other:?} is outside the emulated subset"),
                });
            }
        }
        Ok(())
    }

    fn binary_dword(&mut self, offset: u64, op: fn(u32, u32) -> u32) -> Result<()> {
        let b = self.pop(offset)?.as_u32();
        let a = self.pop(offset)?.as_u32();
        self.stack.push(EmValue::Dword(op(a, b)));
        Ok(())
    }

    fn binary_qword(&mut self, offset: u64, op: fn(u64, u64) -> u64) -> Result<()> {
        let b = self.pop(offset)?.as_u64();
        let a = self.pop(offset)?.as_u64();
        self.stack.push(EmValue::Qword(op(a, b)));
        Ok(())
    }

    fn binary_dword_checked(
        &mut self,
        offset: u64,
        op: fn(u32, u32) -> Option<u32>,
    ) -> Result<()> {
        let b = self.pop(offset)?.as_u32();
        let a = self.pop(offset)?.as_u32();
        let result = op(a, b).ok_or_else(|| Error::InferenceFailed {
            offset,
            message: "division by zero in producer chain".into(),
        })?;
        self.stack.push(EmValue::Dword(result));
        Ok(())
    }

    fn binary_qword_checked(
        &mut self,
        offset: u64,
        op: fn(u64, u64) -> Option<u64>,
    ) -> Result<()> {
        let b = self.pop(offset)?.as_u64();
        let a = self.pop(offset)?.as_u64();
        let result = op(a, b).ok_or_else(|| Error::InferenceFailed {
            offset,
            message: "division by zero in producer chain".into(),
        })?;
        self.stack.push(EmValue::Qword(result));
        Ok(())
    }

    fn shift_dword(&mut self, offset: u64, op: fn(u32, u32) -> u32) -> Result<()> {
        let count = self.pop(offset)?.as_u32();
        let value = self.pop(offset)?.as_u32();
        self.stack.push(EmValue::Dword(op(value, count)));
        Ok(())
    }

    fn shift_qword(&mut self, offset: u64, op: fn(u64, u32) -> u64) -> Result<()> {
        let count = self.pop(offset)?.as_u32();
        let value = self.pop(offset)?.as_u64();
        self.stack.push(EmValue::Qword(op(value, count)));
        Ok(())
    }
}

/// Infers the single concrete value of a symbolic operand.
///
/// Every data source of `value` is emulated with a fresh memo; all sources
/// must agree on the result. Used for operands that select behaviour (call
/// targets, v-call selectors, metadata ids), where ambiguity is as fatal as
/// inscrutability.
///
/// # Errors
///
/// Returns [`Error::InferenceFailed`] when `value` has no sources, a source
/// cannot be emulated, or two sources disagree.
pub fn infer_value(
    disasm: &VMExportDisassembly,
    value: &SymbolicValue,
    max_depth: usize,
) -> Result<EmValue> {
    let mut result: Option<EmValue> = None;
    for source in value.data_sources() {
        let inferred = PartialEmulator::new(disasm, max_depth).infer_source(source)?;
        match result {
            None => result = Some(inferred),
            Some(existing) if existing.as_u64() == inferred.as_u64() => {}
            Some(existing) => {
                return Err(Error::InferenceFailed {
                    offset: source,
                    message: format!(
                        "ambiguous operand: {:#x} vs {:#x}",
                        existing.as_u64(),
                        inferred.as_u64()
                    ),
                });
            }
        }
    }
    result.ok_or_else(|| Error::InferenceFailed {
        offset: 0,
        message: "operand has no data sources".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        architecture::VMType,
        disassembler::instruction::{Instruction, Operand},
        test::factories::{export_at, push_instruction},
    };

    fn record() -> VMExportDisassembly {
        VMExportDisassembly::new(0, export_at(0x10, 0xAAAA_AAAA))
    }

    #[test]
    fn immediate_load() {
        let mut disasm = record();
        push_instruction(
            &mut disasm,
            Instruction::new(0x10, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x40)),
        );

        let mut emulator = PartialEmulator::new(&disasm, 32);
        assert_eq!(emulator.infer_source(0x10).unwrap(), EmValue::Dword(0x40));
    }

    #[test]
    fn add_over_two_immediates() {
        let mut disasm = record();
        push_instruction(
            &mut disasm,
            Instruction::new(0x10, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x30)),
        );
        push_instruction(
            &mut disasm,
            Instruction::new(0x16, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x10)),
        );
        let mut add = Instruction::new(0x1C, 2, ILCode::ADD_DWORD, Operand::None);
        add.dependencies
            .add_or_merge(0, SymbolicValue::new(0x10, VMType::Dword));
        add.dependencies
            .add_or_merge(1, SymbolicValue::new(0x16, VMType::Dword));
        push_instruction(&mut disasm, add);

        let mut emulator = PartialEmulator::new(&disasm, 32);
        assert_eq!(emulator.infer_source(0x1C).unwrap(), EmValue::Dword(0x40));
    }

    #[test]
    fn register_load_chases_the_store() {
        // PUSHI 0x40 ; POP R0 ; PUSHR_DWORD R0
        let mut disasm = record();
        push_instruction(
            &mut disasm,
            Instruction::new(0x10, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x40)),
        );
        let mut store = Instruction::new(
            0x16,
            2,
            ILCode::POP,
            Operand::Register(crate::architecture::VMRegister::R0),
        );
        store
            .dependencies
            .add_or_merge(0, SymbolicValue::new(0x10, VMType::Dword));
        push_instruction(&mut disasm, store);
        let mut load = Instruction::new(
            0x18,
            2,
            ILCode::PUSHR_DWORD,
            Operand::Register(crate::architecture::VMRegister::R0),
        );
        load.dependencies
            .add_or_merge(0, SymbolicValue::new(0x16, VMType::Dword));
        push_instruction(&mut disasm, load);

        let mut emulator = PartialEmulator::new(&disasm, 32);
        assert_eq!(emulator.infer_source(0x18).unwrap(), EmValue::Dword(0x40));
    }

    #[test]
    fn unsupported_opcode_fails_soft() {
        let mut disasm = record();
        push_instruction(
            &mut disasm,
            Instruction::new(0x10, 2, ILCode::LIND_DWORD, Operand::None),
        );

        let mut emulator = PartialEmulator::new(&disasm, 32);
        let err = emulator.infer_source(0x10).unwrap_err();
        assert!(matches!(err, Error::InferenceFailed { offset: 0x10, .. }));
    }

    #[test]
    fn sign_extension() {
        let mut disasm = record();
        push_instruction(
            &mut disasm,
            Instruction::new(0x10, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x80)),
        );
        let mut sx = Instruction::new(0x16, 2, ILCode::SX_BYTE, Operand::None);
        sx.dependencies
            .add_or_merge(0, SymbolicValue::new(0x10, VMType::Dword));
        push_instruction(&mut disasm, sx);

        let mut emulator = PartialEmulator::new(&disasm, 32);
        assert_eq!(
            emulator.infer_source(0x16).unwrap(),
            EmValue::Dword(0xFFFF_FF80)
        );
    }

    #[test]
    fn infer_value_rejects_ambiguity() {
        let mut disasm = record();
        push_instruction(
            &mut disasm,
            Instruction::new(0x10, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x40)),
        );
        push_instruction(
            &mut disasm,
            Instruction::new(0x16, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x50)),
        );

        let mut operand = SymbolicValue::new(0x10, VMType::Dword);
        operand.merge(&SymbolicValue::new(0x16, VMType::Dword));
        assert!(infer_value(&disasm, &operand, 32).is_err());

        let unambiguous = SymbolicValue::new(0x10, VMType::Dword);
        assert_eq!(
            infer_value(&disasm, &unambiguous, 32).unwrap(),
            EmValue::Dword(0x40)
        );
    }
}
