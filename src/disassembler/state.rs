//! Program states and exception-frame tracking.
//!
//! A [`ProgramState`] is one point of the symbolic execution: instruction
//! pointer, the stream-cipher key needed to decode there, the symbolic stack,
//! the register file, and the stack of open protected regions. States fork at
//! branches and merge at join points; the merge is what turns the worklist
//! into a monotone fixed point.

use rustc_hash::FxHashMap;

use crate::{
    architecture::{EHType, VMRegister},
    disassembler::symbolic::{SymbolicStack, SymbolicValue},
    metadata::Token,
    Result,
};

/// A protected region open on a program state's handler stack.
///
/// Pushed by `TRY`, popped by `LEAVE`. The addresses are concrete: the
/// processor resolves them through the partial emulator when the region is
/// opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EHFrame {
    /// The clause kind.
    pub ty: EHType,
    /// Offset of the first instruction of the try body.
    pub try_start: u64,
    /// Entry offset of the handler block.
    pub handler_address: u64,
    /// Entry offset of the filter block (filter clauses only, 0 otherwise).
    pub filter_address: u64,
    /// The caught exception type (catch clauses only).
    pub catch_type: Option<Token>,
}

/// One point of the symbolic execution.
///
/// Cloning is deep for the stack, register file, and handler stack; the
/// symbolic values inside share their data-source storage by value (they are
/// never mutated through a clone).
#[derive(Debug, Clone, Default)]
pub struct ProgramState {
    /// Offset of the next instruction to decode.
    pub ip: u64,
    /// Stream-cipher key decoding the instruction at `ip`.
    pub key: u32,
    /// The symbolic evaluation stack.
    pub stack: SymbolicStack,
    /// Open protected regions, innermost last.
    pub eh_stack: Vec<EHFrame>,
    /// The symbolic register file; absent entries were never written.
    pub registers: FxHashMap<VMRegister, SymbolicValue>,
}

impl ProgramState {
    /// Creates the seed state of an export: entry offset and entry key, empty
    /// stack, empty register file.
    #[must_use]
    pub fn entry(ip: u64, key: u32) -> Self {
        Self {
            ip,
            key,
            ..Self::default()
        }
    }

    /// Reads a register's current symbolic value, if it was ever written.
    #[must_use]
    pub fn register(&self, register: VMRegister) -> Option<&SymbolicValue> {
        self.registers.get(&register)
    }

    /// Overwrites a register with a new symbolic value.
    pub fn set_register(&mut self, register: VMRegister, value: SymbolicValue) {
        self.registers.insert(register, value);
    }

    /// Merges another state observed at the same `(ip, key)` into this one.
    ///
    /// Stack slots merge pairwise, register files union (values for common
    /// registers merge, missing registers copy over). Returns `true` when
    /// anything changed, which schedules the merged state for reprocessing.
    ///
    /// # Errors
    ///
    /// Stack-depth or handler-stack disagreement between two states at one
    /// program point indicates a processor bug and surfaces as an internal
    /// error; the incoming state is dropped by the driver.
    pub fn merge_with(&mut self, other: &ProgramState) -> Result<bool> {
        debug_assert_eq!((self.ip, self.key), (other.ip, other.key));

        if self.eh_stack.len() != other.eh_stack.len() {
            return Err(internal_error!(
                "handler stack depth mismatch at {:#x}: {} vs {}",
                self.ip,
                self.eh_stack.len(),
                other.eh_stack.len()
            ));
        }

        let mut changed = self.stack.merge(&other.stack)?;

        for (register, incoming) in &other.registers {
            match self.registers.get_mut(register) {
                Some(current) => changed |= current.merge(incoming),
                None => {
                    self.registers.insert(*register, incoming.clone());
                    changed = true;
                }
            }
        }

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::VMType;

    #[test]
    fn entry_state_is_empty() {
        let state = ProgramState::entry(0x10, 0xAAAA_AAAA);
        assert_eq!(state.ip, 0x10);
        assert_eq!(state.key, 0xAAAA_AAAA);
        assert!(state.stack.is_empty());
        assert!(state.eh_stack.is_empty());
        assert!(state.registers.is_empty());
    }

    #[test]
    fn merge_unions_registers() {
        let mut a = ProgramState::entry(0x20, 1);
        a.set_register(VMRegister::R0, SymbolicValue::new(0x10, VMType::Dword));

        let mut b = ProgramState::entry(0x20, 1);
        b.set_register(VMRegister::R0, SymbolicValue::new(0x18, VMType::Dword));
        b.set_register(VMRegister::R1, SymbolicValue::new(0x1C, VMType::Ptr));

        assert!(a.merge_with(&b).unwrap());
        assert_eq!(a.register(VMRegister::R0).unwrap().source_count(), 2);
        assert!(a.register(VMRegister::R1).is_some());

        // A second merge of the same state is a no-op.
        assert!(!a.merge_with(&b).unwrap());
    }

    #[test]
    fn merge_rejects_handler_depth_mismatch() {
        let mut a = ProgramState::entry(0x20, 1);
        let mut b = ProgramState::entry(0x20, 1);
        b.eh_stack.push(EHFrame {
            ty: EHType::Finally,
            try_start: 0x24,
            handler_address: 0x80,
            filter_address: 0,
            catch_type: None,
        });
        assert!(a.merge_with(&b).is_err());
    }

    #[test]
    fn clone_is_deep_for_stack() {
        let mut a = ProgramState::entry(0x20, 1);
        a.stack.push(SymbolicValue::new(0x10, VMType::Dword));
        let mut b = a.clone();
        b.stack.pop(0x24).unwrap();
        assert_eq!(a.stack.depth(), 1);
        assert_eq!(b.stack.depth(), 0);
    }
}
