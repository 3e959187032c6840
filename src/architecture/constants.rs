//! The resolved constants table of one obfuscated binary.
//!
//! The obfuscator randomizes every numeric encoding per build: opcode bytes,
//! register codes, flag bits, v-call selectors, and exception clause ids are
//! all shuffled, and the mapping is only recoverable from the one-time static
//! initializer of the bundled interpreter. A separate constants-resolution
//! pass recovers that mapping; the disassembler consumes the result as a
//! [`VMConstants`] value and never touches the host binary itself.

use rustc_hash::FxHashMap;

use crate::{
    architecture::{ILCode, VMFlags, VMRegister},
    Error, Result,
};

/// Sub-opcodes of the polymorphic `VCALL` instruction.
///
/// `VCALL`'s first stack operand selects one of these behaviours; each has its
/// own pop shape over metadata tokens and stack operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VMCall {
    /// Bridge into a CIL method (call / callvirt / newobj), see [`ECallOp`].
    ECALL,
    /// Box a value type.
    BOX,
    /// Unbox to a value type.
    UNBOX,
    /// Cast an object reference.
    CAST,
    /// Load a field.
    LDFLD,
    /// Store a field.
    STFLD,
    /// Load a metadata token handle.
    TOKEN,
    /// Throw the popped exception object.
    THROW,
    /// Size of a type in bytes.
    SIZEOF,
    /// Zero-initialize the storage behind the popped pointer.
    INITOBJ,
    /// Load a function pointer.
    LDFTN,
}

/// Operation variants of the [`VMCall::ECALL`] bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ECallOp {
    /// Direct call.
    CALL,
    /// Virtual call.
    CALLVIRT,
    /// Object construction.
    NEWOBJ,
    /// Virtual call with a constraint type prefix.
    CALLVIRT_CONSTRAINED,
}

/// The kind of an exception-handler clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EHType {
    /// Typed catch handler.
    Catch,
    /// Filtered handler with a filter expression block.
    Filter,
    /// Fault handler (runs on exceptional exit only). The VM never emits one.
    Fault,
    /// Finally handler.
    Finally,
}

/// The fully resolved constants table of one obfuscated binary.
///
/// Maps the per-build byte encodings to their build-independent identities.
/// Produced externally; the disassembler validates it once at construction and
/// then shares it read-only across the whole run.
#[derive(Debug, Clone, Default)]
pub struct VMConstants {
    /// Register code -> register.
    pub registers: FxHashMap<u8, VMRegister>,
    /// Flag bit value -> flag.
    pub flags: FxHashMap<u8, VMFlags>,
    /// Opcode byte -> opcode.
    pub opcodes: FxHashMap<u8, ILCode>,
    /// V-call selector byte -> sub-opcode.
    pub vcalls: FxHashMap<u8, VMCall>,
    /// ECALL operation code -> operation.
    pub ecall_opcodes: FxHashMap<u8, ECallOp>,
    /// Id of the interpreter's initialization helper.
    pub helper_init: u8,
    /// Flag value marking an instance call in the ECALL bridge.
    pub flag_instance: u8,
    /// Exception clause id -> clause kind.
    pub eh_types: FxHashMap<u8, EHType>,
}

impl VMConstants {
    /// Checks that the table is usable: every category map populated and injective.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConstants`] naming the first offending category.
    /// A failed validation is fatal; no analysis can start from a table that
    /// does not round-trip the encodings.
    pub fn validate(&self) -> Result<()> {
        fn check<V: std::hash::Hash + Eq + Copy>(
            name: &str,
            map: &FxHashMap<u8, V>,
        ) -> Result<()> {
            if map.is_empty() {
                return Err(Error::InvalidConstants(format!("{name} map is empty")));
            }
            let mut seen = rustc_hash::FxHashSet::default();
            for value in map.values() {
                if !seen.insert(*value) {
                    return Err(Error::InvalidConstants(format!(
                        "{name} map assigns one identity to multiple encodings"
                    )));
                }
            }
            Ok(())
        }

        check("register", &self.registers)?;
        check("flags", &self.flags)?;
        check("opcode", &self.opcodes)?;
        check("vcall", &self.vcalls)?;
        check("ecall", &self.ecall_opcodes)?;
        check("eh-type", &self.eh_types)?;
        Ok(())
    }

    /// Resolves a v-call selector byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] when the byte encodes no known sub-opcode;
    /// `offset` names the dispatching instruction for diagnostics.
    pub fn vcall(&self, selector: u8, offset: u64) -> Result<VMCall> {
        self.vcalls
            .get(&selector)
            .copied()
            .ok_or_else(|| Error::Unsupported {
                offset,
                message: format!("unknown v-call selector {selector:#04x}"),
            })
    }

    /// Resolves an ECALL operation code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] when the code encodes no known operation.
    pub fn ecall_op(&self, code: u8, offset: u64) -> Result<ECallOp> {
        self.ecall_opcodes
            .get(&code)
            .copied()
            .ok_or_else(|| Error::Unsupported {
                offset,
                message: format!("unknown ecall operation {code:#04x}"),
            })
    }

    /// Resolves an exception clause id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] when the id encodes no known clause kind.
    pub fn eh_type(&self, id: u8, offset: u64) -> Result<EHType> {
        self.eh_types
            .get(&id)
            .copied()
            .ok_or_else(|| Error::Unsupported {
                offset,
                message: format!("unknown exception clause id {id:#04x}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VMConstants {
        let mut constants = VMConstants::default();
        constants.registers.insert(0, VMRegister::R0);
        constants.flags.insert(4, VMFlags::ZERO);
        constants.opcodes.insert(0x10, ILCode::NOP);
        constants.vcalls.insert(1, VMCall::ECALL);
        constants.ecall_opcodes.insert(0, ECallOp::CALL);
        constants.eh_types.insert(0, EHType::Catch);
        constants
    }

    #[test]
    fn valid_table_passes() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn empty_category_fails() {
        let mut constants = sample();
        constants.vcalls.clear();
        let err = constants.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConstants(_)));
        assert!(err.to_string().contains("vcall"));
    }

    #[test]
    fn duplicate_identity_fails() {
        let mut constants = sample();
        constants.opcodes.insert(0x11, ILCode::NOP);
        assert!(constants.validate().is_err());
    }

    #[test]
    fn flags_category_is_validated() {
        let mut constants = sample();
        constants.flags.clear();
        let err = constants.validate().unwrap_err();
        assert!(err.to_string().contains("flags"));

        let mut constants = sample();
        constants.flags.insert(8, VMFlags::ZERO);
        assert!(constants.validate().is_err());
    }

    #[test]
    fn unknown_selector_is_unsupported() {
        let constants = sample();
        assert!(constants.vcall(1, 0).is_ok());
        let err = constants.vcall(9, 0x20).unwrap_err();
        assert!(matches!(err, Error::Unsupported { offset: 0x20, .. }));
    }
}
