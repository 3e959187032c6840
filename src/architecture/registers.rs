//! Register file and value-type model of the virtual machine.
//!
//! The VM is a register-assisted stack machine: most data flows through the
//! evaluation stack, but a small register file carries call results, the flags
//! word, and the interpreter's own bookkeeping (stack/base pointer, cipher keys).
//! Everything on the stack and in registers is an 8-byte slot tagged with a
//! [`VMType`].

use bitflags::bitflags;
use strum::{EnumCount, EnumIter, FromRepr};

/// A register of the virtual machine.
///
/// `R0`..`R7` are general purpose (`R0` receives function call results). The
/// remainder are interpreter state: base/stack pointer, instruction pointer,
/// flags word, the two key registers used by the stream cipher, and two
/// scratch registers the obfuscator spills into.
///
/// The numeric encoding of each register inside an obfuscated binary is
/// randomized per build; the resolved mapping arrives through
/// [`crate::architecture::VMConstants::registers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumCount, EnumIter, FromRepr)]
#[repr(u8)]
pub enum VMRegister {
    /// General purpose register 0; function results land here.
    R0,
    /// General purpose register 1.
    R1,
    /// General purpose register 2.
    R2,
    /// General purpose register 3.
    R3,
    /// General purpose register 4.
    R4,
    /// General purpose register 5.
    R5,
    /// General purpose register 6.
    R6,
    /// General purpose register 7.
    R7,
    /// Base pointer of the current VM frame.
    BP,
    /// Stack pointer.
    SP,
    /// Instruction pointer.
    IP,
    /// Flags word, written by every flag-affecting instruction.
    FL,
    /// First stream-cipher key register.
    K1,
    /// Second stream-cipher key register.
    K2,
    /// Scratch register 1.
    M1,
    /// Scratch register 2.
    M2,
}

bitflags! {
    /// Bits of the VM flags register.
    ///
    /// Comparison and arithmetic opcodes combine these into the `FL` register;
    /// conditional jumps test them. The bit positions are randomized per build
    /// and resolved into [`crate::architecture::VMConstants::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VMFlags: u8 {
        /// Arithmetic overflow.
        const OVERFLOW = 0x01;
        /// Carry / borrow.
        const CARRY = 0x02;
        /// Result was zero.
        const ZERO = 0x04;
        /// Result was negative.
        const SIGN = 0x08;
        /// Comparison treats operands as unsigned.
        const UNSIGNED = 0x10;
        /// Behavioural flag 1 (interpreter internal).
        const BEHAV1 = 0x20;
        /// Behavioural flag 2 (interpreter internal).
        const BEHAV2 = 0x40;
        /// Behavioural flag 3 (interpreter internal).
        const BEHAV3 = 0x80;
    }
}

/// The inferred type of a VM stack slot or register.
///
/// Slots are untyped 8-byte cells at runtime; the disassembler reconstructs a
/// type for each one from the stack behaviour of the instructions that produce
/// and consume it. `Unknown` is both the starting point and the widening result
/// of conflicting evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VMType {
    /// No type evidence, or conflicting evidence.
    #[default]
    Unknown,
    /// 8-bit integer.
    Byte,
    /// 16-bit integer.
    Word,
    /// 32-bit integer.
    Dword,
    /// 64-bit integer.
    Qword,
    /// 32-bit IEEE float.
    Real32,
    /// 64-bit IEEE float.
    Real64,
    /// Native-width pointer (addresses inside the instruction stream included).
    Ptr,
    /// Managed object reference.
    Object,
}

impl VMType {
    /// Widens two type observations to their least upper bound.
    ///
    /// Any specific type joined with `Unknown` keeps the specific type;
    /// two different specific types widen to `Unknown`.
    #[must_use]
    pub fn widen(self, other: VMType) -> VMType {
        match (self, other) {
            (a, b) if a == b => a,
            (VMType::Unknown, b) => b,
            (a, VMType::Unknown) => a,
            _ => VMType::Unknown,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn register_repr_roundtrip() {
        for (index, register) in VMRegister::iter().enumerate() {
            assert_eq!(VMRegister::from_repr(index as u8), Some(register));
        }
        assert_eq!(VMRegister::COUNT, 16);
    }

    #[test]
    fn widen_is_commutative_and_idempotent() {
        let types = [
            VMType::Unknown,
            VMType::Byte,
            VMType::Dword,
            VMType::Qword,
            VMType::Ptr,
            VMType::Object,
        ];
        for a in types {
            assert_eq!(a.widen(a), a);
            for b in types {
                assert_eq!(a.widen(b), b.widen(a));
            }
        }
    }

    #[test]
    fn widen_unknown_is_identity() {
        assert_eq!(VMType::Unknown.widen(VMType::Ptr), VMType::Ptr);
        assert_eq!(VMType::Object.widen(VMType::Unknown), VMType::Object);
    }

    #[test]
    fn widen_conflict_loses_precision() {
        assert_eq!(VMType::Dword.widen(VMType::Object), VMType::Unknown);
        assert_eq!(VMType::Real32.widen(VMType::Real64), VMType::Unknown);
    }
}
