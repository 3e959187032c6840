//! Instruction set of the virtual machine.
//!
//! Every opcode is described by a static [`OpCode`] descriptor in the [`OPCODES`]
//! table: stack behaviour, flow control, operand shape, and whether execution
//! rewrites the flags register. The descriptors drive the symbolic transfer
//! function generically, so opcodes with regular pop/push shapes need no
//! dedicated handling anywhere else.
//!
//! Mnemonics follow the `OP_TYPE` convention of the VM itself: `ADD_DWORD` adds
//! two 32-bit slots, `LIND_QWORD` loads a 64-bit value indirectly through a
//! pointer, `PUSHR_OBJECT` pushes a register holding an object reference.
//!
//! # Example
//!
//! ```rust
//! use koiscope::architecture::{FlowControl, ILCode};
//!
//! let descriptor = ILCode::JZ.opcode();
//! assert_eq!(descriptor.flow_control, FlowControl::ConditionalJump);
//! assert_eq!(descriptor.pop_behavior.slot_count(), Some(2));
//! ```

use strum::{EnumCount, EnumIter, FromRepr};

use crate::architecture::VMType;

/// The opcodes of the virtual machine.
///
/// The numeric encoding of each opcode inside an obfuscated binary is
/// randomized per build and resolved by the constants pass; this enum is the
/// build-independent identity. The discriminant doubles as the index into
/// [`OPCODES`].
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, FromRepr)]
#[repr(u8)]
pub enum ILCode {
    /// No operation.
    NOP,
    /// Pop the top slot into the register operand.
    POP,
    /// Push a register, typed as a byte.
    PUSHR_BYTE,
    /// Push a register, typed as a word.
    PUSHR_WORD,
    /// Push a register, typed as a dword.
    PUSHR_DWORD,
    /// Push a register, typed as a qword.
    PUSHR_QWORD,
    /// Push a register holding an object reference.
    PUSHR_OBJECT,
    /// Push a 32-bit immediate.
    PUSHI_DWORD,
    /// Push a 64-bit immediate.
    PUSHI_QWORD,
    /// Load a pointer indirectly through the popped pointer.
    LIND_PTR,
    /// Load a byte indirectly through the popped pointer.
    LIND_BYTE,
    /// Load a word indirectly through the popped pointer.
    LIND_WORD,
    /// Load a dword indirectly through the popped pointer.
    LIND_DWORD,
    /// Load a qword indirectly through the popped pointer.
    LIND_QWORD,
    /// Load an object reference indirectly through the popped pointer.
    LIND_OBJECT,
    /// Store a pointer indirectly: pops the address, then the value.
    SIND_PTR,
    /// Store a byte indirectly.
    SIND_BYTE,
    /// Store a word indirectly.
    SIND_WORD,
    /// Store a dword indirectly.
    SIND_DWORD,
    /// Store a qword indirectly.
    SIND_QWORD,
    /// Store an object reference indirectly.
    SIND_OBJECT,
    /// Sign-extend the low byte of a dword slot.
    SX_BYTE,
    /// Sign-extend the low word of a dword slot.
    SX_WORD,
    /// Sign-extend a dword slot to a qword.
    SX_DWORD,
    /// Zero-extend the low byte of a dword slot.
    ZX_BYTE,
    /// Zero-extend the low word of a dword slot.
    ZX_WORD,
    /// Bitwise NOR of two dwords (the VM's only primitive logic operator).
    NOR_DWORD,
    /// Bitwise NOR of two qwords.
    NOR_QWORD,
    /// 32-bit integer addition.
    ADD_DWORD,
    /// 64-bit integer addition.
    ADD_QWORD,
    /// 32-bit float addition.
    ADD_R32,
    /// 64-bit float addition.
    ADD_R64,
    /// 32-bit float subtraction.
    SUB_R32,
    /// 64-bit float subtraction.
    SUB_R64,
    /// 32-bit integer multiplication.
    MUL_DWORD,
    /// 64-bit integer multiplication.
    MUL_QWORD,
    /// 32-bit float multiplication.
    MUL_R32,
    /// 64-bit float multiplication.
    MUL_R64,
    /// 32-bit unsigned division.
    DIV_DWORD,
    /// 64-bit unsigned division.
    DIV_QWORD,
    /// 32-bit float division.
    DIV_R32,
    /// 64-bit float division.
    DIV_R64,
    /// 32-bit unsigned remainder.
    REM_DWORD,
    /// 64-bit unsigned remainder.
    REM_QWORD,
    /// 32-bit float remainder.
    REM_R32,
    /// 64-bit float remainder.
    REM_R64,
    /// 32-bit shift left: pops the count, then the value.
    SHL_DWORD,
    /// 64-bit shift left.
    SHL_QWORD,
    /// 32-bit shift right: pops the count, then the value.
    SHR_DWORD,
    /// 64-bit shift right.
    SHR_QWORD,
    /// Convert a dword integer to a 32-bit float.
    FCONV_R32,
    /// Convert a qword integer to a 64-bit float.
    FCONV_R64,
    /// Widen a 32-bit float to a 64-bit float.
    FCONV_R32_R64,
    /// Narrow a 64-bit float to a 32-bit float.
    FCONV_R64_R32,
    /// Reinterpret the top slot as a pointer.
    ICONV_PTR,
    /// Truncate a 64-bit float to a qword integer.
    ICONV_R64,
    /// Compare two object references, writing the flags register.
    CMP,
    /// Compare two dwords, writing the flags register.
    CMP_DWORD,
    /// Compare two qwords, writing the flags register.
    CMP_QWORD,
    /// Compare two 32-bit floats, writing the flags register.
    CMP_R32,
    /// Compare two 64-bit floats, writing the flags register.
    CMP_R64,
    /// Jump to the popped address when the popped condition is zero.
    JZ,
    /// Jump to the popped address when the popped condition is non-zero.
    JNZ,
    /// Unconditional jump to the popped address.
    JMP,
    /// Call the exported function at the popped address.
    CALL,
    /// Return: pops the return address, result travels in `R0`.
    RET,
    /// Polymorphic call; the popped selector picks the sub-behaviour.
    VCALL,
    /// Open a protected region; pops the clause description and handler address.
    TRY,
    /// Close the innermost protected region; pops the handler marker.
    LEAVE,
}

impl ILCode {
    /// Returns the static descriptor for this opcode.
    #[must_use]
    pub fn opcode(self) -> &'static OpCode {
        &OPCODES[self as usize]
    }
}

/// How an instruction transfers control to its successor(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowControl {
    /// Falls through to the next instruction.
    Next,
    /// Transfers to a single popped target.
    Jump,
    /// Transfers to a popped target or falls through.
    ConditionalJump,
    /// Calls into another function and (usually) resumes after the call site.
    Call,
    /// Terminates the current function.
    Return,
}

/// The shape of an instruction's inline operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandType {
    /// No operand.
    None,
    /// A register code, resolved against the constants table at decode time.
    Register,
    /// A 32-bit immediate.
    ImmediateDword,
    /// A 64-bit immediate.
    ImmediateQword,
}

/// The exact pop or push shape of an instruction.
///
/// Compound variants list slot types in stack order: the first name is the
/// slot popped first (top of stack). `PopVar`/`PushVar` mark the opcodes whose
/// slot count depends on runtime data (calls, the v-call dispatcher, protected
/// region setup) and which the processor handles with dedicated code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackBehavior {
    /// No slots.
    None,
    /// One slot of any type; the popped value keeps its inferred type.
    PopAny,
    /// One pointer slot.
    PopPtr,
    /// One dword slot.
    PopDword,
    /// One qword slot.
    PopQword,
    /// One 32-bit float slot.
    PopReal32,
    /// One 64-bit float slot.
    PopReal64,
    /// Two dword slots.
    PopDwordPopDword,
    /// Two qword slots.
    PopQwordPopQword,
    /// Two 32-bit float slots.
    PopReal32PopReal32,
    /// Two 64-bit float slots.
    PopReal64PopReal64,
    /// Two object slots.
    PopObjectPopObject,
    /// A pointer, then a slot of any type (conditional jumps).
    PopPtrPopAny,
    /// A pointer, then a pointer (indirect pointer store).
    PopPtrPopPtr,
    /// A pointer, then a byte.
    PopPtrPopByte,
    /// A pointer, then a word.
    PopPtrPopWord,
    /// A pointer, then a dword.
    PopPtrPopDword,
    /// A pointer, then a qword.
    PopPtrPopQword,
    /// A pointer, then an object reference.
    PopPtrPopObject,
    /// Data-dependent pop count.
    PopVar,
    /// One pointer result.
    PushPtr,
    /// One byte result.
    PushByte,
    /// One word result.
    PushWord,
    /// One dword result.
    PushDword,
    /// One qword result.
    PushQword,
    /// One 32-bit float result.
    PushReal32,
    /// One 64-bit float result.
    PushReal64,
    /// One object result.
    PushObject,
    /// Data-dependent push count.
    PushVar,
}

impl StackBehavior {
    /// The declared slot types, in stack order (top of stack first).
    ///
    /// Variable-shape behaviours return an empty slice; use [`Self::is_var`]
    /// to distinguish them from [`StackBehavior::None`].
    #[must_use]
    pub fn slot_types(&self) -> &'static [VMType] {
        match self {
            StackBehavior::None | StackBehavior::PopVar | StackBehavior::PushVar => &[],
            StackBehavior::PopAny => &[VMType::Unknown],
            StackBehavior::PopPtr | StackBehavior::PushPtr => &[VMType::Ptr],
            StackBehavior::PushByte => &[VMType::Byte],
            StackBehavior::PushWord => &[VMType::Word],
            StackBehavior::PopDword | StackBehavior::PushDword => &[VMType::Dword],
            StackBehavior::PopQword | StackBehavior::PushQword => &[VMType::Qword],
            StackBehavior::PopReal32 | StackBehavior::PushReal32 => &[VMType::Real32],
            StackBehavior::PopReal64 | StackBehavior::PushReal64 => &[VMType::Real64],
            StackBehavior::PushObject => &[VMType::Object],
            StackBehavior::PopDwordPopDword => &[VMType::Dword, VMType::Dword],
            StackBehavior::PopQwordPopQword => &[VMType::Qword, VMType::Qword],
            StackBehavior::PopReal32PopReal32 => &[VMType::Real32, VMType::Real32],
            StackBehavior::PopReal64PopReal64 => &[VMType::Real64, VMType::Real64],
            StackBehavior::PopObjectPopObject => &[VMType::Object, VMType::Object],
            StackBehavior::PopPtrPopAny => &[VMType::Ptr, VMType::Unknown],
            StackBehavior::PopPtrPopPtr => &[VMType::Ptr, VMType::Ptr],
            StackBehavior::PopPtrPopByte => &[VMType::Ptr, VMType::Byte],
            StackBehavior::PopPtrPopWord => &[VMType::Ptr, VMType::Word],
            StackBehavior::PopPtrPopDword => &[VMType::Ptr, VMType::Dword],
            StackBehavior::PopPtrPopQword => &[VMType::Ptr, VMType::Qword],
            StackBehavior::PopPtrPopObject => &[VMType::Ptr, VMType::Object],
        }
    }

    /// Number of slots, or `None` for the variable-shape behaviours.
    #[must_use]
    pub fn slot_count(&self) -> Option<u32> {
        if self.is_var() {
            None
        } else {
            Some(self.slot_types().len() as u32)
        }
    }

    /// The declared type of slot `index` (stack order), `Unknown` out of range.
    #[must_use]
    pub fn slot_type(&self, index: u32) -> VMType {
        self.slot_types()
            .get(index as usize)
            .copied()
            .unwrap_or(VMType::Unknown)
    }

    /// The result type of a push behaviour (its single slot).
    #[must_use]
    pub fn result_type(&self) -> VMType {
        self.slot_type(0)
    }

    /// Returns `true` for `PopVar`/`PushVar`.
    #[must_use]
    pub fn is_var(&self) -> bool {
        matches!(self, StackBehavior::PopVar | StackBehavior::PushVar)
    }
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCode {
    /// The opcode identity.
    pub code: ILCode,
    /// Whether executing the instruction rewrites the flags register.
    pub affects_flags: bool,
    /// How many slots the instruction pops, and their types.
    pub pop_behavior: StackBehavior,
    /// What the instruction pushes.
    pub push_behavior: StackBehavior,
    /// The inline operand shape.
    pub operand_type: OperandType,
    /// How the instruction transfers control.
    pub flow_control: FlowControl,
}

const fn op(
    code: ILCode,
    affects_flags: bool,
    pop_behavior: StackBehavior,
    push_behavior: StackBehavior,
    operand_type: OperandType,
    flow_control: FlowControl,
) -> OpCode {
    OpCode {
        code,
        affects_flags,
        pop_behavior,
        push_behavior,
        operand_type,
        flow_control,
    }
}

use self::{FlowControl as F, ILCode as I, OperandType as O, StackBehavior as S};

/// Descriptor table, indexed by [`ILCode`] discriminant.
pub static OPCODES: [OpCode; ILCode::COUNT] = [
    op(I::NOP, false, S::None, S::None, O::None, F::Next),
    op(I::POP, false, S::PopAny, S::None, O::Register, F::Next),
    op(I::PUSHR_BYTE, false, S::None, S::PushByte, O::Register, F::Next),
    op(I::PUSHR_WORD, false, S::None, S::PushWord, O::Register, F::Next),
    op(I::PUSHR_DWORD, false, S::None, S::PushDword, O::Register, F::Next),
    op(I::PUSHR_QWORD, false, S::None, S::PushQword, O::Register, F::Next),
    op(I::PUSHR_OBJECT, false, S::None, S::PushObject, O::Register, F::Next),
    op(I::PUSHI_DWORD, false, S::None, S::PushDword, O::ImmediateDword, F::Next),
    op(I::PUSHI_QWORD, false, S::None, S::PushQword, O::ImmediateQword, F::Next),
    op(I::LIND_PTR, false, S::PopPtr, S::PushPtr, O::None, F::Next),
    op(I::LIND_BYTE, false, S::PopPtr, S::PushByte, O::None, F::Next),
    op(I::LIND_WORD, false, S::PopPtr, S::PushWord, O::None, F::Next),
    op(I::LIND_DWORD, false, S::PopPtr, S::PushDword, O::None, F::Next),
    op(I::LIND_QWORD, false, S::PopPtr, S::PushQword, O::None, F::Next),
    op(I::LIND_OBJECT, false, S::PopPtr, S::PushObject, O::None, F::Next),
    op(I::SIND_PTR, false, S::PopPtrPopPtr, S::None, O::None, F::Next),
    op(I::SIND_BYTE, false, S::PopPtrPopByte, S::None, O::None, F::Next),
    op(I::SIND_WORD, false, S::PopPtrPopWord, S::None, O::None, F::Next),
    op(I::SIND_DWORD, false, S::PopPtrPopDword, S::None, O::None, F::Next),
    op(I::SIND_QWORD, false, S::PopPtrPopQword, S::None, O::None, F::Next),
    op(I::SIND_OBJECT, false, S::PopPtrPopObject, S::None, O::None, F::Next),
    op(I::SX_BYTE, false, S::PopDword, S::PushDword, O::None, F::Next),
    op(I::SX_WORD, false, S::PopDword, S::PushDword, O::None, F::Next),
    op(I::SX_DWORD, false, S::PopDword, S::PushQword, O::None, F::Next),
    op(I::ZX_BYTE, false, S::PopDword, S::PushDword, O::None, F::Next),
    op(I::ZX_WORD, false, S::PopDword, S::PushDword, O::None, F::Next),
    op(I::NOR_DWORD, true, S::PopDwordPopDword, S::PushDword, O::None, F::Next),
    op(I::NOR_QWORD, true, S::PopQwordPopQword, S::PushQword, O::None, F::Next),
    op(I::ADD_DWORD, true, S::PopDwordPopDword, S::PushDword, O::None, F::Next),
    op(I::ADD_QWORD, true, S::PopQwordPopQword, S::PushQword, O::None, F::Next),
    op(I::ADD_R32, true, S::PopReal32PopReal32, S::PushReal32, O::None, F::Next),
    op(I::ADD_R64, true, S::PopReal64PopReal64, S::PushReal64, O::None, F::Next),
    op(I::SUB_R32, true, S::PopReal32PopReal32, S::PushReal32, O::None, F::Next),
    op(I::SUB_R64, true, S::PopReal64PopReal64, S::PushReal64, O::None, F::Next),
    op(I::MUL_DWORD, true, S::PopDwordPopDword, S::PushDword, O::None, F::Next),
    op(I::MUL_QWORD, true, S::PopQwordPopQword, S::PushQword, O::None, F::Next),
    op(I::MUL_R32, true, S::PopReal32PopReal32, S::PushReal32, O::None, F::Next),
    op(I::MUL_R64, true, S::PopReal64PopReal64, S::PushReal64, O::None, F::Next),
    op(I::DIV_DWORD, true, S::PopDwordPopDword, S::PushDword, O::None, F::Next),
    op(I::DIV_QWORD, true, S::PopQwordPopQword, S::PushQword, O::None, F::Next),
    op(I::DIV_R32, true, S::PopReal32PopReal32, S::PushReal32, O::None, F::Next),
    op(I::DIV_R64, true, S::PopReal64PopReal64, S::PushReal64, O::None, F::Next),
    op(I::REM_DWORD, true, S::PopDwordPopDword, S::PushDword, O::None, F::Next),
    op(I::REM_QWORD, true, S::PopQwordPopQword, S::PushQword, O::None, F::Next),
    op(I::REM_R32, true, S::PopReal32PopReal32, S::PushReal32, O::None, F::Next),
    op(I::REM_R64, true, S::PopReal64PopReal64, S::PushReal64, O::None, F::Next),
    op(I::SHL_DWORD, true, S::PopDwordPopDword, S::PushDword, O::None, F::Next),
    op(I::SHL_QWORD, true, S::PopQwordPopQword, S::PushQword, O::None, F::Next),
    op(I::SHR_DWORD, true, S::PopDwordPopDword, S::PushDword, O::None, F::Next),
    op(I::SHR_QWORD, true, S::PopQwordPopQword, S::PushQword, O::None, F::Next),
    op(I::FCONV_R32, false, S::PopDword, S::PushReal32, O::None, F::Next),
    op(I::FCONV_R64, false, S::PopQword, S::PushReal64, O::None, F::Next),
    op(I::FCONV_R32_R64, false, S::PopReal32, S::PushReal64, O::None, F::Next),
    op(I::FCONV_R64_R32, false, S::PopReal64, S::PushReal32, O::None, F::Next),
    op(I::ICONV_PTR, false, S::PopAny, S::PushPtr, O::None, F::Next),
    op(I::ICONV_R64, false, S::PopReal64, S::PushQword, O::None, F::Next),
    op(I::CMP, true, S::PopObjectPopObject, S::None, O::None, F::Next),
    op(I::CMP_DWORD, true, S::PopDwordPopDword, S::None, O::None, F::Next),
    op(I::CMP_QWORD, true, S::PopQwordPopQword, S::None, O::None, F::Next),
    op(I::CMP_R32, true, S::PopReal32PopReal32, S::None, O::None, F::Next),
    op(I::CMP_R64, true, S::PopReal64PopReal64, S::None, O::None, F::Next),
    op(I::JZ, false, S::PopPtrPopAny, S::None, O::None, F::ConditionalJump),
    op(I::JNZ, false, S::PopPtrPopAny, S::None, O::None, F::ConditionalJump),
    op(I::JMP, false, S::PopPtr, S::None, O::None, F::Jump),
    op(I::CALL, false, S::PopVar, S::None, O::None, F::Call),
    op(I::RET, false, S::PopPtr, S::None, O::None, F::Return),
    op(I::VCALL, false, S::PopVar, S::PushVar, O::None, F::Call),
    op(I::TRY, false, S::PopVar, S::None, O::None, F::Next),
    op(I::LEAVE, false, S::PopAny, S::None, O::None, F::Next),
];

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn table_is_indexed_by_discriminant() {
        for code in ILCode::iter() {
            assert_eq!(
                OPCODES[code as usize].code, code,
                "descriptor table out of order at {code:?}"
            );
        }
    }

    #[test]
    fn descriptor_lookup() {
        let add = ILCode::ADD_DWORD.opcode();
        assert!(add.affects_flags);
        assert_eq!(add.pop_behavior.slot_count(), Some(2));
        assert_eq!(add.push_behavior.result_type(), VMType::Dword);
        assert_eq!(add.flow_control, FlowControl::Next);
    }

    #[test]
    fn variable_shapes_are_marked() {
        assert!(ILCode::CALL.opcode().pop_behavior.is_var());
        assert!(ILCode::VCALL.opcode().pop_behavior.is_var());
        assert!(ILCode::VCALL.opcode().push_behavior.is_var());
        assert!(ILCode::TRY.opcode().pop_behavior.is_var());
        assert_eq!(ILCode::CALL.opcode().pop_behavior.slot_count(), None);
    }

    #[test]
    fn conditional_jumps_pop_target_first() {
        let jz = ILCode::JZ.opcode();
        assert_eq!(jz.pop_behavior.slot_type(0), VMType::Ptr);
        assert_eq!(jz.pop_behavior.slot_type(1), VMType::Unknown);
    }

    #[test]
    fn flag_writers_are_arithmetic_and_compare() {
        for code in ILCode::iter() {
            let descriptor = code.opcode();
            if matches!(
                code,
                ILCode::CMP
                    | ILCode::CMP_DWORD
                    | ILCode::CMP_QWORD
                    | ILCode::CMP_R32
                    | ILCode::CMP_R64
            ) {
                assert!(descriptor.affects_flags);
            }
            if matches!(code, ILCode::NOP | ILCode::JMP | ILCode::RET | ILCode::TRY) {
                assert!(!descriptor.affects_flags);
            }
        }
    }

    #[test]
    fn register_operands() {
        assert_eq!(ILCode::POP.opcode().operand_type, OperandType::Register);
        assert_eq!(
            ILCode::PUSHR_DWORD.opcode().operand_type,
            OperandType::Register
        );
        assert_eq!(
            ILCode::PUSHI_QWORD.opcode().operand_type,
            OperandType::ImmediateQword
        );
        assert_eq!(ILCode::ADD_QWORD.opcode().operand_type, OperandType::None);
    }
}
