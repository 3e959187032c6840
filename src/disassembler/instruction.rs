//! Decoded instructions, their data dependencies, and inference annotations.
//!
//! An [`Instruction`] is immutable in shape after decode; its
//! [`Dependencies`] and [`Annotation`] are filled in incrementally as the
//! inference engine discovers how the instruction participates in data flow.

use crate::{
    architecture::{ECallOp, ILCode, OpCode, VMRegister},
    disassembler::symbolic::SymbolicValue,
    metadata::Token,
};

/// The decoded inline operand of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// No operand.
    None,
    /// A register, already resolved against the constants table by the decoder.
    Register(VMRegister),
    /// A 32-bit immediate.
    ImmediateDword(u32),
    /// A 64-bit immediate.
    ImmediateQword(u64),
}

/// Ordered mapping from operand slot index to the symbolic value consumed there.
///
/// Slot 0 is the leftmost operand in natural (pre-pop) order. Because the
/// worklist may process one instruction under several merged program states,
/// slots accumulate: [`Dependencies::add_or_merge`] unions repeat observations
/// instead of replacing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    slots: Vec<SymbolicValue>,
}

impl Dependencies {
    /// Creates an empty dependency map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `value` at `slot`, merging when the slot already exists.
    ///
    /// Slots are created densely; recording slot `n` requires slots `0..n` to
    /// exist already, which the processor guarantees by recording in order.
    pub fn add_or_merge(&mut self, slot: u32, value: SymbolicValue) {
        let slot = slot as usize;
        if slot < self.slots.len() {
            self.slots[slot].merge(&value);
        } else {
            debug_assert_eq!(slot, self.slots.len(), "dependency slots must be dense");
            self.slots.push(value);
        }
    }

    /// The value recorded at `slot`.
    #[must_use]
    pub fn get(&self, slot: u32) -> Option<&SymbolicValue> {
        self.slots.get(slot as usize)
    }

    /// The highest recorded slot's value (the rightmost operand).
    #[must_use]
    pub fn last(&self) -> Option<&SymbolicValue> {
        self.slots.last()
    }

    /// Number of recorded slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` when no slots are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterates slots in natural order.
    pub fn iter(&self) -> impl Iterator<Item = &SymbolicValue> {
        self.slots.iter()
    }
}

/// The specialized payload of a `VCALL` annotation.
///
/// Each sub-opcode resolves its metadata operands to tokens during inference;
/// downstream lifting consumes the tokens directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VCallAnnotation {
    /// Bridge into a CIL method.
    ECall {
        /// The bridge operation variant.
        op: ECallOp,
        /// The invoked method.
        method: Token,
        /// Constraint type for constrained virtual calls.
        constraint: Option<Token>,
    },
    /// Box a value of the referenced type.
    Box {
        /// The boxed value type.
        type_token: Token,
    },
    /// Unbox to the referenced type.
    Unbox {
        /// The target value type.
        type_token: Token,
    },
    /// Cast to the referenced type.
    Cast {
        /// The target type.
        type_token: Token,
    },
    /// Load the referenced field.
    LdFld {
        /// The accessed field.
        field: Token,
    },
    /// Store to the referenced field.
    StFld {
        /// The accessed field.
        field: Token,
    },
    /// Load a runtime handle for the referenced token.
    Token {
        /// The referenced metadata entity.
        token: Token,
    },
    /// Throw the popped exception object.
    Throw,
    /// Size of the referenced type.
    SizeOf {
        /// The measured type.
        type_token: Token,
    },
    /// Zero-initialize storage of the referenced type.
    InitObj {
        /// The initialized type.
        type_token: Token,
    },
    /// Load a function pointer to the referenced method.
    LdFtn {
        /// The referenced method.
        method: Token,
    },
}

/// What the inference engine learned about one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationKind {
    /// Regular data-flow instruction.
    Plain,
    /// Control transfer with the inferred targets (empty when inference failed).
    Jump {
        /// Inferred concrete targets, in inference order.
        targets: Vec<u64>,
    },
    /// Call to an exported function.
    Call {
        /// Entry offset of the callee.
        address: u64,
        /// Export id of the callee.
        export_id: u32,
        /// Whether the callee produces a value in `R0`.
        returns_value: bool,
    },
    /// Resolved v-call sub-behaviour.
    VCall(VCallAnnotation),
}

/// Inference annotation: the shared stack-effect header plus a tagged payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Number of slots the instruction was observed to pop.
    pub inferred_pop: u32,
    /// Number of slots the instruction was observed to push.
    pub inferred_push: u32,
    /// The flavour-specific payload.
    pub kind: AnnotationKind,
}

impl Annotation {
    /// A plain annotation with the given stack effect.
    #[must_use]
    pub fn plain(inferred_pop: u32, inferred_push: u32) -> Self {
        Self {
            inferred_pop,
            inferred_push,
            kind: AnnotationKind::Plain,
        }
    }
}

/// One decoded VM instruction.
///
/// `offset`, `size`, `opcode`, and `operand` are fixed at decode time;
/// `dependencies` and `annotation` grow as inference visits the instruction
/// under (possibly several, merged) program states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Offset of the instruction inside the VM instruction stream.
    pub offset: u64,
    /// Encoded size in bytes.
    pub size: u8,
    /// The decoded opcode.
    pub opcode: ILCode,
    /// The decoded inline operand.
    pub operand: Operand,
    /// Data dependencies discovered by inference.
    pub dependencies: Dependencies,
    /// Inference annotation, absent until the instruction is first processed.
    pub annotation: Option<Annotation>,
}

impl Instruction {
    /// Creates a freshly decoded instruction with empty inference data.
    #[must_use]
    pub fn new(offset: u64, size: u8, opcode: ILCode, operand: Operand) -> Self {
        Self {
            offset,
            size,
            opcode,
            operand,
            dependencies: Dependencies::new(),
            annotation: None,
        }
    }

    /// The static descriptor of this instruction's opcode.
    #[must_use]
    pub fn descriptor(&self) -> &'static OpCode {
        self.opcode.opcode()
    }

    /// Offset of the byte after this instruction.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offset + u64::from(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::VMType;

    #[test]
    fn dependencies_are_dense_and_merge() {
        let mut deps = Dependencies::new();
        deps.add_or_merge(0, SymbolicValue::new(0x10, VMType::Dword));
        deps.add_or_merge(1, SymbolicValue::new(0x14, VMType::Ptr));
        deps.add_or_merge(0, SymbolicValue::new(0x18, VMType::Dword));

        assert_eq!(deps.len(), 2);
        assert_eq!(deps.get(0).unwrap().source_count(), 2);
        assert_eq!(deps.last().unwrap().ty(), VMType::Ptr);
    }

    #[test]
    fn instruction_next_offset() {
        let instr = Instruction::new(0x10, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(7));
        assert_eq!(instr.next_offset(), 0x16);
        assert!(instr.annotation.is_none());
        assert!(instr.dependencies.is_empty());
    }

    #[test]
    fn plain_annotation_header() {
        let ann = Annotation::plain(2, 1);
        assert_eq!(ann.inferred_pop, 2);
        assert_eq!(ann.inferred_push, 1);
        assert!(matches!(ann.kind, AnnotationKind::Plain));
    }
}
