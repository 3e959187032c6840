//! The `VCALL` sub-dispatcher.
//!
//! `VCALL` is the VM's single polymorphic opcode: its first stack operand
//! selects a sub-behaviour (the metadata bridge, boxing, field access, token
//! loads, throwing, ...). Each sub-opcode declares its own pop shape over
//! metadata ids and value operands; the processor infers the ids to concrete
//! values, resolves them against the host metadata image, and rewrites the
//! instruction's annotation into the specialized form downstream lifting
//! consumes.
//!
//! Every sub-behaviour falls through to the next instruction, except `THROW`,
//! which terminates its state.

use crate::{
    architecture::{ECallOp, VMCall, VMType},
    disassembler::{
        emulator::infer_value,
        export::VMExportDisassembly,
        instruction::{Annotation, AnnotationKind, Dependencies, VCallAnnotation},
        processor::{InstructionProcessor, Transfer},
        state::ProgramState,
        symbolic::SymbolicValue,
    },
    metadata::{Token, TokenCategory},
    Result,
};

impl InstructionProcessor<'_> {
    /// Dispatches a `VCALL` instruction on its inferred selector.
    pub(crate) fn process_vcall(
        &self,
        disasm: &mut VMExportDisassembly,
        mut next: ProgramState,
        mut deps: Dependencies,
        offset: u64,
    ) -> Result<Transfer> {
        let selector_value = next.stack.pop(offset)?;
        deps.add_or_merge(0, selector_value.clone());
        let selector =
            infer_value(disasm, &selector_value, self.max_emulation_depth())?.as_u32() as u8;
        let call = self.constants().vcall(selector, offset)?;

        let mut ctx = VCallContext {
            processor: self,
            disasm: &*disasm,
            next: &mut next,
            deps: &mut deps,
            offset,
            pops: 1,
            pushes: 0,
        };

        let annotation = match call {
            VMCall::ECALL => ctx.ecall()?,
            VMCall::BOX => {
                let type_token = ctx.pop_type_token()?;
                ctx.pop_value()?;
                ctx.push(VMType::Object);
                VCallAnnotation::Box { type_token }
            }
            VMCall::UNBOX => {
                let type_token = ctx.pop_type_token()?;
                ctx.pop_value()?;
                let ty = ctx
                    .processor
                    .image()
                    .return_type(offset, type_token)?
                    .unwrap_or(VMType::Unknown);
                ctx.push(ty);
                VCallAnnotation::Unbox { type_token }
            }
            VMCall::CAST => {
                let type_token = ctx.pop_type_token()?;
                ctx.pop_value()?;
                ctx.push(VMType::Object);
                VCallAnnotation::Cast { type_token }
            }
            VMCall::LDFLD => {
                let field = ctx.pop_token(TokenCategory::FIELD)?;
                ctx.pop_value()?;
                let ty = ctx.processor.image().field_type(offset, field)?;
                ctx.push(ty);
                VCallAnnotation::LdFld { field }
            }
            VMCall::STFLD => {
                let field = ctx.pop_token(TokenCategory::FIELD)?;
                ctx.pop_value()?; // the stored value
                ctx.pop_value()?; // the object or pointer
                VCallAnnotation::StFld { field }
            }
            VMCall::TOKEN => {
                let token = ctx.pop_token(
                    TokenCategory::TYPE | TokenCategory::METHOD | TokenCategory::FIELD,
                )?;
                ctx.push(VMType::Ptr);
                VCallAnnotation::Token { token }
            }
            VMCall::THROW => {
                ctx.pop_value()?;
                VCallAnnotation::Throw
            }
            VMCall::SIZEOF => {
                let type_token = ctx.pop_type_token()?;
                ctx.push(VMType::Dword);
                VCallAnnotation::SizeOf { type_token }
            }
            VMCall::INITOBJ => {
                let type_token = ctx.pop_type_token()?;
                ctx.pop_value()?; // the storage pointer
                VCallAnnotation::InitObj { type_token }
            }
            VMCall::LDFTN => {
                let method = ctx.pop_token(TokenCategory::METHOD)?;
                ctx.push(VMType::Ptr);
                VCallAnnotation::LdFtn { method }
            }
        };

        let pops = ctx.pops;
        let pushes = ctx.pushes;
        let successors = if matches!(annotation, VCallAnnotation::Throw) {
            Vec::new()
        } else {
            vec![next]
        };

        Ok(Transfer {
            dependencies: deps,
            annotation: Annotation {
                inferred_pop: pops,
                inferred_push: pushes,
                kind: AnnotationKind::VCall(annotation),
            },
            successors,
        })
    }
}

/// Pop/push bookkeeping shared by all sub-behaviours.
struct VCallContext<'a, 'p> {
    processor: &'a InstructionProcessor<'p>,
    disasm: &'a VMExportDisassembly,
    next: &'a mut ProgramState,
    deps: &'a mut Dependencies,
    offset: u64,
    pops: u32,
    pushes: u32,
}

impl VCallContext<'_, '_> {
    /// Pops a value operand, recording it as the next dependency slot.
    fn pop_value(&mut self) -> Result<SymbolicValue> {
        let value = self.next.stack.pop(self.offset)?;
        self.deps.add_or_merge(self.pops, value.clone());
        self.pops += 1;
        Ok(value)
    }

    /// Pops an id operand and resolves it into the allowed token categories.
    fn pop_token(&mut self, allowed: TokenCategory) -> Result<Token> {
        let value = self.pop_value()?;
        let id = infer_value(self.disasm, &value, self.processor.max_emulation_depth())?.as_u32();
        self.processor
            .image()
            .resolve_reference(self.offset, id, allowed)
    }

    /// Pops an id operand constrained to type-shaped tokens.
    fn pop_type_token(&mut self) -> Result<Token> {
        self.pop_token(TokenCategory::TYPE)
    }

    /// Pushes a fresh result value produced by this `VCALL`.
    fn push(&mut self, ty: VMType) {
        self.next.stack.push(SymbolicValue::new(self.offset, ty));
        self.pushes += 1;
    }

    /// The metadata bridge: `call` / `callvirt` / `newobj`, with an optional
    /// constraint prefix. The packed operand carries the operation in its top
    /// two bits and the VM-level method id in the rest.
    fn ecall(&mut self) -> Result<VCallAnnotation> {
        let packed = self.pop_value()?;
        let raw = infer_value(self.disasm, &packed, self.processor.max_emulation_depth())?.as_u32();
        let op = self
            .processor
            .constants()
            .ecall_op((raw >> 30) as u8, self.offset)?;
        let method_id = raw & 0x3FFF_FFFF;
        let method = self.processor.image().resolve_reference(
            self.offset,
            method_id,
            TokenCategory::METHOD,
        )?;

        let constraint = if op == ECallOp::CALLVIRT_CONSTRAINED {
            Some(self.pop_type_token()?)
        } else {
            None
        };

        let shape = self.processor.image().method_shape(self.offset, method)?;
        let mut argument_count = shape.param_count;
        if shape.is_instance && op != ECallOp::NEWOBJ {
            argument_count += 1;
        }
        for _ in 0..argument_count {
            self.pop_value()?;
        }

        if op == ECallOp::NEWOBJ {
            self.push(VMType::Object);
        } else if let Some(ty) = shape.return_type {
            self.push(ty);
        }

        Ok(VCallAnnotation::ECall {
            op,
            method,
            constraint,
        })
    }
}
