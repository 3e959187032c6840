//! The per-instruction symbolic transfer function.
//!
//! [`InstructionProcessor::next_states`] is the heart of the inference engine:
//! given a program state positioned on a decoded instruction, it pops and
//! pushes symbolic values according to the opcode's declared stack behaviour,
//! records the popped values as the instruction's data dependencies, annotates
//! the instruction with what was learned, and fans the state out into its
//! successors.
//!
//! Regular opcodes are driven entirely by their [`StackBehavior`] descriptors.
//! Four opcodes get dedicated paths: `CALL` (export resolution and exit-key
//! chaining), `RET` (exit-key pinning), `TRY`/`LEAVE` (protected-region
//! tracking), and `VCALL` (the polymorphic dispatcher, implemented in the
//! sibling `vcall` module).

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{
    architecture::{
        EHType, FlowControl, ILCode, OperandType, StackBehavior, VMConstants, VMRegister, VMType,
    },
    disassembler::{
        emulator::{infer_value, PartialEmulator},
        export::{ExportDirectory, VMExportDisassembly},
        instruction::{Annotation, AnnotationKind, Dependencies, Operand},
        state::{EHFrame, ProgramState},
        symbolic::SymbolicValue,
    },
    metadata::{MetadataImage, TokenCategory},
    Error, Result,
};

/// Exit keys discovered so far, keyed by export id.
///
/// Written by `RET` processing, read by `CALL` processing; the driver owns the
/// table because it spans all exports of one run.
pub(crate) type ExitKeyTable = FxHashMap<u32, u32>;

/// What one invocation of the transfer function produced.
pub(crate) struct Transfer {
    pub dependencies: Dependencies,
    pub annotation: Annotation,
    pub successors: Vec<ProgramState>,
}

/// The symbolic transfer function over one export's disassembly record.
pub(crate) struct InstructionProcessor<'a> {
    constants: &'a VMConstants,
    image: &'a dyn MetadataImage,
    exports: &'a ExportDirectory,
    max_emulation_depth: usize,
}

impl<'a> InstructionProcessor<'a> {
    pub(crate) fn new(
        constants: &'a VMConstants,
        image: &'a dyn MetadataImage,
        exports: &'a ExportDirectory,
        max_emulation_depth: usize,
    ) -> Self {
        Self {
            constants,
            image,
            exports,
            max_emulation_depth,
        }
    }

    pub(crate) fn constants(&self) -> &VMConstants {
        self.constants
    }

    pub(crate) fn image(&self) -> &dyn MetadataImage {
        self.image
    }

    pub(crate) fn max_emulation_depth(&self) -> usize {
        self.max_emulation_depth
    }

    /// Runs the transfer function for the instruction at `state.ip`.
    ///
    /// The instruction must already be recorded in `disasm`. On success the
    /// caller writes the returned dependencies and annotation back into the
    /// instruction and schedules the successor states; on error the state is
    /// dropped (and, for call-shaped failures, the offset may have been added
    /// to the unresolved set).
    pub(crate) fn next_states(
        &self,
        disasm: &mut VMExportDisassembly,
        exit_keys: &mut ExitKeyTable,
        state: &ProgramState,
        next_key: u32,
    ) -> Result<Transfer> {
        let offset = state.ip;
        let instr = disasm
            .instruction(offset)
            .ok_or_else(|| internal_error!("no instruction recorded at {:#x}", offset))?;
        let opcode = instr.opcode;
        let operand = instr.operand;
        let size = instr.size;
        let mut deps = instr.dependencies.clone();

        let mut next = state.clone();
        next.ip = offset + u64::from(size);
        next.key = next_key;

        let descriptor = opcode.opcode();
        if descriptor.affects_flags {
            next.set_register(VMRegister::FL, SymbolicValue::new(offset, VMType::Byte));
        }

        match opcode {
            ILCode::CALL => self.process_call(disasm, exit_keys, next, deps, offset),
            ILCode::RET => self.process_ret(disasm, exit_keys, next, deps, offset),
            ILCode::TRY => self.process_try(disasm, next, deps, offset),
            ILCode::LEAVE => self.process_leave(next, deps, offset),
            ILCode::VCALL => self.process_vcall(disasm, next, deps, offset),
            _ => self.process_default(disasm, next, deps, offset, opcode, operand),
        }
    }

    /// The generic path: descriptor-driven pops and pushes, then flow dispatch.
    fn process_default(
        &self,
        disasm: &mut VMExportDisassembly,
        mut next: ProgramState,
        mut deps: Dependencies,
        offset: u64,
        opcode: ILCode,
        operand: Operand,
    ) -> Result<Transfer> {
        let descriptor = opcode.opcode();

        // Pop phase. Slot 0 is the top of the stack; dependencies are recorded
        // in reverse pop order so that slot 0 names the leftmost operand.
        let Some(pop_count) = descriptor.pop_behavior.slot_count() else {
            return Err(internal_error!(
                "variable pop shape reached the default path for {:?}",
                descriptor.code
            ));
        };

        let mut popped = Vec::with_capacity(pop_count as usize);
        for slot in 0..pop_count {
            let mut value = next.stack.pop(offset)?;
            let declared = descriptor.pop_behavior.slot_type(slot);
            if declared != VMType::Unknown {
                value.set_type(declared);
            }
            if slot == 0 && descriptor.operand_type == OperandType::Register {
                // A register store: the register now holds whatever was popped.
                let Operand::Register(register) = operand else {
                    return Err(internal_error!(
                        "{:?} decoded without a register operand",
                        descriptor.code
                    ));
                };
                next.set_register(register, SymbolicValue::new(offset, value.ty()));
            }
            popped.push(value);
        }
        let inferred_pop = popped.len() as u32;
        for (slot, value) in popped.into_iter().rev().enumerate() {
            deps.add_or_merge(slot as u32, value);
        }

        // A register load depends on the register's current producers, so the
        // partial emulator can chase addresses through register traffic.
        if pop_count == 0 && descriptor.operand_type == OperandType::Register {
            let Operand::Register(register) = operand else {
                return Err(internal_error!(
                    "{:?} decoded without a register operand",
                    descriptor.code
                ));
            };
            if let Some(value) = next.register(register) {
                deps.add_or_merge(0, value.clone());
            }
        }

        // Push phase.
        let inferred_push = match descriptor.push_behavior {
            StackBehavior::None => 0,
            behavior if behavior.is_var() => {
                return Err(internal_error!(
                    "variable push shape reached the default path for {:?}",
                    descriptor.code
                ));
            }
            behavior if behavior.slot_count() == Some(1) => {
                next.stack
                    .push(SymbolicValue::new(offset, behavior.result_type()));
                1
            }
            behavior => {
                return Err(internal_error!(
                    "compound push shape {behavior:?} for {:?}",
                    descriptor.code
                ));
            }
        };

        // Flow phase.
        match descriptor.flow_control {
            FlowControl::Next => Ok(Transfer {
                dependencies: deps,
                annotation: Annotation::plain(inferred_pop, inferred_push),
                successors: vec![next],
            }),
            FlowControl::Jump => {
                disasm.add_block_header(next.ip);
                match self.infer_jump_targets(disasm, &deps, offset) {
                    Ok(targets) => {
                        for &target in &targets {
                            disasm.add_block_header(target);
                        }
                        next.ip = targets[0];
                        Ok(Transfer {
                            dependencies: deps,
                            annotation: Annotation {
                                inferred_pop,
                                inferred_push,
                                kind: AnnotationKind::Jump { targets },
                            },
                            successors: vec![next],
                        })
                    }
                    Err(error) => {
                        warn!(offset, %error, "jump targets left unresolved");
                        Ok(Transfer {
                            dependencies: deps,
                            annotation: Annotation {
                                inferred_pop,
                                inferred_push,
                                kind: AnnotationKind::Jump {
                                    targets: Vec::new(),
                                },
                            },
                            successors: Vec::new(),
                        })
                    }
                }
            }
            FlowControl::ConditionalJump => {
                let mut successors = Vec::new();
                let targets = match self.infer_jump_targets(disasm, &deps, offset) {
                    Ok(targets) => {
                        for &target in &targets {
                            disasm.add_block_header(target);
                            let mut taken = next.clone();
                            taken.ip = target;
                            successors.push(taken);
                        }
                        targets
                    }
                    Err(error) => {
                        warn!(offset, %error, "branch targets left unresolved");
                        Vec::new()
                    }
                };
                disasm.add_block_header(next.ip);
                successors.push(next);
                Ok(Transfer {
                    dependencies: deps,
                    annotation: Annotation {
                        inferred_pop,
                        inferred_push,
                        kind: AnnotationKind::Jump { targets },
                    },
                    successors,
                })
            }
            FlowControl::Call | FlowControl::Return => Err(internal_error!(
                "{:?} must not reach the default flow dispatch",
                descriptor.code
            )),
        }
    }

    /// Resolves the concrete targets of a branch from its address operand.
    ///
    /// The address is the last dependency slot; each of its data sources is
    /// emulated with a fresh emulator and yields one target.
    fn infer_jump_targets(
        &self,
        disasm: &VMExportDisassembly,
        deps: &Dependencies,
        offset: u64,
    ) -> Result<Vec<u64>> {
        let address = deps
            .last()
            .ok_or_else(|| internal_error!("branch at {:#x} recorded no address operand", offset))?;
        let mut targets = Vec::new();
        for source in address.data_sources() {
            let value = PartialEmulator::new(disasm, self.max_emulation_depth)
                .infer_source(source)?;
            targets.push(value.as_u64());
        }
        if targets.is_empty() {
            return Err(Error::InferenceFailed {
                offset,
                message: "branch address has no data sources".into(),
            });
        }
        Ok(targets)
    }

    /// `CALL`: resolve the target export and chain the cipher key past it.
    fn process_call(
        &self,
        disasm: &mut VMExportDisassembly,
        exit_keys: &mut ExitKeyTable,
        mut next: ProgramState,
        mut deps: Dependencies,
        offset: u64,
    ) -> Result<Transfer> {
        let target = next.stack.pop(offset)?;
        deps.add_or_merge(0, target.clone());

        let address = match infer_value(disasm, &target, self.max_emulation_depth) {
            Ok(value) => value.as_u64(),
            Err(error) => {
                disasm.unresolved_offsets.insert(offset);
                return Err(error);
            }
        };

        let Some((export_id, callee)) = self.exports.find_by_offset(address) else {
            disasm.unresolved_offsets.insert(offset);
            return Err(Error::UnsupportedCall { offset, address });
        };

        let signature = callee.signature.clone();
        let argument_count = signature.param_count() + usize::from(signature.is_instance());
        let mut arguments = Vec::with_capacity(argument_count);
        for _ in 0..argument_count {
            arguments.push(next.stack.pop(offset)?);
        }
        arguments.reverse();
        for (index, value) in arguments.into_iter().enumerate() {
            deps.add_or_merge(1 + index as u32, value);
        }

        let return_type = self.image.return_type(offset, signature.return_token)?;
        let annotation = Annotation {
            inferred_pop: 1 + argument_count as u32,
            inferred_push: 0,
            kind: AnnotationKind::Call {
                address,
                export_id,
                returns_value: return_type.is_some(),
            },
        };

        let Some(&exit_key) = exit_keys.get(&export_id) else {
            // The callee has not reached a RET yet; park the call site until
            // its exit key shows up.
            disasm.unresolved_offsets.insert(offset);
            return Ok(Transfer {
                dependencies: deps,
                annotation,
                successors: Vec::new(),
            });
        };

        disasm.unresolved_offsets.remove(&offset);
        next.key = exit_key;
        if let Some(ty) = return_type {
            next.set_register(VMRegister::R0, SymbolicValue::new(offset, ty));
        }
        Ok(Transfer {
            dependencies: deps,
            annotation,
            successors: vec![next],
        })
    }

    /// `RET`: pin or cross-check the enclosing export's exit key.
    fn process_ret(
        &self,
        disasm: &mut VMExportDisassembly,
        exit_keys: &mut ExitKeyTable,
        mut next: ProgramState,
        mut deps: Dependencies,
        offset: u64,
    ) -> Result<Transfer> {
        // The return address drives nothing; record it without emulation.
        let address = next.stack.pop(offset)?;
        deps.add_or_merge(0, address);

        match exit_keys.get(&disasm.export_id) {
            Some(&known) if known != next.key => {
                warn!(
                    export_id = disasm.export_id,
                    offset,
                    pinned = known,
                    observed = next.key,
                    "RET disagrees with the pinned exit key"
                );
            }
            Some(_) => {}
            None => {
                debug!(
                    export_id = disasm.export_id,
                    exit_key = next.key,
                    "exit key pinned"
                );
                exit_keys.insert(disasm.export_id, next.key);
                disasm.exit_key = Some(next.key);
            }
        }

        Ok(Transfer {
            dependencies: deps,
            annotation: Annotation::plain(1, 0),
            successors: Vec::new(),
        })
    }

    /// `TRY`: open a protected region and seed its handler (and filter) blocks.
    fn process_try(
        &self,
        disasm: &mut VMExportDisassembly,
        mut next: ProgramState,
        mut deps: Dependencies,
        offset: u64,
    ) -> Result<Transfer> {
        let type_value = next.stack.pop(offset)?;
        deps.add_or_merge(0, type_value.clone());
        let type_id = infer_value(disasm, &type_value, self.max_emulation_depth)?.as_u32();
        let clause = self.constants.eh_type(type_id as u8, offset)?;

        let mut slot = 1u32;
        let mut catch_type = None;
        let mut filter_address = 0u64;
        match clause {
            EHType::Catch => {
                let value = next.stack.pop(offset)?;
                deps.add_or_merge(slot, value.clone());
                slot += 1;
                let id = infer_value(disasm, &value, self.max_emulation_depth)?.as_u32();
                catch_type = Some(
                    self.image
                        .resolve_reference(offset, id, TokenCategory::TYPE)?,
                );
            }
            EHType::Filter => {
                let value = next.stack.pop(offset)?;
                deps.add_or_merge(slot, value.clone());
                slot += 1;
                filter_address = infer_value(disasm, &value, self.max_emulation_depth)?.as_u64();
            }
            EHType::Finally => {}
            EHType::Fault => {
                disasm.unresolved_offsets.insert(offset);
                return Err(Error::Unsupported {
                    offset,
                    message: "FAULT clauses are never emitted by the VM".into(),
                });
            }
        }

        let handler_value = next.stack.pop(offset)?;
        deps.add_or_merge(slot, handler_value.clone());
        let handler_address = infer_value(disasm, &handler_value, self.max_emulation_depth)?.as_u64();

        next.eh_stack.push(EHFrame {
            ty: clause,
            try_start: next.ip,
            handler_address,
            filter_address,
            catch_type,
        });

        // Handler and filter blocks run under a fresh key and, for catching
        // clauses, start with the live exception on the stack.
        let mut successors = Vec::with_capacity(3);
        let mut handler = next.clone();
        handler.ip = handler_address;
        handler.key = 0;
        if matches!(clause, EHType::Catch | EHType::Filter) {
            handler
                .stack
                .push(SymbolicValue::new(offset, VMType::Object));
        }
        disasm.add_block_header(handler_address);

        if clause == EHType::Filter {
            let mut filter = next.clone();
            filter.ip = filter_address;
            filter.key = 0;
            filter.stack.push(SymbolicValue::new(offset, VMType::Object));
            disasm.add_block_header(filter_address);
            successors.push(filter);
        }

        successors.insert(0, handler);
        successors.insert(0, next);

        Ok(Transfer {
            dependencies: deps,
            annotation: Annotation::plain(slot + 1, 0),
            successors,
        })
    }

    /// `LEAVE`: close the innermost protected region.
    fn process_leave(
        &self,
        mut next: ProgramState,
        mut deps: Dependencies,
        offset: u64,
    ) -> Result<Transfer> {
        // The marker is only a runtime sanity check; record it, do not emulate.
        let marker = next.stack.pop(offset)?;
        deps.add_or_merge(0, marker);

        if next.eh_stack.pop().is_none() {
            return Err(internal_error!(
                "LEAVE at {:#x} with no open protected region",
                offset
            ));
        }

        Ok(Transfer {
            dependencies: deps,
            annotation: Annotation::plain(1, 0),
            successors: vec![next],
        })
    }
}
