//! Basic-block materialization over a finished disassembly record.
//!
//! The inference engine records a flat instruction map plus the set of block
//! headers it discovered; this module folds the two into an explicit list of
//! [`BasicBlock`]s with successor edges, the shape downstream control-flow
//! consumers expect. Handler and filter entries registered by `TRY` appear as
//! ordinary blocks; their exceptional edges are carried by the instruction
//! annotations, not duplicated here.

use crate::{
    architecture::FlowControl,
    disassembler::{
        export::VMExportDisassembly,
        instruction::{AnnotationKind, Instruction},
    },
};

/// A maximal straight-line run of recovered instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// Offset of the first instruction.
    pub start: u64,
    /// Offsets of the contained instructions, ascending.
    pub instructions: Vec<u64>,
    /// Start offsets of the successor blocks.
    pub successors: Vec<u64>,
}

/// Builds the basic blocks of a completed disassembly record.
///
/// Blocks split at recorded block headers and at control transfers; a gap in
/// the instruction map also closes the current block (the bytes in between
/// were never proven reachable). The result is ordered by start offset.
#[must_use]
pub fn build_blocks(disasm: &VMExportDisassembly) -> Vec<BasicBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<BasicBlock> = None;

    let mut iter = disasm.instructions.values().peekable();
    while let Some(instr) = iter.next() {
        current
            .get_or_insert_with(|| BasicBlock {
                start: instr.offset,
                instructions: Vec::new(),
                successors: Vec::new(),
            })
            .instructions
            .push(instr.offset);

        let next_recorded = iter
            .peek()
            .map(|next| next.offset == instr.next_offset())
            .unwrap_or(false);
        let splits_here = terminates_block(instr)
            || disasm.block_headers.contains(&instr.next_offset())
            || !next_recorded;

        if splits_here {
            if let Some(mut block) = current.take() {
                block.successors = successors_of(disasm, instr, next_recorded);
                blocks.push(block);
            }
        }
    }

    blocks
}

/// Whether `instr` always ends its basic block, independent of headers.
fn terminates_block(instr: &Instruction) -> bool {
    !matches!(
        instr.descriptor().flow_control,
        FlowControl::Next | FlowControl::Call
    )
}

/// Successor block starts contributed by the last instruction of a block.
fn successors_of(
    disasm: &VMExportDisassembly,
    instr: &Instruction,
    next_recorded: bool,
) -> Vec<u64> {
    let fall_through = || {
        let next = instr.next_offset();
        (next_recorded && disasm.instructions.contains_key(&next)).then_some(next)
    };

    match instr.descriptor().flow_control {
        FlowControl::Return => Vec::new(),
        FlowControl::Jump => match instr.annotation.as_ref().map(|a| &a.kind) {
            Some(AnnotationKind::Jump { targets }) => targets.clone(),
            _ => Vec::new(),
        },
        FlowControl::ConditionalJump => {
            let mut successors = match instr.annotation.as_ref().map(|a| &a.kind) {
                Some(AnnotationKind::Jump { targets }) => targets.clone(),
                _ => Vec::new(),
            };
            successors.extend(fall_through());
            successors
        }
        FlowControl::Next | FlowControl::Call => fall_through().into_iter().collect(),
    }
}
