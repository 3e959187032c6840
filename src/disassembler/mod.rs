//! The inference-driven disassembler.
//!
//! Devirtualization starts from an encrypted, self-keying instruction stream:
//! every decoded instruction advances the stream cipher, jump and call targets
//! are computed on the VM stack instead of being encoded as immediates, and
//! basic blocks chain through cipher keys. Static recovery therefore has to
//! *infer* its way forward - this module walks each exported function
//! symbolically, discovering control flow, stack effects, data dependencies,
//! and the key material needed to keep decoding.
//!
//! # Key Types
//! - [`InferenceDisassembler`] - the fixed-point worklist driver
//! - [`VMExportDisassembly`] - everything recovered about one export
//! - [`Instruction`] / [`Annotation`] - decoded instructions and what inference learned
//! - [`ProgramState`] / [`SymbolicValue`] - the symbolic machine
//! - [`PartialEmulator`] - concrete re-execution of address computations
//!
//! # Pipeline
//!
//! ```text
//! ExportDirectory ──seed──▶ worklist ──▶ InstructionProcessor ──▶ successor states
//!        ▲                     │                │ ▲
//!        │                     │                ▼ │
//!   exit keys ◀────────────────┴──── PartialEmulator / VCALL dispatch
//! ```
//!
//! The driver owns one [`VMExportDisassembly`] record per export and mutates
//! it as inference progresses; collaborators ([`InstructionDecoder`], the
//! metadata image, the constants table) are read-only.

mod blocks;
mod decoder;
mod driver;
mod emulator;
mod export;
mod instruction;
mod processor;
mod state;
mod symbolic;
mod vcall;

pub use blocks::{build_blocks, BasicBlock};
pub use decoder::{DecodedInstruction, InstructionDecoder};
pub use driver::{DisassemblerConfig, DisassemblyResult, DisassemblyStats, InferenceDisassembler};
pub use emulator::{infer_value, EmValue, PartialEmulator};
pub use export::{ExportDirectory, VMExport, VMExportDisassembly};
pub use instruction::{
    Annotation, AnnotationKind, Dependencies, Instruction, Operand, VCallAnnotation,
};
pub use state::{EHFrame, ProgramState};
pub use symbolic::{SymbolicStack, SymbolicValue};
