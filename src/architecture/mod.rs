//! Architecture description of the stack-machine obfuscator's virtual machine.
//!
//! This module is the build-independent model of the VM: its register file,
//! flags word, slot type system, instruction set, and the per-build constants
//! table that maps randomized byte encodings back onto those identities.
//!
//! # Key Types
//! - [`ILCode`] / [`OpCode`] / [`OPCODES`] - the instruction set and its static descriptors
//! - [`VMRegister`] / [`VMFlags`] / [`VMType`] - register file and slot types
//! - [`VMConstants`] - the resolved per-build encoding table
//! - [`VMCall`] / [`ECallOp`] / [`EHType`] - sub-opcode and clause categories

mod constants;
mod opcode;
mod registers;

pub use constants::{ECallOp, EHType, VMCall, VMConstants};
pub use opcode::{FlowControl, ILCode, OpCode, OperandType, StackBehavior, OPCODES};
pub use registers::{VMFlags, VMRegister, VMType};
