//! The instruction-decoding seam.
//!
//! The VM's instruction stream is encrypted with a stream cipher whose state
//! (the *key*) evolves with every decoded instruction; consecutive basic
//! blocks chain through it. Decryption and byte-level decoding live with the
//! host-binary tooling; the inference engine only requires the
//! [`InstructionDecoder`] contract.

use crate::{disassembler::instruction::Instruction, Result};

/// One successfully decoded instruction plus the follow-up cipher key.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    /// The decoded instruction.
    pub instruction: Instruction,
    /// The key that decodes the instruction at `instruction.next_offset()`.
    pub next_key: u32,
}

/// Decodes one instruction at a given offset under a given stream-cipher key.
///
/// Implementations decrypt the bytes at `offset` with `key`, decode one
/// instruction (resolving opcode and register encodings through the constants
/// table), and report the key the cipher reaches afterwards. Decoding must be
/// pure: the same `(offset, key)` pair always yields the same result.
pub trait InstructionDecoder {
    /// Decodes the instruction at `offset` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Decode`] when the bytes at `offset` do not
    /// decrypt to a valid instruction under `key`. The driver treats this as
    /// fatal for the requesting program state only - unless the state is an
    /// export's seed, in which case the failure propagates.
    fn decode(&self, offset: u64, key: u32) -> Result<DecodedInstruction>;
}
