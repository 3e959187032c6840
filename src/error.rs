use thiserror::Error;

macro_rules! internal_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Internal {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Internal {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Errors fall into two propagation classes, and the disassembly driver treats them very
/// differently:
///
/// - **State-local errors** terminate the fan-out of a single program state. The driver logs
///   them and keeps draining its agenda; one unprocessable path never aborts the analysis of
///   an export. See [`Error::is_state_local`].
/// - **Fatal errors** indicate that the analysis inputs themselves are unusable (a corrupted
///   constants table, an undecodable export entry point) and propagate out of the driver.
///
/// # Error Categories
///
/// ## Inference Errors
/// - [`Error::Unsupported`] - VM construct outside the supported instruction set
/// - [`Error::UnsupportedCall`] - Call target is not a recorded export
/// - [`Error::InferenceFailed`] - Partial emulation could not produce a concrete value
///
/// ## Invariant Violations
/// - [`Error::StackUnderflow`] - Pop from an empty symbolic stack
/// - [`Error::Internal`] - Processor or decoder bug, with source location
///
/// ## Input Errors
/// - [`Error::Decode`] - Instruction stream could not be decoded
/// - [`Error::TokenResolution`] - VM-level id maps to no allowed metadata token
/// - [`Error::InvalidConstants`] - Resolved constants table is incomplete or inconsistent
#[derive(Error, Debug)]
pub enum Error {
    /// An opcode, sub-opcode, or exception clause outside the supported set was encountered.
    ///
    /// The VM never emits some constructs (FAULT clauses), and others are intentionally
    /// left to downstream passes (calls into non-exported code). The offending state is
    /// dropped; the containing disassembly continues.
    #[error("unsupported VM construct at {offset:#x}: {message}")]
    Unsupported {
        /// Offset of the instruction that triggered the error
        offset: u64,
        /// Description of the unsupported construct
        message: String,
    },

    /// A CALL instruction targets an address with no corresponding export entry.
    ///
    /// Without an export record there is no signature and no exit key, so disassembly
    /// cannot continue past the call site. The offset is reported as unresolved.
    #[error("call at {offset:#x} targets {address:#x} which is not an exported function")]
    UnsupportedCall {
        /// Offset of the CALL instruction
        offset: u64,
        /// The inferred, unmatched target address
        address: u64,
    },

    /// The partial emulator met an instruction it cannot execute while resolving an address.
    ///
    /// Raised when a jump target, call target, or v-call selector flows from an opcode
    /// outside the emulated subset, or when a producer chain is ambiguous. The surrounding
    /// instruction keeps its annotation; the affected targets stay unresolved.
    #[error("address inference failed at {offset:#x}: {message}")]
    InferenceFailed {
        /// Offset of the data source that could not be emulated
        offset: u64,
        /// Why emulation gave up
        message: String,
    },

    /// A pop was issued against an empty symbolic stack.
    ///
    /// In a well-formed stream this cannot happen; it points at a decoder bug or at
    /// garbage bytes being interpreted as code. The state is dropped.
    #[error("symbolic stack underflow at {offset:#x}")]
    StackUnderflow {
        /// Offset of the popping instruction
        offset: u64,
    },

    /// An internal invariant was violated.
    ///
    /// This is a bug in the processor or in a collaborator, not a property of the input.
    /// The error records the source location where the violation was detected.
    #[error("internal error - {file}:{line}: {message}")]
    Internal {
        /// Description of the violated invariant
        message: String,
        /// Source file in which the violation was detected
        file: &'static str,
        /// Source line in which the violation was detected
        line: u32,
    },

    /// One instruction could not be decrypted and decoded.
    ///
    /// Fatal when it hits the seeded entry point of an export; state-local everywhere else.
    #[error("failed to decode instruction at {offset:#x} under key {key:#010x}: {message}")]
    Decode {
        /// Offset at which decoding was attempted
        offset: u64,
        /// Stream-cipher key used for the attempt
        key: u32,
        /// Decoder-provided failure description
        message: String,
    },

    /// A VM-level id could not be mapped into the allowed metadata token categories.
    #[error("cannot resolve id {id:#x} at {offset:#x} to a metadata token")]
    TokenResolution {
        /// Offset of the instruction performing the resolution
        offset: u64,
        /// The VM-level id that failed to resolve
        id: u32,
    },

    /// The resolved constants table is missing categories or contains duplicate encodings.
    ///
    /// Constants are resolved by an external collaborator before disassembly starts;
    /// a table that fails validation makes every decoded byte meaningless, so this
    /// error is fatal.
    #[error("invalid constants table: {0}")]
    InvalidConstants(String),
}

impl Error {
    /// Returns `true` when this error terminates only the current program state.
    ///
    /// The worklist driver drops the state, logs, and keeps going for state-local
    /// errors; everything else propagates to the caller.
    #[must_use]
    pub fn is_state_local(&self) -> bool {
        !matches!(self, Error::InvalidConstants(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_macro_captures_location() {
        let err = internal_error!("bad slot {}", 3);
        match err {
            Error::Internal { message, file, .. } => {
                assert_eq!(message, "bad slot 3");
                assert!(file.ends_with("error.rs"));
            }
            _ => panic!("expected Error::Internal"),
        }
    }

    #[test]
    fn state_local_classification() {
        assert!(Error::StackUnderflow { offset: 0x10 }.is_state_local());
        assert!(Error::UnsupportedCall {
            offset: 0x10,
            address: 0x40
        }
        .is_state_local());
        assert!(!Error::InvalidConstants("empty opcode map".into()).is_state_local());
    }

    #[test]
    fn display_formats_hex_offsets() {
        let err = Error::Decode {
            offset: 0x40,
            key: 0xAABBCCDD,
            message: "truncated".into(),
        };
        let text = err.to_string();
        assert!(text.contains("0x40"));
        assert!(text.contains("0xaabbccdd"));
    }
}
