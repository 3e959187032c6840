// Copyright 2025-2026 koiscope contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! # koiscope
//!
//! A static devirtualization core for KoiVM-style virtualization obfuscators.
//! These obfuscators rewrite managed methods into a custom stack-machine
//! instruction stream executed by a bundled interpreter; `koiscope` recovers
//! an approximation of the original code by statically analyzing that stream.
//!
//! # Architecture
//!
//! The crate is organized around the *inference-driven disassembler*: a
//! symbolic-execution engine that walks the obfuscated instruction stream of
//! each exported function, discovers its control-flow graph, reconstructs
//! per-instruction stack effects and data dependencies, and resolves the
//! stream-cipher key that chains consecutive basic blocks together.
//!
//! - **Architecture Layer** ([`crate::architecture`]): the VM's register file,
//!   slot type system, instruction set descriptors, and the per-build
//!   constants table produced by an external constants-resolution pass.
//! - **Metadata Layer** ([`crate::metadata`]): tokens and the read-only seam
//!   through which VM-level ids resolve against the host binary's metadata.
//! - **Disassembler Layer** ([`crate::disassembler`]): symbolic values and
//!   program states, the partial emulator for address inference, the
//!   per-instruction transfer function, the `VCALL` sub-dispatcher, and the
//!   fixed-point worklist driver.
//!
//! The heavy lifting around the core stays external by design: parsing the
//! host binary, decrypting and decoding raw instruction bytes
//! ([`crate::disassembler::InstructionDecoder`]), and lifting the recovered
//! listing back into managed code are collaborator concerns.
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use koiscope::{
//!     disassembler::{ExportDirectory, InferenceDisassembler},
//!     Result,
//! };
//!
//! fn devirtualize(
//!     constants: &koiscope::architecture::VMConstants,
//!     decoder: &dyn koiscope::disassembler::InstructionDecoder,
//!     image: &dyn koiscope::metadata::MetadataImage,
//!     exports: ExportDirectory,
//! ) -> Result<()> {
//!     let result = InferenceDisassembler::new(constants, decoder, image, exports)?.run()?;
//!     for (id, record) in &result.exports {
//!         println!(
//!             "export {id}: {} instructions, {} blocks, exit key {:?}",
//!             record.instructions.len(),
//!             record.block_headers.len(),
//!             record.exit_key,
//!         );
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Errors raised while
//! processing a single program state (unsupported constructs, failed address
//! inference, stack underflow) are absorbed by the driver: the state is
//! dropped with a warning and analysis continues. Only initialization errors
//! (an invalid constants table, an undecodable export entry) propagate to the
//! caller.
//!
//! # Thread Safety
//!
//! One [`crate::disassembler::InferenceDisassembler`] runs single-threaded
//! and owns its per-export records exclusively. Independent binaries can be
//! analyzed in parallel: the constants table and metadata image are shared
//! read-only.

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit-tests
#[cfg(test)]
pub(crate) mod test;

pub mod architecture;
pub mod disassembler;
pub mod metadata;

pub use error::Error;

/// Convenient re-exports of the most commonly used types.
///
/// ```rust,no_run
/// use koiscope::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        architecture::{ILCode, VMConstants, VMRegister, VMType},
        disassembler::{
            DisassemblerConfig, DisassemblyResult, ExportDirectory, InferenceDisassembler,
            InstructionDecoder, VMExport, VMExportDisassembly,
        },
        metadata::{FunctionSignature, MetadataImage, Token, TokenCategory},
        Error, Result,
    };
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
