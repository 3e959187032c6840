//! Export directory and per-export disassembly records.
//!
//! The obfuscator registers every devirtualized method in an export table:
//! entry offset into the instruction stream, the cipher key valid at that
//! offset, and the function signature. The export directory is the
//! disassembler's ground truth for where analysis may start and which call
//! targets are resolvable; everything discovered about one export accumulates
//! in its [`VMExportDisassembly`] record.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashMap;

use crate::{disassembler::instruction::Instruction, metadata::FunctionSignature};

/// One entry of the export table.
#[derive(Debug, Clone)]
pub struct VMExport {
    /// Offset of the first instruction inside the VM instruction stream.
    pub entry_offset: u64,
    /// Stream-cipher key valid at the entry offset.
    pub entry_key: u32,
    /// The devirtualized function's signature.
    pub signature: FunctionSignature,
}

/// The export table of one obfuscated binary, with an address index.
#[derive(Debug, Clone, Default)]
pub struct ExportDirectory {
    exports: BTreeMap<u32, VMExport>,
    by_offset: FxHashMap<u64, u32>,
}

impl ExportDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an export under `id`, replacing any previous entry.
    pub fn insert(&mut self, id: u32, export: VMExport) {
        self.by_offset.insert(export.entry_offset, id);
        self.exports.insert(id, export);
    }

    /// Looks up an export by id.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&VMExport> {
        self.exports.get(&id)
    }

    /// Looks up an export by its entry offset (the address CALL targets carry).
    #[must_use]
    pub fn find_by_offset(&self, entry_offset: u64) -> Option<(u32, &VMExport)> {
        let id = *self.by_offset.get(&entry_offset)?;
        Some((id, self.exports.get(&id)?))
    }

    /// Iterates all exports, ascending by id.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &VMExport)> {
        self.exports.iter().map(|(id, export)| (*id, export))
    }

    /// Number of registered exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exports.len()
    }

    /// Returns `true` when no exports are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

/// Everything the inference engine recovered about one export.
///
/// Owned by the driver analysing the export; never shared across threads.
/// `instructions` is a partial function from offsets - only offsets proven
/// reachable appear. `exit_key` is pinned by the first `RET` reached from the
/// entry; call sites into this export stay in callers' unresolved sets until
/// that happens.
#[derive(Debug, Clone)]
pub struct VMExportDisassembly {
    /// Id of the export this record belongs to.
    pub export_id: u32,
    /// The export-table entry.
    pub export_info: VMExport,
    /// Cipher key after a full run of the function, once a RET pinned it.
    pub exit_key: Option<u32>,
    /// All reachable instructions, keyed by offset.
    pub instructions: BTreeMap<u64, Instruction>,
    /// Offsets starting a basic block of the recovered control-flow graph.
    pub block_headers: BTreeSet<u64>,
    /// Offsets of CALL instructions that could not be carried past yet.
    pub unresolved_offsets: BTreeSet<u64>,
}

impl VMExportDisassembly {
    /// Creates an empty record for `export`, seeding the entry block header.
    #[must_use]
    pub fn new(export_id: u32, export: VMExport) -> Self {
        let mut block_headers = BTreeSet::new();
        block_headers.insert(export.entry_offset);
        Self {
            export_id,
            export_info: export,
            exit_key: None,
            instructions: BTreeMap::new(),
            block_headers,
            unresolved_offsets: BTreeSet::new(),
        }
    }

    /// The recorded instruction at `offset`.
    #[must_use]
    pub fn instruction(&self, offset: u64) -> Option<&Instruction> {
        self.instructions.get(&offset)
    }

    /// Marks `offset` as the start of a basic block.
    pub fn add_block_header(&mut self, offset: u64) {
        self.block_headers.insert(offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{SignatureFlags, Token};

    fn export(offset: u64) -> VMExport {
        VMExport {
            entry_offset: offset,
            entry_key: 0x1234_5678,
            signature: FunctionSignature {
                flags: SignatureFlags::empty(),
                param_tokens: Vec::new(),
                return_token: Token::new(0x0100_0001),
            },
        }
    }

    #[test]
    fn directory_offset_index() {
        let mut directory = ExportDirectory::new();
        directory.insert(1, export(0x10));
        directory.insert(2, export(0x40));

        let (id, found) = directory.find_by_offset(0x40).unwrap();
        assert_eq!(id, 2);
        assert_eq!(found.entry_key, 0x1234_5678);
        assert!(directory.find_by_offset(0x41).is_none());
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn record_seeds_entry_header() {
        let record = VMExportDisassembly::new(7, export(0x10));
        assert!(record.block_headers.contains(&0x10));
        assert!(record.exit_key.is_none());
        assert!(record.unresolved_offsets.is_empty());
    }
}
