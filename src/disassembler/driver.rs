//! The fixed-point disassembly driver.
//!
//! The [`InferenceDisassembler`] seeds one program state per export (entry
//! offset, entry key, empty stacks) and drains a worklist: pop a state, decode
//! the instruction under the state's cipher key, run the symbolic transfer
//! function, and fan the successor states back out. States are memoized per
//! `(ip, key)`; a successor that reaches an already-visited point merges into
//! the stored state and only re-enters the agenda when the merge learned
//! something new, which makes the whole loop a monotone fixed point over
//! finite data-source sets.
//!
//! Calls couple exports: disassembly cannot continue past a call site until
//! the callee's exit key is known, and the callee may not have reached its
//! `RET` yet. Such call sites park in their record's unresolved set; whenever
//! the agenda drains, every call site whose callee has meanwhile pinned an
//! exit key is re-seeded from its stored state, and the loop runs again. The
//! outer iteration terminates because each round either shrinks the
//! unresolved set or changes nothing.
//!
//! Failure policy: errors raised while processing a single state drop that
//! state with a warning and never abort the run; only construction-time
//! failures (invalid constants, an undecodable export entry) propagate.

use std::{
    collections::{hash_map::Entry, BTreeMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::{
    architecture::VMConstants,
    disassembler::{
        decoder::InstructionDecoder,
        export::{ExportDirectory, VMExportDisassembly},
        instruction::AnnotationKind,
        processor::{ExitKeyTable, InstructionProcessor},
        state::ProgramState,
    },
    metadata::MetadataImage,
    Result,
};

/// Ceilings and knobs of one disassembly run.
///
/// The defaults are generous: real exports rarely exceed a few thousand
/// states. The ceilings exist so that a malformed stream degrades into an
/// incomplete result instead of an unbounded loop.
#[derive(Debug, Clone)]
pub struct DisassemblerConfig {
    /// Maximum producer-chain depth the partial emulator follows.
    pub max_emulation_depth: usize,
    /// Maximum number of states processed across one run.
    pub max_states: usize,
    /// Maximum outer re-seeding rounds of the exit-key fixed point.
    pub max_fixpoint_iterations: usize,
}

impl Default for DisassemblerConfig {
    fn default() -> Self {
        Self {
            max_emulation_depth: 64,
            max_states: 1_000_000,
            max_fixpoint_iterations: 1_024,
        }
    }
}

/// Counters describing one disassembly run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisassemblyStats {
    /// Instructions decoded across all exports.
    pub instructions_decoded: usize,
    /// Program states popped from the agenda.
    pub states_processed: usize,
    /// Successor states that merged new information into a visited point.
    pub states_merged: usize,
    /// States dropped because processing them failed.
    pub states_dropped: usize,
    /// Branch instructions whose targets could not be inferred.
    pub unresolved_jumps: usize,
    /// Call sites still unresolved at the fixed point.
    pub unresolved_calls: usize,
    /// Exports whose exit key was pinned by a RET.
    pub exports_resolved: usize,
}

/// The output of a disassembly run: one record per export, plus counters.
#[derive(Debug)]
pub struct DisassemblyResult {
    /// Per-export disassembly records, keyed by export id.
    pub exports: BTreeMap<u32, VMExportDisassembly>,
    /// Run counters.
    pub stats: DisassemblyStats,
}

/// One export's in-flight analysis: the public record plus driver-internal
/// memo tables.
struct ExportAnalysis {
    record: VMExportDisassembly,
    /// Merged program state per visited `(ip, key)` point.
    visited: FxHashMap<(u64, u32), ProgramState>,
    /// Follow-up cipher key per decoded `(offset, key)` pair.
    next_keys: FxHashMap<(u64, u32), u32>,
}

/// The inference-driven disassembler.
///
/// Construction validates the constants table; [`Self::run`] performs the
/// whole fixed-point exploration and returns the annotated records.
///
/// # Example
///
/// ```rust,ignore
/// use koiscope::disassembler::{DisassemblerConfig, InferenceDisassembler};
///
/// let disassembler =
///     InferenceDisassembler::new(&constants, &decoder, &image, exports)?;
/// let result = disassembler.run()?;
/// for (id, record) in &result.exports {
///     println!("export {id}: {} instructions", record.instructions.len());
/// }
/// ```
pub struct InferenceDisassembler<'a> {
    constants: &'a VMConstants,
    decoder: &'a dyn InstructionDecoder,
    image: &'a dyn MetadataImage,
    exports: ExportDirectory,
    config: DisassemblerConfig,
    abort: Option<Arc<AtomicBool>>,
}

impl<'a> InferenceDisassembler<'a> {
    /// Creates a driver over the given collaborators and export directory.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidConstants`] when the constants table
    /// fails validation; nothing can be decoded through a broken table.
    pub fn new(
        constants: &'a VMConstants,
        decoder: &'a dyn InstructionDecoder,
        image: &'a dyn MetadataImage,
        exports: ExportDirectory,
    ) -> Result<Self> {
        constants.validate()?;
        Ok(Self {
            constants,
            decoder,
            image,
            exports,
            config: DisassemblerConfig::default(),
            abort: None,
        })
    }

    /// Replaces the default configuration.
    #[must_use]
    pub fn with_config(mut self, config: DisassemblerConfig) -> Self {
        self.config = config;
        self
    }

    /// Installs a cooperative abort flag, checked at agenda-pop boundaries.
    ///
    /// When the flag turns `true` the run stops early and returns whatever
    /// was recovered so far.
    #[must_use]
    pub fn with_abort_signal(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Runs the disassembly to its fixed point.
    ///
    /// # Errors
    ///
    /// Propagates decode failures of seeded export entries; every other error
    /// is state-local, logged, and absorbed into the counters.
    pub fn run(self) -> Result<DisassemblyResult> {
        let Self {
            constants,
            decoder,
            image,
            exports,
            config,
            abort,
        } = self;

        let processor =
            InstructionProcessor::new(constants, image, &exports, config.max_emulation_depth);

        let mut stats = DisassemblyStats::default();
        let mut exit_keys = ExitKeyTable::default();
        let mut analyses: BTreeMap<u32, ExportAnalysis> = BTreeMap::new();
        let mut agenda: Vec<(u32, ProgramState)> = Vec::new();

        // Seed one state per export. An entry point that does not decode is a
        // fatal input problem, so the seed decode happens eagerly.
        for (export_id, export) in exports.iter() {
            let mut analysis = ExportAnalysis {
                record: VMExportDisassembly::new(export_id, export.clone()),
                visited: FxHashMap::default(),
                next_keys: FxHashMap::default(),
            };
            let seed = ProgramState::entry(export.entry_offset, export.entry_key);
            decode_at(decoder, &mut analysis, seed.ip, seed.key, &mut stats)?;
            analysis.visited.insert((seed.ip, seed.key), seed.clone());
            agenda.push((export_id, seed));
            analyses.insert(export_id, analysis);
        }

        let mut rounds = 0usize;
        'fixpoint: loop {
            while let Some((export_id, state)) = agenda.pop() {
                if let Some(flag) = &abort {
                    if flag.load(Ordering::Relaxed) {
                        debug!("disassembly aborted by caller");
                        break 'fixpoint;
                    }
                }
                stats.states_processed += 1;
                if stats.states_processed > config.max_states {
                    warn!(
                        max_states = config.max_states,
                        "state ceiling reached, result will be incomplete"
                    );
                    break 'fixpoint;
                }

                let analysis = analyses
                    .get_mut(&export_id)
                    .ok_or_else(|| internal_error!("agenda references unknown export {}", export_id))?;

                let next_key =
                    match decode_at(decoder, analysis, state.ip, state.key, &mut stats) {
                        Ok(next_key) => next_key,
                        Err(error) => {
                            warn!(
                                export_id,
                                ip = state.ip,
                                %error,
                                "dropping undecodable state"
                            );
                            stats.states_dropped += 1;
                            continue;
                        }
                    };

                trace!(
                    export_id,
                    ip = state.ip,
                    key = state.key,
                    depth = state.stack.depth(),
                    "processing state"
                );

                match processor.next_states(&mut analysis.record, &mut exit_keys, &state, next_key)
                {
                    Ok(transfer) => {
                        let instr = analysis
                            .record
                            .instructions
                            .get_mut(&state.ip)
                            .ok_or_else(|| {
                                internal_error!("processed instruction vanished at {:#x}", state.ip)
                            })?;
                        instr.dependencies = transfer.dependencies;
                        instr.annotation = Some(transfer.annotation);

                        for successor in transfer.successors {
                            match analysis.visited.entry((successor.ip, successor.key)) {
                                Entry::Vacant(entry) => {
                                    entry.insert(successor.clone());
                                    agenda.push((export_id, successor));
                                }
                                Entry::Occupied(mut entry) => {
                                    match entry.get_mut().merge_with(&successor) {
                                        Ok(true) => {
                                            stats.states_merged += 1;
                                            agenda.push((export_id, entry.get().clone()));
                                        }
                                        Ok(false) => {}
                                        Err(merge_error) => {
                                            error!(
                                                export_id,
                                                ip = successor.ip,
                                                %merge_error,
                                                "inconsistent states at one program point"
                                            );
                                            stats.states_dropped += 1;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Err(error) if error.is_state_local() => {
                        warn!(
                            export_id,
                            ip = state.ip,
                            %error,
                            "dropping state"
                        );
                        stats.states_dropped += 1;
                    }
                    Err(fatal) => return Err(fatal),
                }
            }

            // Agenda drained: re-seed call sites whose callee meanwhile
            // pinned an exit key.
            rounds += 1;
            if rounds > config.max_fixpoint_iterations {
                warn!(
                    rounds,
                    "fixed-point ceiling reached, unresolved calls remain"
                );
                break;
            }
            if !reseed_resolved_calls(&mut analyses, &exit_keys, &mut agenda) {
                break;
            }
            debug!(round = rounds, pending = agenda.len(), "re-seeding resolved call sites");
        }

        // Assemble the result.
        let mut result_exports = BTreeMap::new();
        for (export_id, mut analysis) in analyses {
            analysis.record.exit_key = exit_keys.get(&export_id).copied();
            if analysis.record.exit_key.is_some() {
                stats.exports_resolved += 1;
            }
            stats.unresolved_calls += analysis.record.unresolved_offsets.len();
            stats.unresolved_jumps += analysis
                .record
                .instructions
                .values()
                .filter(|instr| {
                    matches!(
                        instr.annotation.as_ref().map(|a| &a.kind),
                        Some(AnnotationKind::Jump { targets }) if targets.is_empty()
                    )
                })
                .count();
            for &offset in &analysis.record.unresolved_offsets {
                warn!(
                    export_id,
                    offset,
                    "call site left unresolved"
                );
            }
            result_exports.insert(export_id, analysis.record);
        }

        Ok(DisassemblyResult {
            exports: result_exports,
            stats,
        })
    }
}

/// Decodes the instruction at `ip` under `key`, caching the follow-up key per
/// `(offset, key)` pair.
///
/// Branches that reconverge at one offset can legitimately arrive with
/// different keys, and the decoder's output depends on both inputs, so each
/// pair goes through the decoder once. The record keeps the first decoded
/// instruction per offset; later pairs feed their follow-up key into the
/// chain without disturbing the dependencies and annotations accumulated on
/// the recorded instruction.
fn decode_at(
    decoder: &dyn InstructionDecoder,
    analysis: &mut ExportAnalysis,
    ip: u64,
    key: u32,
    stats: &mut DisassemblyStats,
) -> Result<u32> {
    if let Some(&next_key) = analysis.next_keys.get(&(ip, key)) {
        return Ok(next_key);
    }
    let decoded = decoder.decode(ip, key)?;
    debug_assert_eq!(decoded.instruction.offset, ip, "decoder returned a stray offset");
    analysis.next_keys.insert((ip, key), decoded.next_key);
    if !analysis.record.instructions.contains_key(&ip) {
        analysis.record.instructions.insert(ip, decoded.instruction);
        stats.instructions_decoded += 1;
    }
    Ok(decoded.next_key)
}

/// Pushes the stored call-site states of every unresolved call whose callee
/// now has a known exit key. Returns `true` when anything was scheduled.
fn reseed_resolved_calls(
    analyses: &mut BTreeMap<u32, ExportAnalysis>,
    exit_keys: &ExitKeyTable,
    agenda: &mut Vec<(u32, ProgramState)>,
) -> bool {
    let mut reseeded = false;
    for (&export_id, analysis) in analyses.iter_mut() {
        let pending: Vec<u64> = analysis.record.unresolved_offsets.iter().copied().collect();
        for offset in pending {
            let Some(instr) = analysis.record.instruction(offset) else {
                continue;
            };
            let Some(AnnotationKind::Call {
                export_id: callee, ..
            }) = instr.annotation.as_ref().map(|a| &a.kind)
            else {
                continue;
            };
            if !exit_keys.contains_key(callee) {
                continue;
            }
            for ((ip, _key), state) in &analysis.visited {
                if *ip == offset {
                    agenda.push((export_id, state.clone()));
                    reseeded = true;
                }
            }
        }
    }
    reseeded
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;
    use crate::{
        architecture::{ECallOp, ILCode, VMRegister, VMType},
        disassembler::instruction::{AnnotationKind, Operand, VCallAnnotation},
        metadata::{MethodShape, Token},
        test::factories::{chain_key, constants, export_at, ScriptedDecoder, TableImage},
        Error,
    };

    fn run_single_export(
        decoder: &ScriptedDecoder,
        image: &TableImage,
        entry: u64,
        entry_key: u32,
    ) -> DisassemblyResult {
        let mut exports = ExportDirectory::new();
        exports.insert(1, export_at(entry, entry_key));
        InferenceDisassembler::new(&constants(), decoder, image, exports)
            .expect("constants validate")
            .run()
            .expect("run completes")
    }

    #[test]
    fn invalid_constants_are_fatal() {
        let decoder = ScriptedDecoder::new();
        let image = TableImage::new();
        let constants = VMConstants::default();
        let result = InferenceDisassembler::new(
            &constants,
            &decoder,
            &image,
            ExportDirectory::new(),
        );
        assert!(matches!(result, Err(Error::InvalidConstants(_))));
    }

    #[test]
    fn undecodable_seed_is_fatal() {
        let decoder = ScriptedDecoder::new();
        let image = TableImage::new();
        let mut exports = ExportDirectory::new();
        exports.insert(1, export_at(0x10, 1));
        let result = InferenceDisassembler::new(&constants(), &decoder, &image, exports)
            .expect("constants validate")
            .run();
        assert!(matches!(result, Err(Error::Decode { offset: 0x10, .. })));
    }

    #[test]
    fn abort_flag_stops_before_processing() {
        let mut decoder = ScriptedDecoder::new();
        decoder.put(0x10, 2, ILCode::NOP, Operand::None);
        let image = TableImage::new();
        let mut exports = ExportDirectory::new();
        exports.insert(1, export_at(0x10, 1));

        let abort = Arc::new(AtomicBool::new(true));
        let result = InferenceDisassembler::new(&constants(), &decoder, &image, exports)
            .expect("constants validate")
            .with_abort_signal(abort)
            .run()
            .expect("aborted run still returns");
        assert_eq!(result.stats.states_processed, 0);
    }

    #[test]
    fn vcall_sizeof_annotates_and_falls_through() {
        let mut decoder = ScriptedDecoder::new();
        let mut at = 0x10;
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x0200_0033));
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(8));
        at = decoder.put(at, 2, ILCode::VCALL, Operand::None);
        decoder.put(at, 2, ILCode::RET, Operand::None);
        let image = TableImage::new();

        let result = run_single_export(&decoder, &image, 0x10, 0xABCD_EF01);
        let record = &result.exports[&1];

        let annotation = record
            .instruction(0x1C)
            .and_then(|i| i.annotation.as_ref())
            .expect("VCALL annotated");
        assert_eq!(annotation.inferred_pop, 2);
        assert_eq!(annotation.inferred_push, 1);
        assert_eq!(
            annotation.kind,
            AnnotationKind::VCall(VCallAnnotation::SizeOf {
                type_token: Token::new(0x0200_0033)
            })
        );
        assert!(record.exit_key.is_some());
        assert_eq!(result.stats.states_dropped, 0);
    }

    #[test]
    fn vcall_throw_is_terminal() {
        let mut decoder = ScriptedDecoder::new();
        let mut at = 0x10;
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0));
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(7));
        decoder.put(at, 2, ILCode::VCALL, Operand::None);
        let image = TableImage::new();

        let result = run_single_export(&decoder, &image, 0x10, 0x1234_0000);
        let record = &result.exports[&1];

        let annotation = record
            .instruction(0x1C)
            .and_then(|i| i.annotation.as_ref())
            .expect("VCALL annotated");
        assert_eq!(annotation.kind, AnnotationKind::VCall(VCallAnnotation::Throw));
        assert_eq!(record.exit_key, None);
        assert_eq!(result.stats.states_dropped, 0);
        assert_eq!(record.instructions.len(), 3);
    }

    #[test]
    fn vcall_ecall_pops_arguments_and_pushes_result() {
        // ECALL: push the argument, the packed method id (op CALL in the top
        // two bits), then the selector.
        let mut decoder = ScriptedDecoder::new();
        let mut at = 0x10;
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(42));
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x0600_0010));
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0));
        at = decoder.put(at, 2, ILCode::VCALL, Operand::None);
        decoder.put(at, 2, ILCode::RET, Operand::None);

        let image = TableImage::new().with_method(
            Token::new(0x0600_0010),
            MethodShape {
                param_count: 1,
                is_instance: false,
                return_type: Some(VMType::Dword),
            },
        );

        let result = run_single_export(&decoder, &image, 0x10, 0x0F0F_0F0F);
        let record = &result.exports[&1];

        let annotation = record
            .instruction(0x22)
            .and_then(|i| i.annotation.as_ref())
            .expect("VCALL annotated");
        assert_eq!(annotation.inferred_pop, 3, "selector + packed id + 1 argument");
        assert_eq!(annotation.inferred_push, 1);
        assert_eq!(
            annotation.kind,
            AnnotationKind::VCall(VCallAnnotation::ECall {
                op: ECallOp::CALL,
                method: Token::new(0x0600_0010),
                constraint: None,
            })
        );
        assert!(record.exit_key.is_some());
    }

    #[test]
    fn vcall_ldfld_types_the_loaded_value() {
        let mut decoder = ScriptedDecoder::new();
        let mut at = 0x10;
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0));
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0x0400_0020));
        at = decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(4));
        at = decoder.put(at, 2, ILCode::VCALL, Operand::None);
        at = decoder.put(at, 2, ILCode::POP, Operand::Register(VMRegister::R1));
        let ret_at = at;
        decoder.put(at, 6, ILCode::PUSHI_DWORD, Operand::ImmediateDword(0));
        decoder.put(ret_at + 6, 2, ILCode::RET, Operand::None);

        let image =
            TableImage::new().with_field(Token::new(0x0400_0020), VMType::Qword);

        let result = run_single_export(&decoder, &image, 0x10, 0x600D_CAFE);
        let record = &result.exports[&1];

        let annotation = record
            .instruction(0x22)
            .and_then(|i| i.annotation.as_ref())
            .expect("VCALL annotated");
        assert_eq!(
            annotation.kind,
            AnnotationKind::VCall(VCallAnnotation::LdFld {
                field: Token::new(0x0400_0020)
            })
        );

        // The register store consumed the loaded field value with its type.
        let store = record.instruction(0x24).expect("store decoded");
        assert_eq!(store.dependencies.get(0).map(|v| v.ty()), Some(VMType::Qword));
        assert!(record.exit_key.is_some());
    }

    #[test]
    fn key_chain_is_deterministic() {
        assert_eq!(chain_key(0x10, 7), chain_key(0x10, 7));
        assert_ne!(chain_key(0x10, 7), chain_key(0x12, 7));
    }
}
