use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use tracery_mem::{AddressSpace, CodeVersion, Pc};

use crate::{Category, DecodedInstruction, GuestArch};

/// Identity of a trace's content: entry PC plus a position-sensitive digest
/// of every decoded instruction byte. Used to deduplicate translations across
/// address spaces and executions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId {
    pub entry_pc: Pc,
    pub hash: u64,
}

/// A single-entry, multiple-exit region of decoded guest code.
#[derive(Clone, Debug)]
pub struct DecodedTrace {
    pub entry_pc: Pc,
    /// Code version of the entry PC's range at decode time; becomes part of
    /// the dispatch key for every function lifted from this trace.
    pub code_version: CodeVersion,
    pub id: TraceId,
    pub instructions: BTreeMap<Pc, DecodedInstruction>,
}

/// Read up to one instruction's worth of executable bytes, stopping at the
/// first non-executable byte.
fn read_instruction_bytes(
    arch: &dyn GuestArch,
    space: &mut AddressSpace,
    pc: Pc,
) -> Vec<u8> {
    let max_len = arch.max_instruction_size();
    let mut bytes = Vec::with_capacity(max_len);
    for i in 0..max_len as u64 {
        let byte_pc = Pc::new(pc.get().wrapping_add(i));
        match space.try_read_executable(byte_pc) {
            Some(byte) => bytes.push(byte),
            None => {
                warn!("stopping decode at non-executable byte {byte_pc}");
                break;
            }
        }
    }
    bytes
}

/// Enqueue the successors that continue the *current* trace. Only directly
/// reachable fall-through and branch edges are followed.
fn add_successors_to_work_list(inst: &DecodedInstruction, work_list: &mut BTreeSet<u64>) {
    match inst.category {
        Category::Invalid
        | Category::Error
        | Category::IndirectJump
        | Category::Return
        | Category::AsyncHypercall => {}

        Category::Normal | Category::NoOp => {
            work_list.insert(inst.next_pc.get());
        }

        // Calls are known to come back to the return site, so the trace body
        // continues there.
        Category::DirectCall | Category::IndirectCall | Category::ConditionalAsyncHypercall => {
            if let Some(pc) = inst.branch_not_taken_pc {
                work_list.insert(pc.get());
            }
        }

        Category::DirectJump => {
            if let Some(pc) = inst.branch_taken_pc {
                work_list.insert(pc.get());
            }
        }

        Category::ConditionalBranch => {
            if let Some(pc) = inst.branch_taken_pc {
                work_list.insert(pc.get());
            }
            work_list.insert(inst.next_pc.get());
        }
    }
}

/// Enqueue targets that start *new* traces: direct-call callees, which are
/// split out to bound trace size and maximise sharing.
fn add_successors_to_trace_list(inst: &DecodedInstruction, trace_list: &mut BTreeSet<u64>) {
    if inst.category == Category::DirectCall {
        if let (Some(taken), not_taken) = (inst.branch_taken_pc, inst.branch_not_taken_pc) {
            if Some(taken) != not_taken {
                trace_list.insert(taken.get());
            }
        }
    }
}

/// The trace's identity is a digest of its instruction bytes, seeded with
/// PC-derived values so identical byte sequences at different PCs stay
/// distinct.
fn hash_trace_instructions(entry_pc: Pc, instructions: &BTreeMap<Pc, DecodedInstruction>) -> TraceId {
    let mut min_pc = 1u64;
    let mut max_pc = 1u64;
    if let (Some((first, _)), Some((last, _))) = (
        instructions.iter().next(),
        instructions.iter().next_back(),
    ) {
        min_pc = first.get();
        max_pc = last.get();
    }

    let seed = min_pc
        .wrapping_mul(max_pc)
        .wrapping_mul(instructions.len() as u64);

    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    for inst in instructions.values() {
        hasher.update(&inst.bytes);
    }
    let digest = hasher.finalize();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);

    TraceId {
        entry_pc,
        hash: u64::from_le_bytes(raw),
    }
}

fn verify_traces(traces: &[DecodedTrace]) -> bool {
    let mut ok = true;
    for trace in traces {
        if !trace.instructions.contains_key(&trace.entry_pc) {
            warn!(
                "trace at {} does not contain the instruction at its entry",
                trace.entry_pc
            );
            ok = false;
        }
    }
    ok
}

/// Recursively decode machine code beginning at `start_pc`, partitioning the
/// statically reachable code graph into traces.
///
/// PCs already marked as trace heads in `space` are skipped, so repeat calls
/// only produce traces for code that has not been seen under the current code
/// version.
pub fn decode_traces(
    arch: &dyn GuestArch,
    space: &mut AddressSpace,
    start_pc: Pc,
) -> Vec<DecodedTrace> {
    let mut traces = Vec::new();
    let mut trace_list: BTreeSet<u64> = BTreeSet::new();
    let mut work_list: BTreeSet<u64> = BTreeSet::new();

    debug!("recursively decoding machine code beginning at {start_pc}");

    trace_list.insert(start_pc.get());

    while let Some(trace_pc_uint) = trace_list.pop_first() {
        let trace_pc = Pc::new(trace_pc_uint);

        if space.is_trace_head(trace_pc) {
            continue;
        }
        space.mark_trace_head(trace_pc);

        debug_assert!(work_list.is_empty());
        work_list.insert(trace_pc_uint);

        let code_version = space.compute_code_version(trace_pc);
        let mut instructions: BTreeMap<Pc, DecodedInstruction> = BTreeMap::new();

        while let Some(pc_uint) = work_list.pop_first() {
            let pc = Pc::new(pc_uint);
            if instructions.contains_key(&pc) {
                continue;
            }

            let bytes = read_instruction_bytes(arch, space, pc);
            let inst = arch.decode(pc, &bytes);

            if inst.is_decoded() {
                add_successors_to_work_list(&inst, &mut work_list);
                add_successors_to_trace_list(&inst, &mut trace_list);
            } else {
                warn!("cannot decode instruction at {pc}");
            }
            instructions.insert(pc, inst);
        }

        let id = hash_trace_instructions(trace_pc, &instructions);
        debug!(
            "decoded {} instructions starting from {}",
            instructions.len(),
            trace_pc
        );

        traces.push(DecodedTrace {
            entry_pc: trace_pc,
            code_version,
            id,
            instructions,
        });
    }

    debug_assert!(verify_traces(&traces));
    traces
}
