//! Reference lifter for x86-64 guests.
//!
//! Each decoded trace is "compiled" to a host closure that interprets the
//! trace's instructions against an [`X86State`] register file and the task's
//! address space. This fills the role a machine-code backend plays in a full
//! deployment: it is complete enough to run snapshots end-to-end and to
//! exercise dispatch, code versioning, and the cooperative scheduler, while
//! the engine stays agnostic to how functions are produced.

mod interp;
mod state;

pub use crate::state::X86State;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use tracery_cache::{
    ArchState, LiftedModule, LiftedTraceFunction, Lifter, TraceExit, TraceExitKind,
};
use tracery_decode::{DecodedInstruction, DecodedTrace};
use tracery_mem::{lock_space, AddressSpaceHandle, Pc};

use crate::interp::StepResult;

/// Upper bound on interpreted instructions per dispatch, so a guest spin
/// loop still yields to the scheduler at intervals.
const MAX_STEPS_PER_DISPATCH: usize = 1 << 20;

pub struct X86TraceLifter {
    bitness: u32,
}

impl X86TraceLifter {
    pub fn amd64() -> Self {
        Self { bitness: 64 }
    }

    pub fn x86() -> Self {
        Self { bitness: 32 }
    }
}

impl Lifter for X86TraceLifter {
    fn lift(&self, traces: &[DecodedTrace]) -> tracery_cache::Result<LiftedModule> {
        let bitness = self.bitness;
        let functions = traces
            .iter()
            .map(|trace| {
                let instructions = Arc::new(trace.instructions.clone());
                LiftedTraceFunction {
                    id: trace.id,
                    func: Arc::new(
                        move |state: &mut ArchState, pc: Pc, memory: AddressSpaceHandle| {
                            run_trace(&instructions, bitness, state, pc, memory)
                        },
                    ),
                }
            })
            .collect();
        Ok(LiftedModule { functions })
    }
}

/// Interpret instructions of one trace until control leaves it.
fn run_trace(
    instructions: &BTreeMap<Pc, DecodedInstruction>,
    bitness: u32,
    state: &mut ArchState,
    pc: Pc,
    memory: AddressSpaceHandle,
) -> TraceExit {
    let Some(mut regs) = X86State::from_bytes(state.bytes()) else {
        warn!("task state blob has an unexpected size; raising guest error");
        return TraceExit {
            next_pc: pc,
            memory,
            kind: TraceExitKind::Error,
        };
    };
    regs.rip = pc.get();

    let kind = {
        let mut space = lock_space(&memory);
        let mut kind = TraceExitKind::Normal;
        for _ in 0..MAX_STEPS_PER_DISPATCH {
            let Some(inst) = instructions.get(&Pc::new(regs.rip)) else {
                // Left the trace; hand the new PC back to the dispatcher.
                break;
            };
            if !inst.is_decoded() {
                warn!("undecodable instruction at {:#x}", regs.rip);
                kind = TraceExitKind::Error;
                break;
            }
            match interp::step(&mut regs, &mut space, &inst.bytes, bitness) {
                StepResult::Continue | StepResult::Branched => {}
                StepResult::Exited => {
                    kind = TraceExitKind::Exited;
                    break;
                }
                StepResult::Fault => {
                    warn!("guest fault at {:#x}", regs.rip);
                    kind = TraceExitKind::Error;
                    break;
                }
            }
        }
        kind
    };

    let next_pc = Pc::new(regs.rip);
    *state.bytes_mut() = regs.to_bytes();
    TraceExit {
        next_pc,
        memory,
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracery_decode::{decode_traces, X86Arch};
    use tracery_mem::{AddressSpace, AddressWidth};

    fn lift_at(space: &mut AddressSpace, pc: u64) -> Vec<LiftedTraceFunction> {
        let arch = X86Arch::amd64();
        let traces = decode_traces(&arch, space, Pc::new(pc));
        X86TraceLifter::amd64().lift(&traces).unwrap().functions
    }

    fn code_space(base: u64, bytes: &[u8]) -> AddressSpace {
        let mut space = AddressSpace::new(AddressWidth::Bits64, true);
        space.add_map(base, 0x1000, "", 0);
        assert!(space.try_write_bytes(base, bytes));
        space.set_permissions(base, 0x1000, true, false, true);
        space
    }

    #[test]
    fn computes_through_registers_and_memory() {
        // mov rax, 5; add rax, 7; mov [0x2000], rax; hlt
        let code = [
            0x48, 0xC7, 0xC0, 0x05, 0x00, 0x00, 0x00, // mov rax, 5
            0x48, 0x83, 0xC0, 0x07, // add rax, 7
            0x48, 0x89, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00, // mov [0x2000], rax
            0xF4, // hlt
        ];
        let mut space = code_space(0x4000, &code);
        space.add_map(0x2000, 0x1000, "", 0);

        let functions = lift_at(&mut space, 0x4000);
        assert_eq!(functions.len(), 1);

        let handle = space.into_handle();
        let mut state = ArchState::from_bytes(&[]);
        let exit = functions[0]
            .func
            .call(&mut state, Pc::new(0x4000), handle.clone());

        assert_eq!(exit.kind, TraceExitKind::Exited);
        let regs = X86State::from_bytes(state.bytes()).unwrap();
        assert_eq!(regs.gpr[0], 12);
        assert_eq!(lock_space(&handle).try_read_u64(0x2000), Some(12));
    }

    #[test]
    fn loops_with_conditional_branches() {
        // Sum 1..=3 by counting rcx down:
        //   mov rcx, 3; xor rax, rax
        // loop: add rax, rcx; sub rcx, 1; jne loop; hlt
        let code = [
            0x48, 0xC7, 0xC1, 0x03, 0x00, 0x00, 0x00, // mov rcx, 3
            0x48, 0x31, 0xC0, // xor rax, rax
            0x48, 0x01, 0xC8, // add rax, rcx
            0x48, 0x83, 0xE9, 0x01, // sub rcx, 1
            0x75, 0xF7, // jne -9
            0xF4, // hlt
        ];
        let mut space = code_space(0x4000, &code);

        let functions = lift_at(&mut space, 0x4000);
        let handle = space.into_handle();
        let mut state = ArchState::from_bytes(&[]);
        let exit = functions[0].func.call(&mut state, Pc::new(0x4000), handle);

        assert_eq!(exit.kind, TraceExitKind::Exited);
        let regs = X86State::from_bytes(state.bytes()).unwrap();
        assert_eq!(regs.gpr[0], 6);
        assert_eq!(regs.gpr[1], 0);
    }

    #[test]
    fn call_and_ret_use_the_guest_stack() {
        // 0x4000: mov rsp, 0x3000; call 0x4100; hlt
        // 0x4100: mov rax, 0x2A; ret
        let mut body = vec![
            0x48, 0xC7, 0xC4, 0x00, 0x30, 0x00, 0x00, // mov rsp, 0x3000
        ];
        body.extend_from_slice(&[0xE8, 0xF4, 0x00, 0x00, 0x00]); // call +0xF4 -> 0x4100
        body.push(0xF4); // hlt at the return site 0x400C
        let mut callee_page = vec![0u8; 0x200];
        callee_page[..body.len()].copy_from_slice(&body);
        callee_page[0x100..0x108].copy_from_slice(&[
            0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, // 0x4100: mov rax, 0x2A
            0xC3, // ret
        ]);
        let mut space = code_space(0x4000, &callee_page);
        space.add_map(0x2000, 0x1000, "", 0); // stack page below 0x3000

        let arch = X86Arch::amd64();
        let traces = decode_traces(&arch, &mut space, Pc::new(0x4000));
        let functions = X86TraceLifter::amd64().lift(&traces).unwrap().functions;
        // Caller body and callee are separate traces.
        assert_eq!(functions.len(), 2);

        let handle = space.into_handle();
        let mut state = ArchState::from_bytes(&[]);

        // Dispatch by hand: run whichever trace contains the current PC.
        let mut pc = Pc::new(0x4000);
        let mut exited = false;
        for _ in 0..8 {
            let owner = traces
                .iter()
                .position(|t| t.instructions.contains_key(&pc))
                .unwrap_or_else(|| panic!("no trace owns {pc}"));
            let exit = functions[owner].func.call(&mut state, pc, handle.clone());
            pc = exit.next_pc;
            if exit.kind == TraceExitKind::Exited {
                exited = true;
                break;
            }
            assert_eq!(exit.kind, TraceExitKind::Normal);
        }
        assert!(exited, "program never reached hlt");

        let regs = X86State::from_bytes(state.bytes()).unwrap();
        assert_eq!(regs.gpr[0], 0x2A);
        assert_eq!(regs.gpr[4], 0x3000, "stack must balance");
    }

    #[test]
    fn unmapped_store_faults() {
        // mov [0x2000], rax with nothing mapped at 0x2000
        let code = [0x48, 0x89, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00, 0xF4];
        let mut space = code_space(0x4000, &code);

        let functions = lift_at(&mut space, 0x4000);
        let handle = space.into_handle();
        let mut state = ArchState::from_bytes(&[]);
        let exit = functions[0].func.call(&mut state, Pc::new(0x4000), handle);
        assert_eq!(exit.kind, TraceExitKind::Error);
    }
}
