use std::sync::Arc;

use tracing::{trace, warn};

use tracery_cache::{ArchState, LiftedFn, TraceExit, TraceExitKind};
use tracery_mem::{lock_space, AddressSpaceHandle, Pc};

use crate::task::{Task, TaskId};

/// The boundary between the executor and the guest runtime.
///
/// Each method corresponds to one of the runtime intrinsic entry points that
/// compiled modules link against: `init`/`fini` bracket the run,
/// `on_task_created` is the create-task hook, `error_function` is the
/// fallback translation for undecodable PCs, and the remaining accessors
/// cover the FPU and heap queries lifted code performs during task setup.
pub trait Runtime: Send {
    fn init(&mut self) {}

    fn fini(&mut self) {}

    /// Called once per task after the executor allocates it (state, PC,
    /// memory handle, and coroutine are already in place).
    fn on_task_created(&mut self, task: &mut Task);

    /// The translation dispatched when no real translation exists.
    fn error_function(&self) -> LiftedFn;

    /// Initial program break for a task entering at `pc`.
    fn initial_heap_end(&self, pc: Pc, memory: &AddressSpaceHandle) -> u64;

    /// FPU rounding mode encoded in the task's register state.
    fn rounding_mode(&self, state: &ArchState) -> u8;

    /// Diagnostic trace channel for syscall-level instrumentation.
    fn strace(&self, task: TaskId, message: &str) {
        trace!("{task}: {message}");
    }
}

/// Guest-OS-agnostic runtime: cooperative scheduling with no system-call
/// model. Suitable for snapshots whose code runs to completion without
/// kernel services, and as the base other runtimes delegate to.
pub struct GenericRuntime;

impl Runtime for GenericRuntime {
    fn on_task_created(&mut self, task: &mut Task) {
        task.fpu_rounding_mode = self.rounding_mode(&task.state);
        task.program_break = self.initial_heap_end(task.pc, &task.memory);
    }

    fn error_function(&self) -> LiftedFn {
        Arc::new(
            |_state: &mut ArchState, pc: Pc, memory: AddressSpaceHandle| {
                warn!("no translation for {pc}; raising guest error");
                TraceExit {
                    next_pc: pc,
                    memory,
                    kind: TraceExitKind::Error,
                }
            },
        )
    }

    fn initial_heap_end(&self, _pc: Pc, memory: &AddressSpaceHandle) -> u64 {
        lock_space(memory).initial_program_break()
    }

    fn rounding_mode(&self, _state: &ArchState) -> u8 {
        // Round-to-nearest; refining this needs the arch-specific FPU layout.
        0
    }
}
