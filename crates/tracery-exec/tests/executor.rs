use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tracery_cache::{
    ArchState, LiftedModule, LiftedTraceFunction, Lifter, TraceExit, TraceExitKind,
};
use tracery_decode::{Category, DecodedTrace, X86Arch};
use tracery_exec::{Executor, GenericRuntime, Task, TaskId, TaskStatus, Workspace};
use tracery_mem::{lock_space, AddressSpace, AddressSpaceHandle, AddressWidth, Pc};

/// Test lifter: walks a trace's instruction map, following fall-through
/// edges until it leaves the trace or reaches a return.
struct StepLifter {
    calls: AtomicUsize,
}

impl StepLifter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Lifter for StepLifter {
    fn lift(&self, traces: &[DecodedTrace]) -> tracery_cache::Result<LiftedModule> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let functions = traces
            .iter()
            .map(|trace| {
                let instructions = trace.instructions.clone();
                LiftedTraceFunction {
                    id: trace.id,
                    func: Arc::new(
                        move |_state: &mut ArchState, pc: Pc, memory: AddressSpaceHandle| {
                            let mut cur = pc;
                            loop {
                                let Some(inst) = instructions.get(&cur) else {
                                    // Left the trace: hand back to dispatch.
                                    return TraceExit {
                                        next_pc: cur,
                                        memory,
                                        kind: TraceExitKind::Normal,
                                    };
                                };
                                match inst.category {
                                    Category::Normal | Category::NoOp => cur = inst.next_pc,
                                    Category::DirectJump => match inst.branch_taken_pc {
                                        Some(taken) => cur = taken,
                                        None => {
                                            return TraceExit {
                                                next_pc: cur,
                                                memory,
                                                kind: TraceExitKind::Error,
                                            }
                                        }
                                    },
                                    Category::Return => {
                                        return TraceExit {
                                            next_pc: cur,
                                            memory,
                                            kind: TraceExitKind::Exited,
                                        }
                                    }
                                    _ => {
                                        return TraceExit {
                                            next_pc: cur,
                                            memory,
                                            kind: TraceExitKind::Error,
                                        }
                                    }
                                }
                            }
                        },
                    ),
                }
            })
            .collect();
        Ok(LiftedModule { functions })
    }
}

fn code_space(base: u64, bytes: &[u8]) -> AddressSpaceHandle {
    let mut space = AddressSpace::new(AddressWidth::Bits64, true);
    space.add_map(base, 0x1000, "", 0);
    assert!(space.try_write_bytes(base, bytes));
    space.set_permissions(base, 0x1000, true, true, true);
    space.into_handle()
}

fn executor_in(dir: &std::path::Path, lifter: Arc<StepLifter>) -> Executor {
    let workspace = Workspace::open(dir).unwrap();
    Executor::new(
        Arc::new(X86Arch::amd64()),
        Box::new(GenericRuntime),
        lifter,
        &workspace,
        2,
    )
    .unwrap()
}

#[test]
fn runs_straight_line_code_to_exit() {
    let dir = tempfile::tempdir().unwrap();
    let lifter = StepLifter::new();
    let mut executor = executor_in(dir.path(), lifter.clone());

    let memory = code_space(0x4000, &[0x90, 0x90, 0xC3]);
    executor.add_initial_task(&[0u8; 64], Pc::new(0x4000), memory);

    let summary = executor.run().unwrap();
    assert_eq!(summary.exited, 1);
    assert_eq!(summary.faulted, 0);
    assert_eq!(lifter.call_count(), 1);
    assert!(executor.live_trace_count() >= 1);
}

#[test]
fn tasks_sharing_a_space_share_the_translation() {
    let dir = tempfile::tempdir().unwrap();
    let lifter = StepLifter::new();
    let mut executor = executor_in(dir.path(), lifter.clone());

    let memory = code_space(0x4000, &[0x90, 0xC3]);
    let mut first = Task::new(TaskId(100), &[], Pc::new(0x4000), memory.clone());
    let mut second = Task::new(TaskId(101), &[], Pc::new(0x4000), memory.clone());

    let f1 = executor.find_lifted_function_for_task(&mut first);
    let f2 = executor.find_lifted_function_for_task(&mut second);

    // Same (PC, CodeVersion) key, same host function, one lift.
    assert!(Arc::ptr_eq(&f1, &f2));
    assert_eq!(lifter.call_count(), 1);
}

#[test]
fn smc_write_forces_a_fresh_translation() {
    let dir = tempfile::tempdir().unwrap();
    let lifter = StepLifter::new();
    let mut executor = executor_in(dir.path(), lifter.clone());

    let memory = code_space(0x4000, &[0x90, 0xC3]);
    let mut task = Task::new(TaskId(0), &[], Pc::new(0x4000), memory.clone());

    let before = executor.find_lifted_function_for_task(&mut task);
    assert_eq!(lifter.call_count(), 1);

    // Same key hits the live index.
    let hit = executor.find_lifted_function_for_task(&mut task);
    assert!(Arc::ptr_eq(&before, &hit));
    assert_eq!(lifter.call_count(), 1);

    // Overwrite the first instruction; the write invalidates the range's
    // version, so the next dispatch misses and re-lifts.
    assert!(lock_space(&memory).try_write_u8(0x4000, 0xC3));
    let after = executor.find_lifted_function_for_task(&mut task);
    assert_eq!(lifter.call_count(), 2);
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(executor.live_trace_count(), 2);
}

#[test]
fn second_run_restores_translations_from_disk() {
    let dir = tempfile::tempdir().unwrap();

    let first_lifter = StepLifter::new();
    {
        let mut executor = executor_in(dir.path(), first_lifter.clone());
        let memory = code_space(0x4000, &[0x90, 0x90, 0xC3]);
        executor.add_initial_task(&[], Pc::new(0x4000), memory);
        let summary = executor.run().unwrap();
        assert_eq!(summary.exited, 1);
    }
    assert_eq!(first_lifter.call_count(), 1);

    // A fresh executor over the same workspace re-lifts the persisted traces
    // at startup, so an identical task never misses.
    let second_lifter = StepLifter::new();
    let mut executor = executor_in(dir.path(), second_lifter.clone());
    assert_eq!(second_lifter.call_count(), 1);
    assert!(executor.live_trace_count() >= 1);

    let memory = code_space(0x4000, &[0x90, 0x90, 0xC3]);
    executor.add_initial_task(&[], Pc::new(0x4000), memory);
    let summary = executor.run().unwrap();
    assert_eq!(summary.exited, 1);
    assert_eq!(second_lifter.call_count(), 1, "warm start must not re-lift");
}

#[test]
fn undecodable_entry_faults_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let lifter = StepLifter::new();
    let mut executor = executor_in(dir.path(), lifter.clone());

    // An unmapped PC decodes to nothing; the error intrinsic runs instead.
    let space = AddressSpace::new(AddressWidth::Bits64, true);
    executor.add_initial_task(&[], Pc::new(0x9000), space.into_handle());

    let summary = executor.run().unwrap();
    assert_eq!(summary.exited, 0);
    assert_eq!(summary.faulted, 1);
}

#[test]
fn blocked_tasks_resume_after_coroutine_work() {
    let memory = AddressSpace::new(AddressWidth::Bits64, false).into_handle();
    let mut task = Task::new(TaskId(7), &[], Pc::new(0x1000), memory);

    task.block_on(|| std::thread::sleep(Duration::from_millis(10)));
    assert_eq!(task.status, TaskStatus::Blocked);

    let mut spins = 0;
    loop {
        task.poll_blocked();
        match task.status {
            TaskStatus::Runnable => break,
            TaskStatus::Blocked => {
                spins += 1;
                assert!(spins < 1000, "blocking work never completed");
                std::thread::sleep(Duration::from_millis(1));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
