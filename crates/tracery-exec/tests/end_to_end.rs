//! Snapshot-to-exit runs combining the loader, the executor, and the
//! reference x86-64 lifter.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tracery_decode::X86Arch;
use tracery_exec::{Executor, GenericRuntime, Task, TaskId, Workspace};
use tracery_lift_x86::{X86State, X86TraceLifter};
use tracery_snapshot::{
    load_snapshot, write_range_contents, AddressSpaceRecord, PageRange, PageRangeKind,
    ProgramSnapshot, TaskRecord,
};

const CODE_BASE: u64 = 0x40_0000;

fn two_task_snapshot() -> ProgramSnapshot {
    ProgramSnapshot {
        address_spaces: vec![AddressSpaceRecord {
            id: 7,
            parent_id: None,
            page_ranges: vec![PageRange {
                base: CODE_BASE,
                limit: CODE_BASE + 0x1000,
                kind: PageRangeKind::Anonymous,
                can_read: true,
                can_write: false,
                can_exec: true,
                name: "code".to_owned(),
                file_path: None,
                file_offset: 0,
            }],
        }],
        tasks: vec![
            TaskRecord {
                address_space_id: 7,
                pc: CODE_BASE,
                state: X86State::default().to_bytes(),
            },
            TaskRecord {
                address_space_id: 7,
                pc: CODE_BASE,
                state: X86State::default().to_bytes(),
            },
        ],
    }
}

fn write_code(dir: &std::path::Path) {
    // mov rax, 5; add rax, 7; hlt
    let mut code = vec![0u8; 0x1000];
    code[..12].copy_from_slice(&[
        0x48, 0xC7, 0xC0, 0x05, 0x00, 0x00, 0x00, // mov rax, 5
        0x48, 0x83, 0xC0, 0x07, // add rax, 7
        0xF4, // hlt
    ]);
    write_range_contents(&dir.join("memory"), "code", &code).unwrap();
}

#[test]
fn shared_space_tasks_resolve_to_one_translation() {
    let dir = tempfile::tempdir().unwrap();
    write_code(dir.path());

    let workspace = Workspace::open(dir.path()).unwrap();
    let program = load_snapshot(
        &two_task_snapshot(),
        &workspace.memory_dir().unwrap(),
        tracery_mem::AddressWidth::Bits64,
        true,
    )
    .unwrap();

    let mut executor = Executor::new(
        Arc::new(X86Arch::amd64()),
        Box::new(GenericRuntime),
        Arc::new(X86TraceLifter::amd64()),
        &workspace,
        2,
    )
    .unwrap();

    // Both initial dispatches use the same (PC, CodeVersion) key and get the
    // same host function.
    let mut first = Task::new(
        TaskId(0),
        &program.tasks[0].state,
        program.tasks[0].pc,
        program.tasks[0].memory.clone(),
    );
    let mut second = Task::new(
        TaskId(1),
        &program.tasks[1].state,
        program.tasks[1].pc,
        program.tasks[1].memory.clone(),
    );
    let f1 = executor.find_lifted_function_for_task(&mut first);
    let f2 = executor.find_lifted_function_for_task(&mut second);
    assert!(Arc::ptr_eq(&f1, &f2));
    assert_eq!(executor.live_trace_count(), 1);

    // And a full run drives both to a clean exit.
    for task in &program.tasks {
        executor.add_initial_task(&task.state, task.pc, task.memory.clone());
    }
    let summary = executor.run().unwrap();
    assert_eq!(summary.exited, 2);
    assert_eq!(summary.faulted, 0);
}

#[test]
fn run_produces_final_register_state() {
    let dir = tempfile::tempdir().unwrap();
    write_code(dir.path());

    let workspace = Workspace::open(dir.path()).unwrap();
    let program = load_snapshot(
        &two_task_snapshot(),
        &workspace.memory_dir().unwrap(),
        tracery_mem::AddressWidth::Bits64,
        false,
    )
    .unwrap();

    let mut executor = Executor::new(
        Arc::new(X86Arch::amd64()),
        Box::new(GenericRuntime),
        Arc::new(X86TraceLifter::amd64()),
        &workspace,
        1,
    )
    .unwrap();

    // Drive one task by hand to observe the register result of the program.
    let mut task = Task::new(
        TaskId(0),
        &program.tasks[0].state,
        program.tasks[0].pc,
        program.tasks[0].memory.clone(),
    );
    let func = executor.find_lifted_function_for_task(&mut task);
    let exit = func.call(&mut task.state, task.pc, task.memory.clone());

    assert_eq!(exit.kind, tracery_cache::TraceExitKind::Exited);
    let regs = X86State::from_bytes(task.state.bytes()).unwrap();
    assert_eq!(regs.gpr[0], 12);
}
