use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use tracery_cache::{CodeCache, LiftedFn, Lifter, LiveTraceId, LiveTraceIndex, TraceExitKind};
use tracery_decode::{decode_traces, GuestArch};
use tracery_mem::{lock_space, AddressSpaceHandle, Pc};

use crate::error::Result;
use crate::pool::LifterPool;
use crate::runtime::Runtime;
use crate::task::{Task, TaskId, TaskStatus};
use crate::workspace::Workspace;

/// A task recovered from a snapshot, not yet instantiated.
pub struct InitialTaskInfo {
    pub state: Vec<u8>,
    pub pc: Pc,
    pub memory: AddressSpaceHandle,
}

/// Tally of how the run's tasks finished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub exited: u64,
    pub faulted: u64,
}

/// Task executor: owns the tasks, the live-trace dispatch table, and the
/// decode/lift/compile pipeline behind it.
pub struct Executor {
    runtime: Box<dyn Runtime>,
    translator: Translator,
    initial_tasks: Vec<InitialTaskInfo>,
    tasks: Vec<Task>,
    next_task_id: u64,
    summary: RunSummary,
}

impl Executor {
    pub fn new(
        arch: Arc<dyn GuestArch>,
        runtime: Box<dyn Runtime>,
        lifter: Arc<dyn Lifter>,
        workspace: &Workspace,
        lift_workers: usize,
    ) -> Result<Self> {
        let code_cache = CodeCache::open(&workspace.index_path(), &workspace.bitcode_dir()?)?;
        let error_fn = runtime.error_function();
        let mut translator = Translator {
            arch,
            pool: LifterPool::new(lifter, lift_workers),
            code_cache,
            live_traces: LiveTraceIndex::new(),
            error_fn,
        };
        translator.restore_translations()?;

        Ok(Self {
            runtime,
            translator,
            initial_tasks: Vec::new(),
            tasks: Vec::new(),
            next_task_id: 0,
            summary: RunSummary::default(),
        })
    }

    /// Queue a task deserialised from the snapshot; instantiated by
    /// [`Executor::run`].
    pub fn add_initial_task(&mut self, state: &[u8], pc: Pc, memory: AddressSpaceHandle) {
        self.initial_tasks.push(InitialTaskInfo {
            state: state.to_vec(),
            pc,
            memory,
        });
    }

    /// Run to completion: init the runtime, create the initial tasks, drive
    /// the dispatch loop until no task remains, then tear down.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.runtime.init();

        let initial = std::mem::take(&mut self.initial_tasks);
        for info in initial {
            self.create_task(&info.state, info.pc, info.memory);
        }

        self.resume();
        self.runtime.fini();
        Ok(self.summary)
    }

    /// Allocate a task (including its coroutine) and hand it to the runtime's
    /// create hook.
    pub fn create_task(&mut self, state: &[u8], pc: Pc, memory: AddressSpaceHandle) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;

        let mut task = Task::new(id, state, pc, memory);
        self.runtime.on_task_created(&mut task);
        info!("created {id} starting at {pc}");
        self.tasks.push(task);
        id
    }

    /// The dispatch primitive: resolve the task's `(PC, CodeVersion)` key to
    /// a host function, decoding and lifting on a miss.
    pub fn find_lifted_function_for_task(&mut self, task: &mut Task) -> LiftedFn {
        self.translator.find_lifted_function_for_task(task)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn live_trace_count(&self) -> usize {
        self.translator.live_traces.len()
    }

    fn resume(&mut self) {
        loop {
            let mut ran_any = false;
            for idx in 0..self.tasks.len() {
                self.tasks[idx].poll_blocked();
                if self.tasks[idx].status == TaskStatus::Runnable {
                    self.step_task(idx);
                    ran_any = true;
                }
            }

            let summary = &mut self.summary;
            self.tasks.retain(|task| match task.status {
                TaskStatus::Exited => {
                    info!("{} exited", task.id);
                    summary.exited += 1;
                    false
                }
                TaskStatus::Faulted => {
                    warn!("{} faulted at {}", task.id, task.pc);
                    summary.faulted += 1;
                    false
                }
                TaskStatus::Runnable | TaskStatus::Blocked => true,
            });

            if self.tasks.is_empty() {
                break;
            }
            if !ran_any {
                // Everything is parked on coroutine work; poll again shortly.
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn step_task(&mut self, idx: usize) {
        let task = &mut self.tasks[idx];
        let func = self.translator.find_lifted_function_for_task(task);

        let exit = func.call(&mut task.state, task.pc, task.memory.clone());
        task.pc = exit.next_pc;
        task.memory = exit.memory;
        match exit.kind {
            TraceExitKind::Normal => {}
            TraceExitKind::Exited => task.status = TaskStatus::Exited,
            TraceExitKind::Blocked => task.status = TaskStatus::Blocked,
            TraceExitKind::Error => task.status = TaskStatus::Faulted,
        }
    }
}

struct Translator {
    arch: Arc<dyn GuestArch>,
    pool: LifterPool,
    code_cache: CodeCache,
    live_traces: LiveTraceIndex,
    error_fn: LiftedFn,
}

impl Translator {
    fn find_lifted_function_for_task(&mut self, task: &mut Task) -> LiftedFn {
        let code_version = lock_space(&task.memory).compute_code_version(task.pc);
        let live_id = LiveTraceId {
            pc: task.pc,
            code_version,
        };

        if let Some(func) = self.live_traces.get(&live_id) {
            return func;
        }

        self.decode_traces_from_task(task);

        match self.live_traces.get(&live_id) {
            Some(func) => func,
            None => {
                warn!(
                    "no translation for {} at {}; dispatching the error intrinsic",
                    task.id, task.pc
                );
                self.error_fn.clone()
            }
        }
    }

    /// Decode everything reachable from the task's PC, lift it on the worker
    /// pool, and install the resulting functions under their decode-time code
    /// versions.
    fn decode_traces_from_task(&mut self, task: &mut Task) {
        let traces = {
            let mut space = lock_space(&task.memory);
            decode_traces(self.arch.as_ref(), &mut space, task.pc)
        };
        if traces.is_empty() {
            return;
        }
        debug!(
            "decoded {} traces for {} at {}",
            traces.len(),
            task.id,
            task.pc
        );

        let pending = self.pool.submit(traces.clone());
        let module = match pending.wait() {
            Ok(module) => module,
            Err(err) => {
                error!("lifting failed at {}: {err}", task.pc);
                return;
            }
        };

        let newly_compiled = self.code_cache.install_module(module);
        for trace in &traces {
            let Some(func) = self.code_cache.lookup(&trace.id) else {
                warn!("lifted module is missing trace at {}", trace.entry_pc);
                continue;
            };
            let live_id = LiveTraceId {
                pc: trace.entry_pc,
                code_version: trace.code_version,
            };
            self.live_traces.insert(live_id, func);

            if newly_compiled.contains(&trace.id) {
                if let Err(err) = self.code_cache.store_trace(trace) {
                    warn!("failed to persist trace at {}: {err}", trace.entry_pc);
                }
            }
            if let Err(err) = self.code_cache.record_translation(trace.id, live_id) {
                warn!("failed to record translation at {}: {err}", trace.entry_pc);
            }
        }
    }

    /// Repopulate the live index from the on-disk index and trace artifacts,
    /// re-lifting stored traces instead of re-decoding guest memory.
    fn restore_translations(&mut self) -> Result<()> {
        let entries = self.code_cache.saved_translations()?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut seen = HashSet::new();
        let mut live_ids = Vec::new();
        let mut traces = Vec::new();
        for entry in entries {
            if !seen.insert(entry.live_id) {
                continue;
            }
            if let Some(trace) = self
                .code_cache
                .load_trace(&entry.trace_id, entry.live_id.code_version)
            {
                live_ids.push(entry.live_id);
                traces.push(trace);
            }
        }
        if traces.is_empty() {
            return Ok(());
        }

        let module = match self.pool.submit(traces.clone()).wait() {
            Ok(module) => module,
            Err(err) => {
                // Stale artifacts are a cache miss, not a startup failure.
                warn!("could not re-lift cached traces: {err}");
                return Ok(());
            }
        };
        self.code_cache.install_module(module);

        let mut restored = 0usize;
        for (live_id, trace) in live_ids.iter().zip(&traces) {
            if let Some(func) = self.code_cache.lookup(&trace.id) {
                self.live_traces.insert(*live_id, func);
                restored += 1;
            }
        }
        info!("restored {restored} translations from the code cache");
        Ok(())
    }
}
