use tracery_cache::ArchState;
use tracery_mem::{AddressSpaceHandle, Pc};

use crate::coroutine::{Completion, Coroutine};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task {}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Runnable,
    /// Parked on blocking runtime work; see [`Task::block_on`].
    Blocked,
    Exited,
    /// Stopped by a guest fault or undecodable code.
    Faulted,
}

/// One cooperative guest task.
pub struct Task {
    pub id: TaskId,
    pub state: ArchState,
    pub pc: Pc,
    pub status: TaskStatus,
    pub memory: AddressSpaceHandle,
    pub fpu_rounding_mode: u8,
    pub program_break: u64,
    coroutine: Coroutine,
    wait: Option<Completion<()>>,
}

impl Task {
    /// Allocate a task, including its coroutine stack. The runtime hook
    /// fills in rounding mode and program break afterwards.
    pub fn new(id: TaskId, state: &[u8], pc: Pc, memory: AddressSpaceHandle) -> Self {
        Self {
            id,
            state: ArchState::from_bytes(state),
            pc,
            status: TaskStatus::Runnable,
            memory,
            fpu_rounding_mode: 0,
            program_break: 0,
            coroutine: Coroutine::new(&id.0.to_string()),
            wait: None,
        }
    }

    /// Park this task on blocking work executed on its coroutine stack.
    ///
    /// The dispatch thread keeps running other tasks; this one becomes
    /// runnable again once the work completes and the executor observes it
    /// at a trace boundary.
    pub fn block_on<F>(&mut self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.wait = Some(self.coroutine.run(work));
        self.status = TaskStatus::Blocked;
    }

    /// Poll outstanding blocking work; updates the status accordingly.
    pub fn poll_blocked(&mut self) {
        if self.status != TaskStatus::Blocked {
            return;
        }
        let Some(wait) = &self.wait else {
            // Nothing to wait on; the block was spurious.
            self.status = TaskStatus::Runnable;
            return;
        };
        match wait.poll() {
            crate::coroutine::Poll::Pending => {}
            crate::coroutine::Poll::Ready(()) => {
                self.wait = None;
                self.status = TaskStatus::Runnable;
            }
            crate::coroutine::Poll::Failed => {
                self.wait = None;
                self.status = TaskStatus::Faulted;
            }
        }
    }
}
