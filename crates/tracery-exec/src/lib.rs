//! The executor: owns tasks, drives the dispatch loop, and coordinates
//! decode, lift, and compile work on translation misses.
//!
//! One host thread runs the dispatch loop over cooperative tasks; a bounded
//! worker pool lifts decoded traces off that thread. Blocking guest work runs
//! on per-task coroutine threads so the dispatch thread itself never blocks.

mod coroutine;
mod error;
mod executor;
mod pool;
mod runtime;
mod task;
mod workspace;

pub use crate::coroutine::{Completion, Coroutine, Poll};
pub use crate::error::{ExecError, Result};
pub use crate::executor::{Executor, InitialTaskInfo, RunSummary};
pub use crate::pool::{LifterPool, PendingModule};
pub use crate::runtime::{GenericRuntime, Runtime};
pub use crate::task::{Task, TaskId, TaskStatus};
pub use crate::workspace::Workspace;
