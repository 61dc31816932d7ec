//! Compiled-trace management: the host-function ABI, the in-memory live
//! dispatch index, and the file-backed code cache.
//!
//! Translations are keyed two ways. A [`TraceId`] identifies a trace by its
//! byte content and deduplicates translations across address spaces; a
//! [`LiveTraceId`] pairs a PC with the code version observed at decode time
//! and is the key of the hot dispatch table. The on-disk index records the
//! mapping between the two so later runs can repopulate their dispatch tables
//! without re-decoding guest memory.

mod artifact;
mod cache;
mod error;
mod index;
mod live;

pub use crate::cache::CodeCache;
pub use crate::error::{CacheError, Result};
pub use crate::index::{FileBackedIndex, IndexEntry};
pub use crate::live::{LiveTraceId, LiveTraceIndex};

use std::sync::Arc;

use tracery_decode::{DecodedTrace, TraceId};
use tracery_mem::{AddressSpaceHandle, Pc};

/// Opaque architecture-specific register state, as captured in a snapshot.
///
/// The executor never interprets these bytes; only the lifter's functions and
/// the guest runtime know the layout.
#[derive(Clone)]
pub struct ArchState {
    bytes: Vec<u8>,
}

impl ArchState {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }
}

impl std::fmt::Debug for ArchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArchState({} bytes)", self.bytes.len())
    }
}

/// How a lifted function handed control back to the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceExitKind {
    /// Trace boundary: re-dispatch at `next_pc`.
    Normal,
    /// The task finished cleanly.
    Exited,
    /// The task parked on blocking runtime work; re-dispatch once it is
    /// runnable again.
    Blocked,
    /// Guest fault or undecodable code; the task cannot continue.
    Error,
}

/// Result of running one lifted trace.
///
/// The memory handle rides along because runtime work performed inside the
/// trace (fork-style system calls) can leave the task in a different address
/// space than it entered with.
pub struct TraceExit {
    pub next_pc: Pc,
    pub memory: AddressSpaceHandle,
    pub kind: TraceExitKind,
}

/// A compiled host function for one trace.
pub trait LiftedFunction: Send + Sync {
    fn call(&self, state: &mut ArchState, pc: Pc, memory: AddressSpaceHandle) -> TraceExit;
}

pub type LiftedFn = Arc<dyn LiftedFunction>;

impl<F> LiftedFunction for F
where
    F: Fn(&mut ArchState, Pc, AddressSpaceHandle) -> TraceExit + Send + Sync,
{
    fn call(&self, state: &mut ArchState, pc: Pc, memory: AddressSpaceHandle) -> TraceExit {
        self(state, pc, memory)
    }
}

/// A batch of traces lifted into host functions.
pub struct LiftedModule {
    pub functions: Vec<LiftedTraceFunction>,
}

pub struct LiftedTraceFunction {
    pub id: TraceId,
    pub func: LiftedFn,
}

/// Translates batches of decoded traces into host functions.
///
/// Implementations run on the lifter worker pool; lifting must be
/// deterministic in the trace bytes, which is why failed lifts are never
/// retried.
pub trait Lifter: Send + Sync {
    fn lift(&self, traces: &[DecodedTrace]) -> Result<LiftedModule>;
}
