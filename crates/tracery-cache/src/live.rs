use std::collections::HashMap;

use tracery_mem::{CodeVersion, Pc};

use crate::LiftedFn;

/// Dispatch key: a PC paired with the code version of its enclosing range.
///
/// Keeping the version in the key lets multiple address spaces stay live
/// simultaneously: a self-modifying write bumps the version, so stale
/// translations simply stop being found, while forks that still share the old
/// bytes keep hitting them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LiveTraceId {
    pub pc: Pc,
    pub code_version: CodeVersion,
}

/// The hot dispatch table: `LiveTraceId` to compiled host function.
#[derive(Default)]
pub struct LiveTraceIndex {
    map: HashMap<LiveTraceId, LiftedFn>,
}

impl LiveTraceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &LiveTraceId) -> Option<LiftedFn> {
        self.map.get(id).cloned()
    }

    pub fn contains(&self, id: &LiveTraceId) -> bool {
        self.map.contains_key(id)
    }

    pub fn insert(&mut self, id: LiveTraceId, func: LiftedFn) {
        self.map.insert(id, func);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
