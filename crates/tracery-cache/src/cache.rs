use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use tracery_decode::{DecodedTrace, TraceId};
use tracery_mem::CodeVersion;

use crate::artifact;
use crate::error::Result;
use crate::index::{FileBackedIndex, IndexEntry};
use crate::live::LiveTraceId;
use crate::{LiftedFn, LiftedModule};

/// Holds every compiled translation of the current run, keyed by trace
/// content, plus the persistent side: the translation index and the trace
/// artifacts that allow later runs to rebuild their dispatch tables.
pub struct CodeCache {
    compiled: HashMap<TraceId, LiftedFn>,
    index: FileBackedIndex,
    artifact_dir: PathBuf,
}

impl CodeCache {
    pub fn open(index_path: &Path, artifact_dir: &Path) -> Result<Self> {
        fs::create_dir_all(artifact_dir)?;
        Ok(Self {
            compiled: HashMap::new(),
            index: FileBackedIndex::open(index_path)?,
            artifact_dir: artifact_dir.to_path_buf(),
        })
    }

    /// Compiled function for `id`, if this run has produced or reloaded one.
    pub fn lookup(&self, id: &TraceId) -> Option<LiftedFn> {
        self.compiled.get(id).cloned()
    }

    /// Install every symbol of a lifted module. Returns the trace ids that
    /// were new to this cache; re-lifts of known content are deduplicated.
    pub fn install_module(&mut self, module: LiftedModule) -> Vec<TraceId> {
        let mut installed = Vec::new();
        for function in module.functions {
            if self.compiled.insert(function.id, function.func).is_none() {
                installed.push(function.id);
            } else {
                debug!(
                    "replacing translation for trace {:x}/{:016x}",
                    function.id.entry_pc, function.id.hash
                );
            }
        }
        installed
    }

    /// Record that `trace_id` answers dispatches on `live_id`, durably.
    pub fn record_translation(&self, trace_id: TraceId, live_id: LiveTraceId) -> Result<()> {
        self.index.append(&[IndexEntry { trace_id, live_id }])
    }

    /// All translations recorded by this and previous runs.
    pub fn saved_translations(&self) -> Result<Vec<IndexEntry>> {
        self.index.load()
    }

    /// Persist the decoded trace behind a translation so later runs can
    /// re-lift it without re-decoding guest memory.
    pub fn store_trace(&self, trace: &DecodedTrace) -> Result<()> {
        artifact::store_trace(&self.artifact_dir, trace)
    }

    /// Reload a persisted trace; `None` if it was never stored or the file
    /// is unreadable (unreadable entries are ignored, not errors).
    pub fn load_trace(&self, id: &TraceId, version: CodeVersion) -> Option<DecodedTrace> {
        artifact::load_trace(&self.artifact_dir, id, version)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}
