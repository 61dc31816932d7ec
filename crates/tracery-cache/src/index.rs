use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::debug;

use tracery_decode::TraceId;
use tracery_mem::{CodeVersion, Pc};

use crate::error::Result;
use crate::live::LiveTraceId;

/// One persisted translation: which trace content answers which dispatch key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub trace_id: TraceId,
    pub live_id: LiveTraceId,
}

const ENTRY_LEN: usize = 32;

impl IndexEntry {
    fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut raw = [0u8; ENTRY_LEN];
        raw[0..8].copy_from_slice(&self.trace_id.entry_pc.get().to_le_bytes());
        raw[8..16].copy_from_slice(&self.trace_id.hash.to_le_bytes());
        raw[16..24].copy_from_slice(&self.live_id.pc.get().to_le_bytes());
        raw[24..32].copy_from_slice(&self.live_id.code_version.get().to_le_bytes());
        raw
    }

    fn decode(raw: &[u8; ENTRY_LEN]) -> Self {
        let u64_at = |off: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&raw[off..off + 8]);
            u64::from_le_bytes(buf)
        };
        Self {
            trace_id: TraceId {
                entry_pc: Pc::new(u64_at(0)),
                hash: u64_at(8),
            },
            live_id: LiveTraceId {
                pc: Pc::new(u64_at(16)),
                code_version: CodeVersion::from_digest(u64_at(24)),
            },
        }
    }
}

/// Append-only file of fixed-size [`IndexEntry`] records.
///
/// Appends take an exclusive advisory lock so concurrent executors sharing a
/// workspace do not interleave partial records; readers take a shared lock
/// and silently drop a truncated tail.
pub struct FileBackedIndex {
    path: PathBuf,
}

impl FileBackedIndex {
    pub fn open(path: &Path) -> Result<Self> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every complete record in the file.
    pub fn load(&self) -> Result<Vec<IndexEntry>> {
        let mut file = File::open(&self.path)?;
        file.lock_shared()?;
        let result = read_entries(&mut file);
        FileExt::unlock(&file)?;
        result
    }

    /// Append `entries` atomically with respect to other index writers.
    pub fn append(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let mut result: Result<()> = (|| {
            file.seek(SeekFrom::End(0))?;
            for entry in entries {
                file.write_all(&entry.encode())?;
            }
            file.flush()?;
            Ok(())
        })();
        if let Err(err) = FileExt::unlock(&file) {
            result = result.and(Err(err.into()));
        }
        result
    }
}

fn read_entries(file: &mut File) -> Result<Vec<IndexEntry>> {
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    let complete = contents.len() / ENTRY_LEN;
    if contents.len() % ENTRY_LEN != 0 {
        debug!(
            "index has a partial tail of {} bytes; ignoring it",
            contents.len() % ENTRY_LEN
        );
    }

    let mut entries = Vec::with_capacity(complete);
    for chunk in contents.chunks_exact(ENTRY_LEN) {
        let mut raw = [0u8; ENTRY_LEN];
        raw.copy_from_slice(chunk);
        entries.push(IndexEntry::decode(&raw));
    }
    Ok(entries)
}
