//! Program snapshots: a frozen image of a guest process's address spaces and
//! thread states, plus the loader that rebuilds live [`AddressSpace`]s from
//! one.
//!
//! The on-disk message is a little-endian sectioned format: a header, then
//! repeated address-space records (each with its page ranges), then repeated
//! task records. Page *contents* are not inlined; every non-zero range names
//! a sibling file under the workspace's `memory/` directory.
//!
//! [`AddressSpace`]: tracery_mem::AddressSpace

mod error;
mod io;
mod load;

pub use crate::error::{Result, SnapshotError};
pub use crate::load::{load_snapshot, write_range_contents, LoadedProgram, LoadedTask};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::io::{ReadLeExt, WriteLeExt};

pub const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"TSNP");
pub const SNAPSHOT_VERSION: u16 = 1;

const MAX_ADDRESS_SPACES: usize = 4096;
const MAX_PAGE_RANGES: usize = 65536;
const MAX_TASKS: usize = 4096;
const MAX_NAME_LEN: usize = 4096;
const MAX_STATE_LEN: usize = 1 << 20;

const PAGE_LOW_MASK: u64 = 0xFFF;

/// What kind of mapping a page range was captured from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageRangeKind {
    Anonymous = 0,
    /// All-zero range; no content file exists for it.
    AnonymousZero = 1,
    FileBacked = 2,
    Stack = 3,
    Heap = 4,
    VDso = 5,
    VVar = 6,
    VSyscall = 7,
}

impl PageRangeKind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PageRangeKind::Anonymous,
            1 => PageRangeKind::AnonymousZero,
            2 => PageRangeKind::FileBacked,
            3 => PageRangeKind::Stack,
            4 => PageRangeKind::Heap,
            5 => PageRangeKind::VDso,
            6 => PageRangeKind::VVar,
            7 => PageRangeKind::VSyscall,
            _ => return Err(SnapshotError::Corrupt("invalid page range kind")),
        })
    }

    /// The name the range is mapped under, mirroring how the guest kernel
    /// labels it.
    pub fn map_name(self) -> &'static str {
        match self {
            PageRangeKind::Stack => "[stack]",
            PageRangeKind::Heap => "[heap]",
            PageRangeKind::VDso => "[vdso]",
            PageRangeKind::VVar => "[vvar]",
            PageRangeKind::VSyscall => "[vsyscall]",
            PageRangeKind::Anonymous
            | PageRangeKind::AnonymousZero
            | PageRangeKind::FileBacked => "",
        }
    }
}

/// One captured page range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRange {
    pub base: u64,
    pub limit: u64,
    pub kind: PageRangeKind,
    pub can_read: bool,
    pub can_write: bool,
    pub can_exec: bool,
    /// Name of the content file under `memory/` (empty for zero ranges).
    pub name: String,
    /// Original backing file, for file-backed ranges.
    pub file_path: Option<String>,
    pub file_offset: u64,
}

impl PageRange {
    pub fn size(&self) -> u64 {
        self.limit - self.base
    }
}

/// One captured address space; `parent_id` links copy-on-write forks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressSpaceRecord {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub page_ranges: Vec<PageRange>,
}

/// One captured thread of execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRecord {
    pub address_space_id: i64,
    pub pc: u64,
    /// Opaque architecture-specific register blob.
    pub state: Vec<u8>,
}

/// The whole snapshot message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgramSnapshot {
    pub address_spaces: Vec<AddressSpaceRecord>,
    pub tasks: Vec<TaskRecord>,
}

impl ProgramSnapshot {
    pub fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32_le(SNAPSHOT_MAGIC)?;
        w.write_u16_le(SNAPSHOT_VERSION)?;
        w.write_u16_le(0)?; // reserved

        w.write_u32_le(self.address_spaces.len() as u32)?;
        for space in &self.address_spaces {
            space.encode(w)?;
        }

        w.write_u32_le(self.tasks.len() as u32)?;
        for task in &self.tasks {
            w.write_i64_le(task.address_space_id)?;
            w.write_u64_le(task.pc)?;
            w.write_len_prefixed_bytes_u32(&task.state)?;
        }
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self> {
        if r.read_u32_le()? != SNAPSHOT_MAGIC {
            return Err(SnapshotError::Corrupt("bad snapshot magic"));
        }
        if r.read_u16_le()? != SNAPSHOT_VERSION {
            return Err(SnapshotError::Corrupt("unsupported snapshot version"));
        }
        let _reserved = r.read_u16_le()?;

        let space_count = r.read_u32_le()? as usize;
        if space_count > MAX_ADDRESS_SPACES {
            return Err(SnapshotError::Corrupt("too many address spaces"));
        }
        let mut address_spaces = Vec::with_capacity(space_count);
        for _ in 0..space_count {
            address_spaces.push(AddressSpaceRecord::decode(r)?);
        }

        let task_count = r.read_u32_le()? as usize;
        if task_count > MAX_TASKS {
            return Err(SnapshotError::Corrupt("too many tasks"));
        }
        let mut tasks = Vec::with_capacity(task_count);
        for _ in 0..task_count {
            let address_space_id = r.read_i64_le()?;
            let pc = r.read_u64_le()?;
            let state_len = r.read_u32_le()? as usize;
            if state_len > MAX_STATE_LEN {
                return Err(SnapshotError::Corrupt("task state too large"));
            }
            let state = r.read_exact_vec(state_len)?;
            tasks.push(TaskRecord {
                address_space_id,
                pc,
                state,
            });
        }

        Ok(Self {
            address_spaces,
            tasks,
        })
    }

    /// Write the message to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.encode(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Read the message from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::decode(&mut reader)
    }
}

impl AddressSpaceRecord {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i64_le(self.id)?;
        match self.parent_id {
            Some(parent) => {
                w.write_u8(1)?;
                w.write_i64_le(parent)?;
            }
            None => w.write_u8(0)?,
        }
        w.write_u32_le(self.page_ranges.len() as u32)?;
        for range in &self.page_ranges {
            range.encode(w)?;
        }
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let id = r.read_i64_le()?;
        let parent_id = match r.read_u8()? {
            0 => None,
            1 => Some(r.read_i64_le()?),
            _ => return Err(SnapshotError::Corrupt("bad parent-id tag")),
        };
        let range_count = r.read_u32_le()? as usize;
        if range_count > MAX_PAGE_RANGES {
            return Err(SnapshotError::Corrupt("too many page ranges"));
        }
        let mut page_ranges = Vec::with_capacity(range_count);
        for _ in 0..range_count {
            page_ranges.push(PageRange::decode(r)?);
        }
        Ok(Self {
            id,
            parent_id,
            page_ranges,
        })
    }
}

impl PageRange {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64_le(self.base)?;
        w.write_u64_le(self.limit)?;
        w.write_u8(self.kind as u8)?;
        let mut perms = 0u8;
        if self.can_read {
            perms |= 1;
        }
        if self.can_write {
            perms |= 2;
        }
        if self.can_exec {
            perms |= 4;
        }
        w.write_u8(perms)?;
        w.write_string_u32(&self.name)?;
        match &self.file_path {
            Some(path) => {
                w.write_u8(1)?;
                w.write_string_u32(path)?;
            }
            None => w.write_u8(0)?,
        }
        w.write_u64_le(self.file_offset)?;
        Ok(())
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let base = r.read_u64_le()?;
        let limit = r.read_u64_le()?;
        if limit <= base {
            return Err(SnapshotError::Corrupt("page range limit not above base"));
        }
        if base & PAGE_LOW_MASK != 0 || limit & PAGE_LOW_MASK != 0 {
            return Err(SnapshotError::Corrupt("page range is not page-aligned"));
        }

        let kind = PageRangeKind::from_u8(r.read_u8()?)?;
        let perms = r.read_u8()?;
        let name = r.read_string_u32(MAX_NAME_LEN)?;
        let file_path = match r.read_u8()? {
            0 => None,
            1 => Some(r.read_string_u32(MAX_NAME_LEN)?),
            _ => return Err(SnapshotError::Corrupt("bad file-path tag")),
        };
        let file_offset = r.read_u64_le()?;

        if kind == PageRangeKind::FileBacked && file_path.is_none() {
            return Err(SnapshotError::Corrupt(
                "file-backed page range has no file path",
            ));
        }
        if kind != PageRangeKind::AnonymousZero && name.is_empty() {
            return Err(SnapshotError::Corrupt(
                "non-zero page range has no content file name",
            ));
        }

        Ok(Self {
            base,
            limit,
            kind,
            can_read: perms & 1 != 0,
            can_write: perms & 2 != 0,
            can_exec: perms & 4 != 0,
            name,
            file_path,
            file_offset,
        })
    }
}
