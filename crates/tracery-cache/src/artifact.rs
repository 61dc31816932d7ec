//! On-disk trace artifacts.
//!
//! The original input to a translation is the decoded trace itself, so that
//! is what the cache persists: a later run that finds `(TraceId, CodeVersion)`
//! in the index can reload the trace and re-lift it without touching guest
//! memory. Readers treat any malformed file as a miss.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use tracery_decode::{Category, DecodedInstruction, DecodedTrace, TraceId};
use tracery_mem::{CodeVersion, Pc};

use crate::error::{CacheError, Result};

const ARTIFACT_MAGIC: u32 = 0x5452_4345; // "TRCE"
const ARTIFACT_VERSION: u16 = 1;

pub fn artifact_path(dir: &Path, id: &TraceId, version: CodeVersion) -> PathBuf {
    dir.join(format!(
        "{:016x}_{:016x}.{:016x}.trace",
        id.entry_pc.get(),
        id.hash,
        version.get()
    ))
}

pub fn store_trace(dir: &Path, trace: &DecodedTrace) -> Result<()> {
    let mut raw = Vec::new();
    raw.write_all(&ARTIFACT_MAGIC.to_le_bytes())?;
    raw.write_all(&ARTIFACT_VERSION.to_le_bytes())?;
    raw.write_all(&trace.entry_pc.get().to_le_bytes())?;
    raw.write_all(&trace.code_version.get().to_le_bytes())?;
    raw.write_all(&trace.id.hash.to_le_bytes())?;
    raw.write_all(&(trace.instructions.len() as u32).to_le_bytes())?;
    for inst in trace.instructions.values() {
        raw.write_all(&inst.pc.get().to_le_bytes())?;
        raw.write_all(&[category_to_u8(inst.category)])?;
        raw.write_all(&inst.next_pc.get().to_le_bytes())?;
        write_opt_pc(&mut raw, inst.branch_taken_pc)?;
        write_opt_pc(&mut raw, inst.branch_not_taken_pc)?;
        raw.write_all(&(inst.bytes.len() as u32).to_le_bytes())?;
        raw.write_all(&inst.bytes)?;
    }

    let path = artifact_path(dir, &trace.id, trace.code_version);
    fs::write(path, raw)?;
    Ok(())
}

/// Load the artifact for `(id, version)`, or `None` if it is missing or
/// unreadable.
pub fn load_trace(dir: &Path, id: &TraceId, version: CodeVersion) -> Option<DecodedTrace> {
    let path = artifact_path(dir, id, version);
    let raw = fs::read(&path).ok()?;
    match parse_trace(&raw, id, version) {
        Ok(trace) => Some(trace),
        Err(err) => {
            warn!("ignoring unreadable trace artifact {}: {err}", path.display());
            None
        }
    }
}

fn parse_trace(raw: &[u8], id: &TraceId, version: CodeVersion) -> Result<DecodedTrace> {
    let mut cursor = Cursor::new(raw);

    if read_u32(&mut cursor)? != ARTIFACT_MAGIC {
        return Err(CacheError::Corrupt("bad artifact magic"));
    }
    if read_u16(&mut cursor)? != ARTIFACT_VERSION {
        return Err(CacheError::Corrupt("unsupported artifact version"));
    }

    let entry_pc = Pc::new(read_u64(&mut cursor)?);
    let code_version = CodeVersion::from_digest(read_u64(&mut cursor)?);
    let hash = read_u64(&mut cursor)?;
    if entry_pc != id.entry_pc || hash != id.hash || code_version != version {
        return Err(CacheError::Corrupt("artifact does not match its key"));
    }

    let count = read_u32(&mut cursor)? as usize;
    let mut instructions = BTreeMap::new();
    for _ in 0..count {
        let pc = Pc::new(read_u64(&mut cursor)?);
        let category = category_from_u8(read_u8(&mut cursor)?)?;
        let next_pc = Pc::new(read_u64(&mut cursor)?);
        let branch_taken_pc = read_opt_pc(&mut cursor)?;
        let branch_not_taken_pc = read_opt_pc(&mut cursor)?;
        let len = read_u32(&mut cursor)? as usize;
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes)?;
        instructions.insert(
            pc,
            DecodedInstruction {
                pc,
                bytes,
                category,
                next_pc,
                branch_taken_pc,
                branch_not_taken_pc,
            },
        );
    }

    Ok(DecodedTrace {
        entry_pc,
        code_version,
        id: *id,
        instructions,
    })
}

fn write_opt_pc(out: &mut Vec<u8>, pc: Option<Pc>) -> Result<()> {
    match pc {
        Some(pc) => {
            out.write_all(&[1])?;
            out.write_all(&pc.get().to_le_bytes())?;
        }
        None => out.write_all(&[0])?,
    }
    Ok(())
}

fn read_opt_pc(cursor: &mut Cursor<&[u8]>) -> Result<Option<Pc>> {
    match read_u8(cursor)? {
        0 => Ok(None),
        1 => Ok(Some(Pc::new(read_u64(cursor)?))),
        _ => Err(CacheError::Corrupt("bad optional-pc tag")),
    }
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn category_to_u8(category: Category) -> u8 {
    match category {
        Category::Normal => 0,
        Category::NoOp => 1,
        Category::Error => 2,
        Category::Invalid => 3,
        Category::DirectJump => 4,
        Category::IndirectJump => 5,
        Category::ConditionalBranch => 6,
        Category::DirectCall => 7,
        Category::IndirectCall => 8,
        Category::Return => 9,
        Category::AsyncHypercall => 10,
        Category::ConditionalAsyncHypercall => 11,
    }
}

fn category_from_u8(raw: u8) -> Result<Category> {
    Ok(match raw {
        0 => Category::Normal,
        1 => Category::NoOp,
        2 => Category::Error,
        3 => Category::Invalid,
        4 => Category::DirectJump,
        5 => Category::IndirectJump,
        6 => Category::ConditionalBranch,
        7 => Category::DirectCall,
        8 => Category::IndirectCall,
        9 => Category::Return,
        10 => Category::AsyncHypercall,
        11 => Category::ConditionalAsyncHypercall,
        _ => return Err(CacheError::Corrupt("bad instruction category")),
    })
}
