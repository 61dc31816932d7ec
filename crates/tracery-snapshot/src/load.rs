use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use tracery_mem::{lock_space, AddressSpace, AddressSpaceHandle, AddressWidth, Pc};

use crate::error::{Result, SnapshotError};
use crate::{PageRange, PageRangeKind, ProgramSnapshot};

/// A snapshot rebuilt into live address spaces, ready to seed an executor.
pub struct LoadedProgram {
    pub address_spaces: HashMap<i64, AddressSpaceHandle>,
    pub tasks: Vec<LoadedTask>,
}

pub struct LoadedTask {
    pub state: Vec<u8>,
    pub pc: Pc,
    pub memory: AddressSpaceHandle,
}

/// Rebuild every address space and task of `snapshot`, reading range contents
/// from `memory_dir`.
///
/// Spaces are created in snapshot order; a record with a `parent_id` clones
/// the already-loaded parent (copy-on-write) before applying its own ranges.
pub fn load_snapshot(
    snapshot: &ProgramSnapshot,
    memory_dir: &Path,
    width: AddressWidth,
    version_code: bool,
) -> Result<LoadedProgram> {
    let mut address_spaces: HashMap<i64, AddressSpaceHandle> = HashMap::new();

    for record in &snapshot.address_spaces {
        info!("initializing address space {}", record.id);
        if address_spaces.contains_key(&record.id) {
            return Err(SnapshotError::DuplicateAddressSpace(record.id));
        }

        let mut space = match record.parent_id {
            Some(parent_id) => {
                let parent = address_spaces.get(&parent_id).ok_or(
                    SnapshotError::UnknownParent {
                        space: record.id,
                        parent: parent_id,
                    },
                )?;
                lock_space(parent).clone()
            }
            None => AddressSpace::new(width, version_code),
        };

        for range in &record.page_ranges {
            apply_page_range(&mut space, range, memory_dir)?;
        }

        address_spaces.insert(record.id, space.into_handle());
    }

    let mut tasks = Vec::with_capacity(snapshot.tasks.len());
    for (task_index, task) in snapshot.tasks.iter().enumerate() {
        let memory = address_spaces
            .get(&task.address_space_id)
            .ok_or(SnapshotError::UnknownAddressSpace {
                task_index,
                id: task.address_space_id,
            })?
            .clone();
        info!(
            "adding task starting at {:#x} in address space {}",
            task.pc, task.address_space_id
        );
        tasks.push(LoadedTask {
            state: task.state.clone(),
            pc: Pc::new(task.pc),
            memory,
        });
    }

    Ok(LoadedProgram {
        address_spaces,
        tasks,
    })
}

fn apply_page_range(space: &mut AddressSpace, range: &PageRange, memory_dir: &Path) -> Result<()> {
    let map_name = match (&range.file_path, range.kind) {
        (Some(path), _) => path.as_str(),
        (None, kind) => kind.map_name(),
    };

    if range.kind == PageRangeKind::AnonymousZero {
        space.add_zero_map(range.base, range.size(), map_name);
    } else {
        space.add_map(range.base, range.size(), map_name, range.file_offset);
        load_range_contents(space, range, memory_dir)?;
    }

    if range.kind == PageRangeKind::Heap {
        space.set_initial_program_break(range.limit);
    }

    space.set_permissions(
        range.base,
        range.size(),
        range.can_read,
        range.can_write,
        range.can_exec,
    );
    Ok(())
}

/// Copy the range's saved bytes out of its `memory/<name>` sibling file.
fn load_range_contents(space: &mut AddressSpace, range: &PageRange, memory_dir: &Path) -> Result<()> {
    let path = memory_dir.join(&range.name);
    if !path.is_file() {
        return Err(SnapshotError::MissingRangeFile(path));
    }

    let expected = range.size();
    let actual = fs::metadata(&path)?.len();
    if actual < expected {
        return Err(SnapshotError::RangeFileTooSmall {
            path,
            expected,
            actual,
        });
    }

    debug!(
        "loading file {} into range [{:#x}, {:#x})",
        path.display(),
        range.base,
        range.limit
    );

    let contents = fs::read(&path)?;
    if !space.try_write_bytes(range.base, &contents[..expected as usize]) {
        return Err(SnapshotError::Corrupt(
            "freshly mapped range rejected its contents",
        ));
    }
    Ok(())
}

/// Write a range's content file the way the snapshot tool lays it out; used
/// by tests and tooling that assemble workspaces by hand.
pub fn write_range_contents(memory_dir: &Path, name: &str, contents: &[u8]) -> Result<()> {
    fs::create_dir_all(memory_dir)?;
    fs::write(memory_dir.join(name), contents)?;
    Ok(())
}
