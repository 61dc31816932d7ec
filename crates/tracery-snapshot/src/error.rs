use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("allocation of {len} bytes failed")]
    OutOfMemory { len: usize },

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),

    #[error("address space {0} appears twice in the snapshot")]
    DuplicateAddressSpace(i64),

    #[error("address space {space} references unknown parent {parent}")]
    UnknownParent { space: i64, parent: i64 },

    #[error("task {task_index} references unknown address space {id}")]
    UnknownAddressSpace { task_index: usize, id: i64 },

    #[error("range content file {0} does not exist")]
    MissingRangeFile(PathBuf),

    #[error("range content file {path} holds {actual} bytes, expected at least {expected}")]
    RangeFileTooSmall {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}
