use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Result;

/// On-disk layout of one emulation workspace:
///
/// ```text
/// <root>/snapshot        the program snapshot
/// <root>/index           code-cache translation index
/// <root>/memory/<name>   raw page contents per mapped range
/// <root>/bitcode/        persisted trace artifacts
/// <root>/<hash>/lib/     per-tool compiled artifacts
/// ```
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open (creating if needed) the workspace rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("snapshot")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn memory_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("memory");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn bitcode_dir(&self) -> Result<PathBuf> {
        let dir = self.root.join("bitcode");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Directory for artifacts specific to one runtime/tool combination; the
    /// name is a digest so different combinations never collide.
    pub fn tool_dir(&self, runtime: &str, tools: &str) -> Result<PathBuf> {
        let mut hasher = Sha256::new();
        hasher.update(runtime.as_bytes());
        hasher.update(tools.as_bytes());
        let digest = hasher.finalize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);

        let dir = self.root.join(format!("{:016x}", u64::from_le_bytes(raw)));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn library_dir(&self, runtime: &str, tools: &str) -> Result<PathBuf> {
        let dir = self.tool_dir(runtime, tools)?.join("lib");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
