use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::{CodeVersion, PAGE_SIZE};

/// Backing store for a mapped range.
///
/// `Bytes` buffers are shared between cloned ranges until one side writes;
/// [`Arc::make_mut`] duplicates the buffer at that point, which is what gives
/// forked address spaces their copy-on-write behaviour.
#[derive(Clone)]
enum Backing {
    /// Tombstone: the range is known, but holds no memory.
    Invalid,
    /// Anonymous-zero range that has never been written. Reads observe zero
    /// without materialising a buffer.
    Zero,
    Bytes(Arc<Vec<u8>>),
}

/// One contiguous page-aligned `[base, limit)` region of guest memory.
pub struct MappedRange {
    base: u64,
    limit: u64,
    name: String,
    file_offset: u64,
    backing: Backing,
    code_version: Option<CodeVersion>,
}

impl MappedRange {
    /// Create a range backed by a zero-filled buffer.
    pub fn create(base: u64, limit: u64, name: &str, file_offset: u64) -> Self {
        debug_assert!(base < limit);
        let size = (limit - base) as usize;
        Self {
            base,
            limit,
            name: name.to_owned(),
            file_offset,
            backing: Backing::Bytes(Arc::new(vec![0u8; size])),
            code_version: None,
        }
    }

    /// Create a lazy-zero range; no buffer is allocated until the first write.
    pub fn create_zero(base: u64, limit: u64, name: &str) -> Self {
        debug_assert!(base < limit);
        Self {
            base,
            limit,
            name: name.to_owned(),
            file_offset: 0,
            backing: Backing::Zero,
            code_version: None,
        }
    }

    /// Create a tombstone covering `[base, limit)`.
    pub fn create_invalid(base: u64, limit: u64) -> Self {
        Self {
            base,
            limit,
            name: String::new(),
            file_offset: 0,
            backing: Backing::Invalid,
            code_version: Some(CodeVersion::ZERO),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !matches!(self.backing, Backing::Invalid)
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.limit - self.base
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.base == self.limit
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Whether `addr` falls inside `[base, limit)`.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.limit
    }

    /// Read one byte. Fails outside the bounds and on tombstones.
    #[inline]
    pub fn read(&self, addr: u64) -> Option<u8> {
        if !self.contains(addr) {
            return None;
        }
        match &self.backing {
            Backing::Invalid => None,
            Backing::Zero => Some(0),
            Backing::Bytes(buf) => Some(buf[(addr - self.base) as usize]),
        }
    }

    /// Write one byte. Fails outside the bounds and on tombstones.
    #[inline]
    pub fn write(&mut self, addr: u64, val: u8) -> bool {
        if !self.contains(addr) {
            return false;
        }
        let idx = (addr - self.base) as usize;
        let Some(buf) = self.buffer_mut() else {
            return false;
        };
        buf[idx] = val;
        true
    }

    /// Borrow `len` bytes of backing storage starting at `addr`, if the range
    /// can materialise them without mutation. Lazy-zero ranges that were never
    /// touched return `None` and callers fall back to the byte path.
    pub fn bytes(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let end = addr.checked_add(len as u64)?;
        if !self.contains(addr) || end > self.limit {
            return None;
        }
        match &self.backing {
            Backing::Invalid | Backing::Zero => None,
            Backing::Bytes(buf) => {
                let start = (addr - self.base) as usize;
                Some(&buf[start..start + len])
            }
        }
    }

    /// Mutably borrow `len` bytes starting at `addr`, materialising and
    /// unsharing the backing buffer as needed.
    pub fn bytes_mut(&mut self, addr: u64, len: usize) -> Option<&mut [u8]> {
        let end = addr.checked_add(len as u64)?;
        if !self.contains(addr) || end > self.limit {
            return None;
        }
        let base = self.base;
        let buf = self.buffer_mut()?;
        let start = (addr - base) as usize;
        Some(&mut buf[start..start + len])
    }

    /// Extract a sub-range `[new_base, new_limit)`; used by map splitting.
    ///
    /// The returned range owns a copy of the covered bytes, so the split
    /// pieces do not alias the original buffer.
    pub fn copy(&self, new_base: u64, new_limit: u64) -> MappedRange {
        debug_assert!(self.base <= new_base && new_limit <= self.limit);
        debug_assert!(new_base < new_limit);
        let backing = match &self.backing {
            Backing::Invalid => Backing::Invalid,
            Backing::Zero => Backing::Zero,
            Backing::Bytes(buf) => {
                let start = (new_base - self.base) as usize;
                let end = (new_limit - self.base) as usize;
                Backing::Bytes(Arc::new(buf[start..end].to_vec()))
            }
        };
        MappedRange {
            base: new_base,
            limit: new_limit,
            name: self.name.clone(),
            file_offset: self.file_offset + (new_base - self.base),
            backing,
            code_version: None,
        }
    }

    /// The version token for this range's current byte content.
    ///
    /// Computed lazily and cached until [`MappedRange::invalidate_code_version`].
    pub fn compute_code_version(&mut self) -> CodeVersion {
        if let Some(version) = self.code_version {
            return version;
        }
        let version = match &self.backing {
            Backing::Invalid => CodeVersion::ZERO,
            Backing::Zero => digest_zero_pages(self.len()),
            Backing::Bytes(buf) => digest_bytes(buf),
        };
        self.code_version = Some(version);
        version
    }

    /// Drop the cached version token; the next computation re-hashes the
    /// range's bytes.
    pub fn invalidate_code_version(&mut self) {
        if self.is_valid() {
            self.code_version = None;
        }
    }

    fn buffer_mut(&mut self) -> Option<&mut Vec<u8>> {
        if let Backing::Zero = self.backing {
            let size = (self.limit - self.base) as usize;
            self.backing = Backing::Bytes(Arc::new(vec![0u8; size]));
        }
        match &mut self.backing {
            Backing::Invalid | Backing::Zero => None,
            Backing::Bytes(buf) => Some(Arc::make_mut(buf)),
        }
    }
}

impl Clone for MappedRange {
    /// Clones share the backing buffer; the first write on either side
    /// duplicates it. The cached version carries over because the contents
    /// are still byte-identical.
    fn clone(&self) -> Self {
        Self {
            base: self.base,
            limit: self.limit,
            name: self.name.clone(),
            file_offset: self.file_offset,
            backing: self.backing.clone(),
            code_version: self.code_version,
        }
    }
}

impl std::fmt::Debug for MappedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRange")
            .field("base", &format_args!("{:#x}", self.base))
            .field("limit", &format_args!("{:#x}", self.limit))
            .field("name", &self.name)
            .field("valid", &self.is_valid())
            .finish()
    }
}

fn digest_bytes(bytes: &[u8]) -> CodeVersion {
    let digest = Sha256::digest(bytes);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    CodeVersion::from_digest(u64::from_le_bytes(raw))
}

fn digest_zero_pages(len: u64) -> CodeVersion {
    let zero_page = [0u8; PAGE_SIZE as usize];
    let mut hasher = Sha256::new();
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(PAGE_SIZE) as usize;
        hasher.update(&zero_page[..chunk]);
        remaining -= chunk as u64;
    }
    let digest = hasher.finalize();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    CodeVersion::from_digest(u64::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_in_bounds() {
        let mut range = MappedRange::create(0x1000, 0x2000, "", 0);
        assert!(range.write(0x1800, 0xAB));
        assert_eq!(range.read(0x1800), Some(0xAB));
        assert_eq!(range.read(0x2000), None);
        assert!(!range.write(0xFFF, 0x01));
    }

    #[test]
    fn zero_range_materialises_on_write() {
        let mut range = MappedRange::create_zero(0x1000, 0x2000, "");
        assert_eq!(range.read(0x1234), Some(0));
        assert!(range.bytes(0x1234, 4).is_none());
        assert!(range.write(0x1234, 7));
        assert_eq!(range.bytes(0x1234, 1).map(|b| b[0]), Some(7));
    }

    #[test]
    fn tombstone_rejects_everything() {
        let mut range = MappedRange::create_invalid(0, 0x10_0000);
        assert_eq!(range.read(0x1000), None);
        assert!(!range.write(0x1000, 1));
        assert!(range.bytes(0x1000, 1).is_none());
        assert_eq!(range.compute_code_version(), CodeVersion::ZERO);
    }

    #[test]
    fn clone_is_copy_on_write() {
        let mut parent = MappedRange::create(0x1000, 0x2000, "", 0);
        assert!(parent.write(0x1000, 0x11));
        let mut child = parent.clone();
        assert!(child.write(0x1000, 0x22));
        assert_eq!(parent.read(0x1000), Some(0x11));
        assert_eq!(child.read(0x1000), Some(0x22));
    }

    #[test]
    fn code_version_tracks_content() {
        let mut a = MappedRange::create(0x1000, 0x2000, "", 0);
        let mut b = MappedRange::create(0x1000, 0x2000, "", 0);
        assert_eq!(a.compute_code_version(), b.compute_code_version());

        assert!(a.write(0x1000, 0xCC));
        a.invalidate_code_version();
        assert_ne!(a.compute_code_version(), b.compute_code_version());
    }

    #[test]
    fn untouched_zero_range_matches_zeroed_buffer() {
        let mut zeroed = MappedRange::create(0x1000, 0x3000, "", 0);
        let mut lazy = MappedRange::create_zero(0x1000, 0x3000, "");
        assert_eq!(zeroed.compute_code_version(), lazy.compute_code_version());
    }

    #[test]
    fn copy_extracts_sub_range() {
        let mut range = MappedRange::create(0x1000, 0x4000, "lib.so", 0x200);
        assert!(range.write(0x2000, 0x5A));
        let sub = range.copy(0x2000, 0x3000);
        assert_eq!(sub.base(), 0x2000);
        assert_eq!(sub.limit(), 0x3000);
        assert_eq!(sub.read(0x2000), Some(0x5A));
        assert_eq!(sub.file_offset(), 0x1200);
    }
}
