//! Guest virtual memory: mapped ranges and address spaces.
//!
//! An [`AddressSpace`] models one guest process's virtual memory as a sorted
//! collection of page-aligned [`MappedRange`]s with per-page permission sets.
//! Ranges are copy-on-write so forking an address space is cheap; executable
//! ranges carry a content-derived [`CodeVersion`] token that is invalidated
//! whenever executable bytes are written, which is how self-modifying code is
//! detected without ever patching translations in place.

mod range;
mod space;

pub use crate::range::MappedRange;
pub use crate::space::{AddressSpace, AddressSpaceHandle};

use std::fmt;
use std::sync::MutexGuard;

/// Lock an address-space handle, recovering the guard if a previous holder
/// panicked; the space's invariants are re-established on every mutation, so
/// poisoning carries no extra information here.
pub fn lock_space(handle: &AddressSpaceHandle) -> MutexGuard<'_, AddressSpace> {
    handle
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 4096;
/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

const PAGE_LOW_MASK: u64 = PAGE_SIZE - 1;

/// Round `addr` down to its containing page address.
#[inline]
pub const fn align_down_to_page(addr: u64) -> u64 {
    addr & !PAGE_LOW_MASK
}

/// Round `size` up to a whole number of pages.
#[inline]
pub const fn round_up_to_page(size: u64) -> u64 {
    (size.wrapping_add(PAGE_LOW_MASK)) & !PAGE_LOW_MASK
}

/// A guest program counter.
///
/// Wrapped as a distinct value type so guest PCs cannot be confused with host
/// addresses or accidentally used in pointer arithmetic.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pc(u64);

impl Pc {
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Pc {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<Pc> for u64 {
    #[inline]
    fn from(pc: Pc) -> Self {
        pc.0
    }
}

impl fmt::Debug for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pc({:#x})", self.0)
    }
}

impl fmt::Display for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Identifies the byte content of an executable range.
///
/// Two PCs map to equal versions iff the ranges containing them held
/// byte-identical executable content when the versions were computed. A write
/// to executable bytes invalidates the containing range's cached version, so
/// the next computation yields a token reflecting the new content.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeVersion(u64);

impl CodeVersion {
    /// The version reported when code versioning is disabled.
    pub const ZERO: CodeVersion = CodeVersion(0);

    #[inline]
    pub const fn from_digest(digest: u64) -> Self {
        Self(digest)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeVersion({:#x})", self.0)
    }
}

impl fmt::Display for CodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Guest pointer width; decides the address mask applied on every access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressWidth {
    Bits32,
    Bits64,
}

impl AddressWidth {
    /// Mask applied to every guest address before lookup.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            AddressWidth::Bits32 => 0xFFFF_FFFF,
            AddressWidth::Bits64 => u64::MAX,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            AddressWidth::Bits32 => 32,
            AddressWidth::Bits64 => 64,
        }
    }
}
