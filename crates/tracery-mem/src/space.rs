use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info};

use crate::range::MappedRange;
use crate::{align_down_to_page, round_up_to_page, AddressWidth, CodeVersion, Pc, PAGE_SIZE};

/// Shared handle to an address space. Tasks hold one of these; forking clones
/// the space behind a fresh handle.
pub type AddressSpaceHandle = Arc<Mutex<AddressSpace>>;

const RANGE_CACHE_SIZE: usize = 64;
const RANGE_CACHE_MASK: u64 = (RANGE_CACHE_SIZE as u64) - 1;

/// Most-recently-used slot; sits past the direct-mapped portion.
const MRU_SLOT: usize = RANGE_CACHE_SIZE;

/// Direct-mapped range lookup cache keyed by bits 12..17 of the page address,
/// with one extra MRU slot probed first. Slots hold indices into
/// `AddressSpace::maps` and are reset whenever the indices are rebuilt.
#[derive(Clone, Copy)]
struct RangeCache {
    slots: [Option<usize>; RANGE_CACHE_SIZE + 1],
}

impl RangeCache {
    fn new() -> Self {
        Self {
            slots: [None; RANGE_CACHE_SIZE + 1],
        }
    }

    fn reset(&mut self) {
        self.slots = [None; RANGE_CACHE_SIZE + 1];
    }

    #[inline]
    fn slot_for(page_addr: u64) -> usize {
        ((page_addr >> crate::PAGE_SHIFT) & RANGE_CACHE_MASK) as usize
    }
}

/// One guest process's virtual memory.
///
/// Ranges (valid maps and tombstones) are kept disjoint and sorted by base
/// address; the page-to-range indices are rebuilt after every map or
/// permission change. A page is effectively readable/writable/executable only
/// if it is in the corresponding permission set *and* covered by a valid
/// range.
#[derive(Clone)]
pub struct AddressSpace {
    width: AddressWidth,
    addr_mask: u64,
    version_code: bool,

    /// All ranges, tombstones included, sorted by base. Tombstones bracket
    /// the valid maps so hole lookup can walk gaps uniformly.
    maps: Vec<MappedRange>,

    page_to_map: HashMap<u64, usize>,
    wnx_page_to_map: HashMap<u64, usize>,
    range_cache: RangeCache,
    wnx_range_cache: RangeCache,

    page_is_readable: HashSet<u64>,
    page_is_writable: HashSet<u64>,
    page_is_executable: HashSet<u64>,

    /// PCs already handed to the trace decoder, cleared wholesale on SMC.
    trace_heads: HashSet<u64>,

    min_addr: u64,
    initial_program_break: u64,
    dead: bool,
}

impl AddressSpace {
    pub fn new(width: AddressWidth, version_code: bool) -> Self {
        let addr_mask = width.mask();
        let mut space = Self {
            width,
            addr_mask,
            version_code,
            maps: vec![MappedRange::create_invalid(0, addr_mask)],
            page_to_map: HashMap::new(),
            wnx_page_to_map: HashMap::new(),
            range_cache: RangeCache::new(),
            wnx_range_cache: RangeCache::new(),
            page_is_readable: HashSet::new(),
            page_is_writable: HashSet::new(),
            page_is_executable: HashSet::new(),
            trace_heads: HashSet::new(),
            min_addr: u64::MAX,
            initial_program_break: 0,
            dead: false,
        };
        space.create_page_to_range_map();
        space
    }

    pub fn into_handle(self) -> AddressSpaceHandle {
        Arc::new(Mutex::new(self))
    }

    pub fn width(&self) -> AddressWidth {
        self.width
    }

    pub fn addr_mask(&self) -> u64 {
        self.addr_mask
    }

    pub fn code_versioning_enabled(&self) -> bool {
        self.version_code
    }

    /// Map `[base, base+size)` (page-rounded) backed by a zero-filled buffer.
    /// Overlapping pieces of existing maps are removed or split. The new map
    /// starts readable and writable, not executable.
    pub fn add_map(&mut self, base: u64, size: u64, name: &str, file_offset: u64) {
        if let Some((base, limit)) = self.prepare_map(base, size) {
            let map = MappedRange::create(base, limit, name, file_offset);
            self.insert_map(map);
            self.set_permissions(base, limit - base, true, true, false);
        }
    }

    /// Like [`AddressSpace::add_map`] but lazy-zero: no buffer is allocated
    /// until the first write.
    pub fn add_zero_map(&mut self, base: u64, size: u64, name: &str) {
        if let Some((base, limit)) = self.prepare_map(base, size) {
            let map = MappedRange::create_zero(base, limit, name);
            self.insert_map(map);
            self.set_permissions(base, limit - base, true, true, false);
        }
    }

    /// Replace `[base, base+size)` with a tombstone and clear its
    /// permissions.
    pub fn remove_map(&mut self, base: u64, size: u64) {
        if let Some((base, limit)) = self.prepare_map(base, size) {
            info!("unmapping range [{base:#x}, {limit:#x})");
            let map = MappedRange::create_invalid(base, limit);
            self.insert_map(map);
            self.set_permissions(base, limit - base, false, false, false);
        }
    }

    fn prepare_map(&mut self, base: u64, size: u64) -> Option<(u64, u64)> {
        let base = align_down_to_page(base);
        let limit = base
            .saturating_add(round_up_to_page(size))
            .min(self.addr_mask);

        if self.dead {
            error!("rejecting map [{base:#x}, {limit:#x}) in dead address space");
            return None;
        }
        if base & self.addr_mask != base {
            error!(
                "base address {base:#x} does not fit the {}-bit address mask",
                self.width.bits()
            );
            return None;
        }
        if limit <= base {
            return None;
        }
        Some((base, limit))
    }

    fn insert_map(&mut self, map: MappedRange) {
        info!("mapping range [{:#x}, {:#x})", map.base(), map.limit());
        let old_len = self.maps.len();
        let kept = remove_range(std::mem::take(&mut self.maps), map.base(), map.limit());
        if kept.len() < old_len {
            debug!(
                "new map [{:#x}, {:#x}) overlapped {} existing maps",
                map.base(),
                map.limit(),
                old_len - kept.len()
            );
        }
        self.maps = kept;
        self.maps.push(map);
    }

    /// Set page permissions over `[base, base+size)` and rebuild the lookup
    /// indices.
    pub fn set_permissions(&mut self, base: u64, size: u64, r: bool, w: bool, x: bool) {
        let base = align_down_to_page(base);
        let limit = base.saturating_add(round_up_to_page(size));

        let mut addr = base;
        while addr < limit {
            if r {
                self.page_is_readable.insert(addr);
            } else {
                self.page_is_readable.remove(&addr);
            }
            if w {
                self.page_is_writable.insert(addr);
            } else {
                self.page_is_writable.remove(&addr);
            }
            if x {
                self.page_is_executable.insert(addr);
            } else {
                self.page_is_executable.remove(&addr);
            }
            addr += PAGE_SIZE;
        }
        self.create_page_to_range_map();
    }

    pub fn can_read(&self, addr: u64) -> bool {
        self.can_read_aligned(align_down_to_page(addr & self.addr_mask))
    }

    pub fn can_write(&self, addr: u64) -> bool {
        self.can_write_aligned(align_down_to_page(addr & self.addr_mask))
    }

    pub fn can_execute(&self, addr: u64) -> bool {
        self.can_execute_aligned(align_down_to_page(addr & self.addr_mask))
    }

    #[inline]
    fn can_read_aligned(&self, page_addr: u64) -> bool {
        self.page_is_readable.contains(&page_addr)
    }

    #[inline]
    fn can_write_aligned(&self, page_addr: u64) -> bool {
        self.page_is_writable.contains(&page_addr)
    }

    #[inline]
    fn can_execute_aligned(&self, page_addr: u64) -> bool {
        self.page_is_executable.contains(&page_addr)
    }

    /// Whether `addr` lies in a valid mapped range (any permission).
    pub fn is_mapped(&self, addr: u64) -> bool {
        if self.dead {
            return false;
        }
        match self.page_to_map.get(&align_down_to_page(addr)) {
            Some(&idx) => self.maps[idx].is_valid(),
            None => false,
        }
    }

    /// Cross-range, permission-checked read of `out.len()` bytes at `addr`.
    pub fn try_read_bytes(&mut self, addr: u64, out: &mut [u8]) -> bool {
        if out.is_empty() {
            return true;
        }
        let addr = addr & self.addr_mask;
        let Some(end_addr) = addr.checked_add(out.len() as u64) else {
            return false;
        };

        let mut cursor = addr;
        let mut offset = 0usize;
        let mut page_addr = align_down_to_page(addr);
        while page_addr < end_addr {
            if !self.can_read_aligned(page_addr) {
                return false;
            }
            let Some(idx) = self.find_range_idx(page_addr) else {
                return false;
            };
            let next_end = end_addr.min(page_addr + PAGE_SIZE);
            let range = &self.maps[idx];
            while cursor < next_end {
                match range.read(cursor) {
                    Some(byte) => {
                        out[offset] = byte;
                        offset += 1;
                        cursor += 1;
                    }
                    None => return false,
                }
            }
            page_addr += PAGE_SIZE;
        }
        true
    }

    /// Cross-range, permission-checked write. Writing to a page that is also
    /// executable invalidates the containing range's code version and clears
    /// the trace-head set, forcing re-decode under a fresh version.
    pub fn try_write_bytes(&mut self, addr: u64, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return true;
        }
        let addr = addr & self.addr_mask;
        let Some(end_addr) = addr.checked_add(bytes.len() as u64) else {
            return false;
        };

        let mut cursor = addr;
        let mut offset = 0usize;
        let mut page_addr = align_down_to_page(addr);
        while page_addr < end_addr {
            if !self.can_write_aligned(page_addr) {
                return false;
            }

            if self.version_code && self.can_execute_aligned(page_addr) {
                if let Some(idx) = self.find_range_idx(page_addr) {
                    self.maps[idx].invalidate_code_version();
                }
                self.trace_heads.clear();
            }

            let Some(idx) = self.find_range_idx(page_addr) else {
                return false;
            };
            let next_end = end_addr.min(page_addr + PAGE_SIZE);
            let range = &mut self.maps[idx];
            while cursor < next_end {
                if !range.write(cursor, bytes[offset]) {
                    return false;
                }
                offset += 1;
                cursor += 1;
            }
            page_addr += PAGE_SIZE;
        }
        true
    }

    pub fn try_read_u8(&mut self, addr: u64) -> Option<u8> {
        let mut buf = [0u8; 1];
        self.try_read_bytes(addr, &mut buf).then(|| buf[0])
    }

    pub fn try_write_u8(&mut self, addr: u64, val: u8) -> bool {
        let addr = addr & self.addr_mask;
        let page_addr = align_down_to_page(addr);
        if let Some(idx) = self.find_wnx_range_idx(page_addr) {
            if self.maps[idx].write(addr, val) {
                return true;
            }
        }
        self.try_write_bytes(addr, &[val])
    }

    /// Read one byte for instruction decoding; additionally requires
    /// executable permission on the containing page.
    pub fn try_read_executable(&mut self, pc: Pc) -> Option<u8> {
        let addr = pc.get() & self.addr_mask;
        let page_addr = align_down_to_page(addr);
        let idx = self.find_range_idx(page_addr)?;
        let byte = self.maps[idx].read(addr)?;
        self.can_execute_aligned(page_addr).then_some(byte)
    }

    /// The code version for the range containing `pc`, or
    /// [`CodeVersion::ZERO`] when versioning is disabled by configuration.
    pub fn compute_code_version(&mut self, pc: Pc) -> CodeVersion {
        if !self.version_code {
            return CodeVersion::ZERO;
        }
        let addr = pc.get() & self.addr_mask;
        match self.find_range_idx(align_down_to_page(addr)) {
            Some(idx) => self.maps[idx].compute_code_version(),
            None => CodeVersion::ZERO,
        }
    }

    /// Memoise `pc` as a trace entry so the decoder never re-walks it under
    /// the current code version.
    pub fn mark_trace_head(&mut self, pc: Pc) {
        self.trace_heads.insert(pc.get());
    }

    pub fn is_trace_head(&self, pc: Pc) -> bool {
        self.trace_heads.contains(&pc.get())
    }

    /// Find the highest page-aligned address in `[min, max)` at which `size`
    /// bytes fit without touching any valid range.
    pub fn find_hole(&self, min: u64, max: u64, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let min = align_down_to_page(min);
        let max = align_down_to_page(max);
        if min >= max {
            return None;
        }
        let size = round_up_to_page(size);
        if size > max - min {
            return None;
        }

        // Tombstone ranges bracket the valid maps, so every gap is visible
        // either as a tombstone or as the space between two valid neighbours.
        let mut iter = self.maps.iter().rev().peekable();
        while let Some(range_high) = iter.next() {
            let high_base;
            let low_limit;
            if !range_high.is_valid() {
                high_base = range_high.limit();
                low_limit = range_high.base();
            } else if let Some(range_low) = iter.peek() {
                high_base = range_high.base();
                low_limit = range_low.limit();
            } else {
                break;
            }

            if high_base < min {
                break;
            }
            debug_assert!(low_limit <= high_base);
            if low_limit >= max {
                continue;
            }

            let alloc_max = max.min(high_base);
            let alloc_min = min.max(low_limit);
            if alloc_max.saturating_sub(alloc_min) < size {
                continue;
            }

            let hole = alloc_max - size;
            debug_assert!(hole >= alloc_min);
            return Some(hole);
        }
        None
    }

    /// Drop all contents. The space stays observable but every subsequent
    /// read, write, and map is rejected.
    pub fn kill(&mut self) {
        self.maps.clear();
        self.page_to_map.clear();
        self.wnx_page_to_map.clear();
        self.range_cache.reset();
        self.wnx_range_cache.reset();
        self.dead = true;
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Lowest base address of any valid range; `u64::MAX` when nothing is
    /// mapped. Runtimes use this as the floor for allocation searches.
    pub fn min_address(&self) -> u64 {
        self.min_addr
    }

    pub fn initial_program_break(&self) -> u64 {
        self.initial_program_break
    }

    pub fn set_initial_program_break(&mut self, addr: u64) {
        self.initial_program_break = addr;
    }

    /// Log the current memory maps at info level.
    pub fn log_maps(&self) {
        info!("memory maps:");
        let digits = (self.width.bits() / 4) as usize;
        for range in &self.maps {
            if !range.is_valid() {
                continue;
            }
            let mut line = format!(
                "  [{base:0digits$x}, {limit:0digits$x})",
                base = range.base(),
                limit = range.limit(),
            );
            if !range.name().is_empty() {
                line.push_str(&format!(" from {}", range.name()));
                if range.file_offset() != 0 {
                    line.push_str(&format!(" (offset {:#x})", range.file_offset()));
                }
            }
            info!("{line}");
        }
    }

    fn create_page_to_range_map(&mut self) {
        self.page_to_map.clear();
        self.wnx_page_to_map.clear();
        self.range_cache.reset();
        self.wnx_range_cache.reset();

        self.maps.sort_by_key(|range| range.base());

        self.min_addr = u64::MAX;
        for (idx, range) in self.maps.iter().enumerate() {
            if !range.is_valid() {
                continue;
            }
            self.min_addr = self.min_addr.min(range.base());

            let mut addr = range.base();
            while addr < range.limit() {
                let can_read = self.page_is_readable.contains(&addr);
                let can_write = self.page_is_writable.contains(&addr);
                let can_exec = self.page_is_executable.contains(&addr);

                if can_read || can_write || can_exec {
                    self.page_to_map.insert(addr, idx);
                }
                if can_write && !can_exec {
                    self.wnx_page_to_map.insert(addr, idx);
                }
                addr += PAGE_SIZE;
            }
        }
    }

    fn find_range_idx(&mut self, page_addr: u64) -> Option<usize> {
        if let Some(idx) = self.range_cache.slots[MRU_SLOT] {
            if self.maps[idx].contains(page_addr) {
                return Some(idx);
            }
        }
        let slot = RangeCache::slot_for(page_addr);
        if let Some(idx) = self.range_cache.slots[slot] {
            if self.maps[idx].contains(page_addr) {
                self.range_cache.slots[MRU_SLOT] = Some(idx);
                return Some(idx);
            }
        }
        let idx = *self.page_to_map.get(&page_addr)?;
        self.range_cache.slots[MRU_SLOT] = Some(idx);
        self.range_cache.slots[slot] = Some(idx);
        Some(idx)
    }

    /// Lookup restricted to writable, non-executable pages. Hits on this
    /// index can skip the self-modifying-code bookkeeping entirely.
    fn find_wnx_range_idx(&mut self, page_addr: u64) -> Option<usize> {
        if let Some(idx) = self.wnx_range_cache.slots[MRU_SLOT] {
            if self.maps[idx].contains(page_addr) {
                return Some(idx);
            }
        }
        let slot = RangeCache::slot_for(page_addr);
        if let Some(idx) = self.wnx_range_cache.slots[slot] {
            if self.maps[idx].contains(page_addr) {
                self.wnx_range_cache.slots[MRU_SLOT] = Some(idx);
                return Some(idx);
            }
        }
        let idx = *self.wnx_page_to_map.get(&page_addr)?;
        self.wnx_range_cache.slots[MRU_SLOT] = Some(idx);
        self.wnx_range_cache.slots[slot] = Some(idx);
        Some(idx)
    }
}

macro_rules! typed_access {
    ($read_fn:ident, $write_fn:ident, $ty:ty, $len:expr) => {
        impl AddressSpace {
            /// Typed read; takes the single-page direct path when possible
            /// and falls back to the byte path otherwise.
            pub fn $read_fn(&mut self, addr: u64) -> Option<$ty> {
                let addr = addr & self.addr_mask;
                let end_addr = addr.checked_add($len - 1)?;
                let page_addr = align_down_to_page(addr);
                if page_addr == align_down_to_page(end_addr) && self.can_read_aligned(page_addr) {
                    if let Some(idx) = self.find_range_idx(page_addr) {
                        if let Some(bytes) = self.maps[idx].bytes(addr, $len) {
                            let mut raw = [0u8; $len];
                            raw.copy_from_slice(bytes);
                            return Some(<$ty>::from_le_bytes(raw));
                        }
                    }
                }
                let mut raw = [0u8; $len];
                self.try_read_bytes(addr, &mut raw)
                    .then(|| <$ty>::from_le_bytes(raw))
            }

            /// Typed write; single-page stores to writable non-executable
            /// pages skip the SMC bookkeeping, everything else falls back to
            /// the byte path.
            pub fn $write_fn(&mut self, addr: u64, val: $ty) -> bool {
                let addr = addr & self.addr_mask;
                let Some(end_addr) = addr.checked_add($len - 1) else {
                    return false;
                };
                let page_addr = align_down_to_page(addr);
                if page_addr == align_down_to_page(end_addr) {
                    if let Some(idx) = self.find_wnx_range_idx(page_addr) {
                        if let Some(bytes) = self.maps[idx].bytes_mut(addr, $len) {
                            bytes.copy_from_slice(&val.to_le_bytes());
                            return true;
                        }
                    }
                }
                self.try_write_bytes(addr, &val.to_le_bytes())
            }
        }
    };
}

typed_access!(try_read_u16, try_write_u16, u16, 2);
typed_access!(try_read_u32, try_write_u32, u32, 4);
typed_access!(try_read_u64, try_write_u64, u64, 8);

impl AddressSpace {
    pub fn try_read_f32(&mut self, addr: u64) -> Option<f32> {
        self.try_read_u32(addr).map(f32::from_bits)
    }

    pub fn try_write_f32(&mut self, addr: u64, val: f32) -> bool {
        self.try_write_u32(addr, val.to_bits())
    }

    pub fn try_read_f64(&mut self, addr: u64) -> Option<f64> {
        self.try_read_u64(addr).map(f64::from_bits)
    }

    pub fn try_write_f64(&mut self, addr: u64, val: f64) -> bool {
        self.try_write_u64(addr, val.to_bits())
    }
}

/// Rebuild `ranges` so that none of them overlaps `[base, limit)`, applying
/// the splitting rules: full containment drops the map, partial overlap keeps
/// the uncovered prefix/suffix, and a strict superset splits in two.
fn remove_range(ranges: Vec<MappedRange>, base: u64, limit: u64) -> Vec<MappedRange> {
    let mut kept = Vec::with_capacity(ranges.len() + 1);

    debug!(
        "removing [{base:#x}, {limit:#x}) from a list of {} ranges",
        ranges.len()
    );

    for map in ranges {
        let map_base = map.base();
        let map_limit = map.limit();

        if map_limit <= base || map_base >= limit {
            // No overlap.
            kept.push(map);
        } else if map_base >= base && map_limit <= limit {
            debug!("  dropping fully covered [{map_base:#x}, {map_limit:#x})");
        } else if map_base < base && map_limit > limit {
            debug!(
                "  splitting [{map_base:#x}, {map_limit:#x}) into \
                 [{map_base:#x}, {base:#x}) and [{limit:#x}, {map_limit:#x})"
            );
            kept.push(map.copy(map_base, base));
            kept.push(map.copy(limit, map_limit));
        } else if map_base == base {
            debug!("  keeping suffix [{limit:#x}, {map_limit:#x})");
            kept.push(map.copy(limit, map_limit));
        } else {
            debug!("  keeping prefix [{map_base:#x}, {base:#x})");
            kept.push(map.copy(map_base, base));
        }
    }

    kept
}
