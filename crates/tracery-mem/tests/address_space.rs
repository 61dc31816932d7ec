use pretty_assertions::assert_eq;
use tracery_mem::{AddressSpace, AddressWidth, CodeVersion, Pc};

fn space() -> AddressSpace {
    AddressSpace::new(AddressWidth::Bits64, true)
}

#[test]
fn single_page_scalar_io() {
    let mut s = space();
    s.add_map(0x1000, 0x1000, "", 0);

    // A u32 that ends exactly at the page limit stays on the fast path.
    assert!(s.try_write_u32(0x1FFC, 0xDEAD_BEEF));
    assert_eq!(s.try_read_u32(0x1FFC), Some(0xDEAD_BEEF));

    // A u16 at the last byte spans into the unmapped page at 0x2000.
    assert!(!s.try_write_u16(0x1FFF, 0xABCD));
    assert_eq!(s.try_read_u16(0x1FFF), None);
}

#[test]
fn scalar_io_across_adjacent_ranges() {
    let mut s = space();
    s.add_map(0x1000, 0x1000, "", 0);
    s.add_map(0x2000, 0x1000, "", 0);

    // Two distinct ranges; the page-spanning path stitches them together.
    assert!(s.try_write_u32(0x1FFE, 0x1122_3344));
    assert_eq!(s.try_read_u32(0x1FFE), Some(0x1122_3344));
    assert_eq!(s.try_read_u16(0x1FFE), Some(0x3344));
    assert_eq!(s.try_read_u16(0x2000), Some(0x1122));
}

#[test]
fn float_round_trip() {
    let mut s = space();
    s.add_map(0x1000, 0x1000, "", 0);
    assert!(s.try_write_f64(0x1800, 2.5));
    assert_eq!(s.try_read_f64(0x1800), Some(2.5));
    assert!(s.try_write_f32(0x1808, -1.25));
    assert_eq!(s.try_read_f32(0x1808), Some(-1.25));
}

#[test]
fn permissions_gate_access() {
    let mut s = space();
    s.add_map(0x1000, 0x1000, "", 0);
    s.set_permissions(0x1000, 0x1000, true, false, false);

    assert_eq!(s.try_read_u8(0x1000), Some(0));
    assert!(!s.try_write_u8(0x1000, 1));

    s.set_permissions(0x1000, 0x1000, false, false, false);
    assert_eq!(s.try_read_u8(0x1000), None);
    // A page with no effective permissions drops out of the lookup index.
    assert!(!s.is_mapped(0x1000));
}

#[test]
fn clone_is_copy_on_write() {
    let mut parent = space();
    parent.add_map(0x1000, 0x2000, "", 0);
    assert!(parent.try_write_u64(0x1000, 0x0123_4567_89AB_CDEF));

    let mut child = parent.clone();
    assert_eq!(child.try_read_u64(0x1000), Some(0x0123_4567_89AB_CDEF));

    assert!(child.try_write_u64(0x1000, 0xFFFF_FFFF_FFFF_FFFF));
    assert_eq!(parent.try_read_u64(0x1000), Some(0x0123_4567_89AB_CDEF));
    assert_eq!(child.try_read_u64(0x1000), Some(0xFFFF_FFFF_FFFF_FFFF));

    // And the other direction: parent writes do not leak into the child.
    assert!(parent.try_write_u8(0x2800, 0x33));
    assert_eq!(child.try_read_u8(0x2800), Some(0));
}

#[test]
fn smc_in_clone_leaves_parent_version_and_heads_alone() {
    let mut parent = space();
    parent.add_map(0x4000, 0x1000, "", 0);
    assert!(parent.try_write_bytes(0x4000, &[0x90, 0x90, 0xC3]));
    parent.set_permissions(0x4000, 0x1000, true, true, true);
    parent.mark_trace_head(Pc::new(0x4000));

    let parent_version = parent.compute_code_version(Pc::new(0x4000));
    assert_ne!(parent_version, CodeVersion::ZERO);

    let mut child = parent.clone();
    assert_eq!(child.compute_code_version(Pc::new(0x4000)), parent_version);
    assert!(child.is_trace_head(Pc::new(0x4000)));

    // Overwrite the first instruction in the child only.
    assert!(child.try_write_u8(0x4000, 0xCC));

    assert_ne!(
        child.compute_code_version(Pc::new(0x4000)),
        parent.compute_code_version(Pc::new(0x4000))
    );
    assert_eq!(parent.compute_code_version(Pc::new(0x4000)), parent_version);
    assert!(parent.is_trace_head(Pc::new(0x4000)));
    assert!(!child.is_trace_head(Pc::new(0x4000)));
}

#[test]
fn hole_finder_prefers_highest_fit() {
    let mut s = space();
    s.add_map(0x1000, 0x1000, "", 0);
    s.add_map(0x5000, 0x1000, "", 0);

    assert_eq!(s.find_hole(0, 0x10000, 0x2000), Some(0xE000));

    // Constrain the window below the top so the gap between the two maps wins.
    assert_eq!(s.find_hole(0, 0x5000, 0x2000), Some(0x3000));

    // No gap of this size below the first map.
    assert_eq!(s.find_hole(0, 0x1000, 0x2000), None);
}

#[test]
fn hole_finder_respects_bounds() {
    let s = space();
    assert_eq!(s.find_hole(0x3000, 0x3000, 0x1000), None);
    assert_eq!(s.find_hole(0x4000, 0x3000, 0x1000), None);
    assert_eq!(s.find_hole(0, 0x1000, 0x2000), None);

    // An empty space satisfies any in-bounds request at the top of the window.
    assert_eq!(s.find_hole(0x2000, 0x9000, 0x3000), Some(0x6000));
}

#[test]
fn mapped_set_matches_valid_ranges() {
    let mut s = space();
    s.add_map(0x1000, 0x3000, "", 0);
    s.remove_map(0x2000, 0x1000);

    for addr in (0x0000..0x6000u64).step_by(0x1000) {
        let expect = matches!(addr, 0x1000 | 0x3000);
        assert_eq!(s.is_mapped(addr), expect, "addr {addr:#x}");
    }
}
