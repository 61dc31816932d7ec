use proptest::prelude::*;
use tracery_mem::{AddressSpace, AddressWidth};

const MAP_BASE: u64 = 0x1000;
const MAP_SIZE: u64 = 0x4000;

fn mapped_space() -> AddressSpace {
    let mut s = AddressSpace::new(AddressWidth::Bits64, false);
    s.add_map(MAP_BASE, MAP_SIZE, "", 0);
    s
}

proptest! {
    /// Writes in a cloned space never become visible to the parent, and
    /// clones observe everything written before the clone.
    #[test]
    fn clone_isolation(
        pre_writes in proptest::collection::vec((0..MAP_SIZE, any::<u8>()), 0..32),
        post_writes in proptest::collection::vec((0..MAP_SIZE, any::<u8>()), 1..32),
    ) {
        let mut parent = mapped_space();
        for &(off, val) in &pre_writes {
            prop_assert!(parent.try_write_u8(MAP_BASE + off, val));
        }

        let mut child = parent.clone();
        for &(off, _) in &pre_writes {
            prop_assert_eq!(
                parent.try_read_u8(MAP_BASE + off),
                child.try_read_u8(MAP_BASE + off)
            );
        }

        let parent_before: Vec<_> = post_writes
            .iter()
            .map(|&(off, _)| parent.try_read_u8(MAP_BASE + off))
            .collect();

        for &(off, val) in &post_writes {
            prop_assert!(child.try_write_u8(MAP_BASE + off, val));
        }
        for (&(off, _), before) in post_writes.iter().zip(parent_before) {
            prop_assert_eq!(parent.try_read_u8(MAP_BASE + off), before);
        }
    }

    /// Any hole the finder reports is page-aligned, inside the window, and
    /// entirely unmapped.
    #[test]
    fn found_holes_are_valid(
        min in (0u64..8).prop_map(|p| p * 0x1000),
        max in (8u64..32).prop_map(|p| p * 0x1000),
        size in 1u64..0x4000,
    ) {
        let s = mapped_space();
        if let Some(hole) = s.find_hole(min, max, size) {
            prop_assert_eq!(hole % 0x1000, 0);
            prop_assert!(hole >= min);
            prop_assert!(hole + size <= max);
            let mut addr = hole;
            while addr < hole + size {
                prop_assert!(!s.is_mapped(addr));
                addr += 0x1000;
            }
        }
    }
}
