//! Displacement-range check for candidate memory.
//!
//! The interception mechanism rewrites a near control-transfer instruction
//! at the hooked address, so every byte the allocator hands out for that
//! hook must be reachable through a signed 32-bit displacement. The limit
//! kept here is a margin below `i32::MAX`, reserving headroom for the
//! instruction encoding itself.

/// Maximum distance from a target address at which a region still counts as
/// "near". Strictly below the signed 32-bit displacement limit.
pub const NEAR_RANGE: usize = 0x7FFF_FFF0;

/// Returns true iff the distance from `target` to the nearer edge of
/// `[base, base + size)` is strictly less than [`NEAR_RANGE`].
///
/// Pure and total. Symmetric in distance direction: a target `d` bytes below
/// the region and a target `d` bytes above it get the same answer.
pub fn is_near(base: usize, size: usize, target: usize) -> bool {
    let distance = if target < base {
        base - target
    } else if target >= base + size {
        // Last byte of the region is the nearer edge from above.
        target - (base + size - 1)
    } else {
        0
    };

    distance < NEAR_RANGE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_inside_region_is_near() {
        assert!(is_near(0x1000, 0x1000, 0x1800));
        assert!(is_near(0x1000, 0x1000, 0x1000));
        assert!(is_near(0x1000, 0x1000, 0x1FFF));
    }

    #[test]
    fn close_targets_are_near_in_both_directions() {
        let base = 0x1_0000_0000;
        let size = 0x1000;

        assert!(is_near(base, size, base - 0x100));
        assert!(is_near(base, size, base + size + 0x100));
    }

    #[test]
    fn distant_targets_are_rejected() {
        let base = 0x2_0000_0000;
        let size = 0x1000;

        assert!(!is_near(base, size, base - NEAR_RANGE));
        assert!(!is_near(base, size, base + size - 1 + NEAR_RANGE));
    }

    #[test]
    fn boundary_is_strict() {
        let base = 0x2_0000_0000;
        let size = 0x1000;

        // One byte inside the limit is accepted, the limit itself is not.
        assert!(is_near(base, size, base - (NEAR_RANGE - 1)));
        assert!(!is_near(base, size, base - NEAR_RANGE));
    }

    #[test]
    fn mirrored_distances_agree() {
        let base = 0x2_0000_0000;
        let size = 0x4000;
        let top_edge = base + size - 1;

        for distance in [1usize, 0x10, 0x1000, NEAR_RANGE - 1, NEAR_RANGE, NEAR_RANGE + 1] {
            assert_eq!(
                is_near(base, size, base - distance),
                is_near(base, size, top_edge + distance),
                "asymmetric answer at distance {distance:#x}"
            );
        }
    }
}
