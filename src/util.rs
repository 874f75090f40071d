//! Helper functions shared across the allocator's subsystems.
//! These don't particularly belong to any concrete module of the program.

/// It aligns `to_be_aligned` upwards using `alignment`.
///
/// Used to align sub-allocation bases to the computer's pointer size (slot
/// and node addresses must be pointer-aligned) and requested region sizes to
/// the page size before they are handed to the memory services.
pub fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}
