//! Fixed pointer-sized slots for redirected call targets.
//!
//! An indirect is one pointer slot at a stable address; the interception
//! mechanism routes a redirected call through it so the real target can be
//! swapped by writing the slot. Slots are sub-allocated from small regions
//! placed near the hooked address, tracked by a bitmap:
//!
//! ```text
//! +--------------------------- indirect region ---------------------------+
//! | slot 0 | slot 1 | slot 2 | slot 3 | slot 4 |  ...                     |
//! +------------------------------------------------------------------------+
//!   bitmap:  1        1        0        1        0   (one bit per slot,
//!                                                     packed into u64s)
//! ```
//!
//! The free-bit scan is deterministic, lowest index first, so placement is
//! reproducible. Slot indices are never reused while still reserved.

use std::ptr;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::cave::CaveFinder;
use crate::error::{Error, Result};
use crate::region::{MemoryRegion, RegionAllocator};
use crate::util::align;

/// Size of a fresh OS allocation backing an indirect region.
pub const INDIRECT_REGION_SIZE: usize = 0x1000;

const SLOT_SIZE: usize = std::mem::size_of::<usize>();

/// One bit per slot, packed into 64-bit words. `u64::MAX` marks a fully
/// reserved word so whole words are skipped without a bit-level scan.
struct SlotBitmap {
    words: Vec<u64>,
    slots: usize,
}

impl SlotBitmap {
    fn new(slots: usize) -> Self {
        Self {
            words: vec![0; slots.div_ceil(64)],
            slots,
        }
    }

    /// Lowest free slot index, or `None` when every slot is reserved.
    /// Padding bits past `slots` in the last word are always zero, so a hit
    /// there means the map is genuinely full.
    fn first_free(&self) -> Option<usize> {
        for (word_index, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let index = word_index * 64 + (!word).trailing_zeros() as usize;
                if index < self.slots {
                    return Some(index);
                }
            }
        }
        None
    }

    fn has_free(&self) -> bool {
        self.first_free().is_some()
    }

    fn reserve(&mut self, index: usize) {
        self.words[index / 64] |= 1 << (index % 64);
    }

    fn release(&mut self, index: usize) {
        self.words[index / 64] &= !(1 << (index % 64));
    }

    #[cfg(test)]
    fn is_reserved(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }
}

/// Bookkeeping for one region divided into pointer slots.
struct IndirectRegion {
    memory: MemoryRegion,
    /// First slot address; the region base aligned up to the pointer size
    /// (cave addresses are not guaranteed aligned).
    slot_base: usize,
    bitmap: SlotBitmap,
}

impl IndirectRegion {
    fn new(memory: MemoryRegion) -> Self {
        let slot_base = align(memory.address(), SLOT_SIZE);
        let usable = (memory.address() + memory.size()).saturating_sub(slot_base);

        Self {
            memory,
            slot_base,
            bitmap: SlotBitmap::new(usable / SLOT_SIZE),
        }
    }

    fn slot_address(&self, index: usize) -> usize {
        self.slot_base + index * SLOT_SIZE
    }

    /// Reserve the lowest free slot and return its index and address.
    fn reserve(&mut self) -> Result<(usize, usize)> {
        let index = self
            .bitmap
            .first_free()
            .ok_or(Error::ExhaustedCapacity("no free indirect slot"))?;

        self.bitmap.reserve(index);
        let address = self.slot_address(index);
        unsafe {
            ptr::write_volatile(address as *mut usize, 0);
        }

        Ok((index, address))
    }

    /// Zero the slot and return its index to the free set.
    fn remove(&mut self, index: usize) {
        unsafe {
            ptr::write_volatile(self.slot_address(index) as *mut usize, 0);
        }
        self.bitmap.release(index);
    }

    fn has_free_slot(&self) -> bool {
        self.bitmap.has_free()
    }
}

/// Handle to one reserved pointer slot. Owned by exactly one caller;
/// released on drop or explicitly, idempotently, via [`release`].
///
/// [`release`]: Indirect::release
pub struct Indirect {
    region: Arc<Mutex<IndirectRegion>>,
    index: usize,
    address: usize,
    released: bool,
}

impl Indirect {
    /// Stable address of the slot, the value the hook writes its
    /// displacement against.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Current target held in the slot.
    pub fn read(&self) -> usize {
        unsafe { ptr::read_volatile(self.address as *const usize) }
    }

    /// Point the slot at a new target.
    pub fn write(&self, target: usize) {
        unsafe {
            ptr::write_volatile(self.address as *mut usize, target);
        }
    }

    /// Zero the slot and return its index to the region's free set.
    /// Safe to call more than once; only the first call has an effect.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.region.lock().remove(self.index);
    }
}

impl Drop for Indirect {
    fn drop(&mut self) {
        self.release();
    }
}

/// Finds or creates indirect regions near hook targets.
pub struct IndirectAllocator {
    region_allocator: Arc<RegionAllocator>,
    cave_finder: Mutex<CaveFinder>,
    regions: Mutex<Vec<Arc<Mutex<IndirectRegion>>>>,
}

impl IndirectAllocator {
    pub fn new(region_allocator: Arc<RegionAllocator>) -> Self {
        let cave_finder = CaveFinder::new(region_allocator.services().clone());
        Self {
            region_allocator,
            cave_finder: Mutex::new(cave_finder),
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Reserve a pointer slot within displacement range of `near_to`.
    ///
    /// Reuses the first known near region with a free slot. Otherwise a new
    /// region is created: a fresh near OS allocation when the OS permits it,
    /// or a cave scavenged from a neighbouring image when it does not.
    pub fn create_indirect(&self, near_to: usize) -> Result<Indirect> {
        let region = self.region_for(near_to)?;
        let (index, address) = region.lock().reserve()?;

        Ok(Indirect {
            region,
            index,
            address,
            released: false,
        })
    }

    fn region_for(&self, near_to: usize) -> Result<Arc<Mutex<IndirectRegion>>> {
        let mut regions = self.regions.lock();

        for region in regions.iter() {
            let inner = region.lock();
            if inner.memory.is_near(near_to) && inner.has_free_slot() {
                return Ok(region.clone());
            }
        }

        let memory = match self
            .region_allocator
            .allocate_near(near_to, INDIRECT_REGION_SIZE)?
        {
            Some(memory) => memory,
            None => {
                debug!("indirect region falls back to a cave near {near_to:#x}");
                self.cave_finder.lock().find_cave_near(near_to)?
            }
        };

        let region = Arc::new(Mutex::new(IndirectRegion::new(memory)));
        regions.push(region.clone());
        Ok(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::SimMemory;

    fn allocator_with(services: Arc<SimMemory>) -> IndirectAllocator {
        IndirectAllocator::new(Arc::new(RegionAllocator::new(services)))
    }

    #[test]
    fn bitmap_reserves_lowest_index_first() {
        let mut bitmap = SlotBitmap::new(200);

        assert_eq!(Some(0), bitmap.first_free());
        bitmap.reserve(0);
        bitmap.reserve(1);
        assert_eq!(Some(2), bitmap.first_free());

        bitmap.release(0);
        assert_eq!(Some(0), bitmap.first_free());
    }

    #[test]
    fn bitmap_skips_fully_reserved_words() {
        let mut bitmap = SlotBitmap::new(130);
        for index in 0..128 {
            bitmap.reserve(index);
        }

        assert_eq!(Some(128), bitmap.first_free());
        assert!(bitmap.is_reserved(64));
    }

    #[test]
    fn full_bitmap_has_no_free_slot() {
        let mut bitmap = SlotBitmap::new(70);
        for index in 0..70 {
            bitmap.reserve(index);
        }
        assert_eq!(None, bitmap.first_free());
        assert!(!bitmap.has_free());
    }

    #[test]
    fn slot_write_and_read_round_trip() {
        let services = SimMemory::new();
        let anchor = services.add_image_region(0x1000, 0);
        let allocator = allocator_with(services);

        let indirect = allocator.create_indirect(anchor.base).unwrap();
        indirect.write(0xDEAD_BEEF);
        assert_eq!(0xDEAD_BEEF, indirect.read());
    }

    #[test]
    fn released_slot_is_zeroed_and_reused_deterministically() {
        let services = SimMemory::new();
        let anchor = services.add_image_region(0x1000, 0);
        let allocator = allocator_with(services);

        let first = allocator.create_indirect(anchor.base).unwrap();
        let _second = allocator.create_indirect(anchor.base).unwrap();
        let first_address = first.address();
        first.write(0x1234);
        drop(first);

        // Slot zeroed on release, then handed out again as lowest free.
        let reused = allocator.create_indirect(anchor.base).unwrap();
        assert_eq!(first_address, reused.address());
        assert_eq!(0, reused.read());
    }

    #[test]
    fn region_capacity_is_exactly_size_over_pointer_size() {
        let services = SimMemory::new();
        // The image has no trailing padding, so once near allocations are
        // denied there is no region left to fall back to.
        let anchor = services.add_image_region(0x1000, 0);
        let allocator = allocator_with(services.clone());

        let slots = INDIRECT_REGION_SIZE / SLOT_SIZE;
        let mut live = Vec::with_capacity(slots);
        for _ in 0..slots {
            live.push(allocator.create_indirect(anchor.base).unwrap());
        }

        // The only region is full and the backend has no near placement
        // left, so one more request must fail...
        services.deny_near_allocations();
        let overflow = allocator.create_indirect(anchor.base);
        assert!(overflow.is_err());

        // ...until exactly one slot is handed back.
        live.pop();
        let replacement = allocator.create_indirect(anchor.base);
        assert!(replacement.is_ok());
    }

    #[test]
    fn falls_back_to_a_cave_when_no_near_allocation_exists() {
        let services = SimMemory::new();
        let image = services.add_image_region(0x2000, 0x100);
        services.deny_near_allocations();
        let allocator = allocator_with(services);

        let target = image.base + 0x10;
        let indirect = allocator.create_indirect(target).unwrap();

        assert!(crate::proximity::is_near(
            indirect.address(),
            SLOT_SIZE,
            target
        ));
        // The slot lives inside the image's trailing padding.
        assert!(indirect.address() >= image.base);
        assert!(indirect.address() < image.end());
    }
}
