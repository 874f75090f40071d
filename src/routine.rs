//! Variable-length executable-code buffers ("routines").
//!
//! A routine is a contiguous byte range inside a routine region, holding
//! injected machine code. Regions keep their live routines ordered by
//! offset, and a new routine is placed first-fit, lowest offset wins:
//!
//! ```text
//! +------------------------- routine region -------------------------+
//! | routine @0 |   gap   | routine @150 |      gap      | routine @N |
//! +-------------------------------------------------------------------+
//!      insertion order tried: before the first, after the last,
//!      then the first sufficient gap scanning low-to-high
//! ```
//!
//! Releasing a routine zero-fills its bytes and immediately frees the range
//! for reuse by the offset search. No two live routines in the same region
//! ever overlap.

use std::ptr;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::region::{MemoryRegion, RegionAllocator};

/// Size of a fresh OS allocation backing a routine region.
pub const ROUTINE_REGION_SIZE: usize = 0x10000;

/// Bookkeeping entry for one live routine, identified by `id` so handles
/// stay valid while their byte range moves through release.
#[derive(Clone, Copy)]
struct RoutineEntry {
    id: u64,
    offset: usize,
    size: usize,
}

/// One region holding zero or more non-overlapping routines in
/// ascending-offset order.
struct RoutineRegion {
    memory: MemoryRegion,
    /// Live routines, ascending by offset.
    entries: Vec<RoutineEntry>,
    next_id: u64,
}

impl RoutineRegion {
    fn new(memory: MemoryRegion) -> Self {
        Self {
            memory,
            entries: Vec::new(),
            next_id: 0,
        }
    }

    /// Where a routine of `size` bytes fits, or `None` if nowhere.
    ///
    /// First-fit prioritizing low offsets: an empty region places at zero;
    /// then the gap before the first routine, the gap after the last, and
    /// finally the first sufficient inter-routine gap scanning low-to-high.
    fn offset_for_insert(&self, size: usize) -> Option<usize> {
        let region_size = self.memory.size();

        if self.entries.is_empty() {
            return if region_size > size { Some(0) } else { None };
        }

        let first = &self.entries[0];
        if first.offset >= size {
            return Some(0);
        }

        let last = &self.entries[self.entries.len() - 1];
        if last.offset + last.size + size < region_size {
            return Some(last.offset + last.size);
        }

        for pair in self.entries.windows(2) {
            let end = pair[0].offset + pair[0].size;
            if end + size <= pair[1].offset {
                return Some(end);
            }
        }

        None
    }

    fn has_space_for(&self, size: usize) -> bool {
        self.offset_for_insert(size).is_some()
    }

    /// Claim `[offset, offset + size)`, keeping the entries sorted.
    fn insert(&mut self, offset: usize, size: usize) -> RoutineEntry {
        let entry = RoutineEntry {
            id: self.next_id,
            offset,
            size,
        };
        self.next_id += 1;

        let position = self
            .entries
            .iter()
            .position(|existing| existing.offset > offset)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, entry);
        entry
    }

    /// Zero the routine's bytes and free its range for reuse.
    fn remove(&mut self, id: u64) {
        let Some(position) = self.entries.iter().position(|entry| entry.id == id) else {
            return;
        };
        let entry = self.entries.remove(position);

        unsafe {
            ptr::write_bytes(
                (self.memory.address() + entry.offset) as *mut u8,
                0,
                entry.size,
            );
        }
    }

    fn shrink(&mut self, id: u64, size: usize) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.size = size;
        }
    }
}

/// Handle to one routine buffer. Owned by exactly one caller; released on
/// drop or explicitly, idempotently, via [`release`].
///
/// [`release`]: Routine::release
pub struct Routine {
    region: Arc<Mutex<RoutineRegion>>,
    id: u64,
    offset: usize,
    address: usize,
    size: usize,
    released: bool,
}

impl Routine {
    /// Address of the first byte of the buffer.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Offset of the buffer inside its region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Current buffer size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Overwrite the start of the buffer with `bytes`.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.released {
            return Err(Error::InvalidReuse("write to a released routine"));
        }
        if bytes.len() > self.size {
            return Err(Error::ExhaustedCapacity("write exceeds routine size"));
        }

        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.address as *mut u8, bytes.len());
        }
        Ok(())
    }

    /// Copy of the buffer's current bytes.
    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size];
        unsafe {
            ptr::copy_nonoverlapping(self.address as *const u8, bytes.as_mut_ptr(), self.size);
        }
        bytes
    }

    /// Zero-fill `[address, address + size)` and return the range to the
    /// region. Safe to call more than once; only the first call has an
    /// effect.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.region.lock().remove(self.id);
    }
}

impl Drop for Routine {
    fn drop(&mut self) {
        self.release();
    }
}

/// A routine allocated generously, filled in, then finalized to its real
/// size exactly once. A second [`fix_size`] is an invalid reuse.
///
/// [`fix_size`]: FixedRoutine::fix_size
pub struct FixedRoutine {
    routine: Routine,
    size_fixed: bool,
}

impl FixedRoutine {
    pub fn address(&self) -> usize {
        self.routine.address()
    }

    pub fn offset(&self) -> usize {
        self.routine.offset()
    }

    pub fn size(&self) -> usize {
        self.routine.size()
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.routine.write(bytes)
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.routine.bytes()
    }

    /// Shrink the recorded size to `size` once the real content is known.
    /// The freed tail becomes available to the region's offset search.
    pub fn fix_size(&mut self, size: usize) -> Result<()> {
        if self.size_fixed {
            return Err(Error::InvalidReuse("routine size already fixed"));
        }
        if size > self.routine.size {
            return Err(Error::ExhaustedCapacity("fixed size exceeds allocation"));
        }
        self.size_fixed = true;

        self.routine.region.lock().shrink(self.routine.id, size);
        self.routine.size = size;
        Ok(())
    }

    pub fn release(&mut self) {
        self.routine.release();
    }
}

/// Finds or creates routine regions and places routines inside them.
pub struct RoutineAllocator {
    region_allocator: Arc<RegionAllocator>,
    regions: Mutex<Vec<Arc<Mutex<RoutineRegion>>>>,
}

impl RoutineAllocator {
    pub fn new(region_allocator: Arc<RegionAllocator>) -> Self {
        Self {
            region_allocator,
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Place a routine holding a copy of `bytes`.
    pub fn create_routine(&self, bytes: &[u8]) -> Result<Routine> {
        let routine = self.create_routine_sized(bytes.len())?;
        routine.write(bytes)?;
        Ok(routine)
    }

    /// Place an uninitialized (zeroed) routine of `size` bytes.
    pub fn create_routine_sized(&self, size: usize) -> Result<Routine> {
        // A request that cannot fit even a fresh region would otherwise
        // create empty regions forever.
        if size >= ROUTINE_REGION_SIZE {
            return Err(Error::ExhaustedCapacity("routine exceeds region size"));
        }

        let region = self.region_for(size)?;
        let mut inner = region.lock();
        let offset = inner
            .offset_for_insert(size)
            .ok_or(Error::ExhaustedCapacity("no offset for routine"))?;
        let entry = inner.insert(offset, size);
        let address = inner.memory.address() + offset;
        drop(inner);

        debug!("routine {:#x} ({size:#x} bytes) at offset {offset:#x}", address);
        Ok(Routine {
            region,
            id: entry.id,
            offset,
            address,
            size,
            released: false,
        })
    }

    /// Place a generously sized routine whose final size is fixed later.
    pub fn create_fixed_routine(&self, initial_size: usize) -> Result<FixedRoutine> {
        Ok(FixedRoutine {
            routine: self.create_routine_sized(initial_size)?,
            size_fixed: false,
        })
    }

    /// First region in creation order that fits, or a fresh one.
    fn region_for(&self, size: usize) -> Result<Arc<Mutex<RoutineRegion>>> {
        let mut regions = self.regions.lock();

        for region in regions.iter() {
            if region.lock().has_space_for(size) {
                return Ok(region.clone());
            }
        }

        let memory = self.region_allocator.allocate(ROUTINE_REGION_SIZE)?;
        let region = Arc::new(Mutex::new(RoutineRegion::new(memory)));
        regions.push(region.clone());
        Ok(region)
    }
}
