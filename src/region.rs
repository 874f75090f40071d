//! Coarse-grained memory regions and the registry that owns them.
//!
//! Every OS-backed allocation this crate ever makes goes through the
//! [`RegionAllocator`] and stays registered there until [`dispose`] tears the
//! whole subsystem down. There is deliberately no shrink or early-return
//! path: hooks reference this memory for the lifetime of the process, and an
//! empty region is harmless because it may serve a future request.
//!
//! A region comes in two variants:
//!
//! ```text
//! +--------------------+                +----------------------------------+
//! |     Allocated      |                |         enclosing image          |
//! |  (owned, mapped    |                | +--------------+    +---------+  |
//! |   by this crate)   |                | | module code  | .. |  Caved  |  |
//! +--------------------+                | +--------------+    +---------+  |
//!                                       +----------------------------------+
//! ```
//!
//! *Allocated* regions are exclusively owned and released exactly once.
//! *Caved* regions are views into mappings that belong to another image
//! already present in the process; this crate never releases them.
//!
//! [`dispose`]: RegionAllocator::dispose

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::Result;
use crate::proximity;
use crate::services::MemoryServices;

/// A coarse-grained block of process memory that subsystems carve into
/// smaller structures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRegion {
    /// OS-backed, owned by the [`RegionAllocator`].
    Allocated {
        /// Base address of the mapping.
        base: usize,
        /// Mapping size in bytes.
        size: usize,
    },
    /// Trailing free bytes carved out of a mapping this crate does not own.
    Caved {
        /// Base of the enclosing image mapping, used for de-duplication.
        region_base: usize,
        /// First usable byte of the cave.
        address: usize,
        /// Usable bytes in the cave.
        size: usize,
    },
}

impl MemoryRegion {
    /// First usable address of the region.
    pub fn address(&self) -> usize {
        match *self {
            MemoryRegion::Allocated { base, .. } => base,
            MemoryRegion::Caved { address, .. } => address,
        }
    }

    /// Usable bytes in the region.
    pub fn size(&self) -> usize {
        match *self {
            MemoryRegion::Allocated { size, .. } => size,
            MemoryRegion::Caved { size, .. } => size,
        }
    }

    /// Whether the region lies within displacement range of `target`.
    pub fn is_near(&self, target: usize) -> bool {
        proximity::is_near(self.address(), self.size(), target)
    }
}

/// Central lifetime registry for every OS-backed allocation of the crate.
pub struct RegionAllocator {
    services: Arc<dyn MemoryServices>,
    regions: Mutex<Vec<MemoryRegion>>,
}

impl RegionAllocator {
    pub fn new(services: Arc<dyn MemoryServices>) -> Self {
        Self {
            services,
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Shared access to the underlying memory services, for collaborators
    /// that need to query or protect memory directly.
    pub fn services(&self) -> &Arc<dyn MemoryServices> {
        &self.services
    }

    /// Map and register a new region of at least `size` bytes, anywhere.
    /// An OS refusal propagates as [`Error::Os`].
    ///
    /// [`Error::Os`]: crate::error::Error::Os
    pub fn allocate(&self, size: usize) -> Result<MemoryRegion> {
        let info = self.services.allocate(size)?;
        let region = MemoryRegion::Allocated {
            base: info.base,
            size: info.size,
        };

        debug!("allocated region {:#x} ({:#x} bytes)", info.base, info.size);
        self.regions.lock().push(region);
        Ok(region)
    }

    /// Map and register a new region whose placement is near `target`.
    /// `Ok(None)` means the OS could not place such a mapping; the caller
    /// should fall back to cave scavenging.
    pub fn allocate_near(&self, target: usize, size: usize) -> Result<Option<MemoryRegion>> {
        let Some(info) = self.services.allocate_near(target, size)? else {
            debug!("no near placement for target {target:#x}");
            return Ok(None);
        };

        let region = MemoryRegion::Allocated {
            base: info.base,
            size: info.size,
        };

        debug!(
            "allocated region {:#x} ({:#x} bytes) near {target:#x}",
            info.base, info.size
        );
        self.regions.lock().push(region);
        Ok(Some(region))
    }

    /// Release every still-registered region exactly once. Idempotent; a
    /// second call finds an empty registry and does nothing.
    ///
    /// Callers must have released all handles into these regions first:
    /// after disposal every address the allocator ever returned is invalid.
    pub fn dispose(&self) {
        let regions: Vec<MemoryRegion> = self.regions.lock().drain(..).collect();
        for region in regions {
            if let MemoryRegion::Allocated { base, size } = region {
                debug!("releasing region {base:#x} ({size:#x} bytes)");
                unsafe {
                    self.services.free(base, size);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self) -> usize {
        self.regions.lock().len()
    }
}

impl Drop for RegionAllocator {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::SimMemory;

    #[test]
    fn allocation_is_registered_until_disposal() {
        let services = SimMemory::new();
        let allocator = RegionAllocator::new(services.clone());

        let region = allocator.allocate(0x1000).unwrap();
        assert!(region.size() >= 0x1000);
        assert_eq!(1, allocator.registered_count());

        allocator.dispose();
        assert_eq!(0, allocator.registered_count());
        assert_eq!(1, services.freed_count());
    }

    #[test]
    fn dispose_is_idempotent() {
        let services = SimMemory::new();
        let allocator = RegionAllocator::new(services.clone());

        allocator.allocate(0x1000).unwrap();
        allocator.allocate(0x2000).unwrap();

        allocator.dispose();
        allocator.dispose();
        assert_eq!(2, services.freed_count());
    }

    #[test]
    fn near_allocation_miss_is_not_an_error() {
        let services = SimMemory::new();
        services.deny_near_allocations();
        let allocator = RegionAllocator::new(services);

        let region = allocator.allocate_near(0x7000_0000, 0x1000).unwrap();
        assert!(region.is_none());
    }

    #[test]
    fn near_allocation_lands_within_range() {
        let services = SimMemory::new();
        let allocator = RegionAllocator::new(services);

        let anchor = allocator.allocate(0x1000).unwrap();
        let near = allocator
            .allocate_near(anchor.address(), 0x1000)
            .unwrap()
            .expect("simulated backend places near allocations");
        assert!(near.is_near(anchor.address()));
    }
}
