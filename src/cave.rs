//! Scavenging of unused trailing bytes ("caves") inside mapped images.
//!
//! When the OS cannot place a fresh mapping within displacement range of a
//! target (common near heavily populated code), the allocator falls back to
//! reusing memory that is already there: binaries reliably contain zero
//! padding after the last function of a section. The finder walks the
//! address space outward from the target, and for every image mapping it has
//! not seen before it measures that padding:
//!
//! ```text
//!        image region
//! +---------------------+---------------------+--------+
//! |  .text instructions | 00 00 00 ... 00 00  | margin |
//! +---------------------+---------------------+--------+
//!                       ^ cave                ^ 8 bytes kept clear of the
//!                                               last real instruction
//! ```
//!
//! Candidates below the usable threshold are still recorded (the region is
//! consumed either way, so it is never rescanned) and the search continues.
//! Every iteration retires one region base, so the search always terminates:
//! either with a usable cave or with both directions exhausted, which is
//! fatal for this target.

use std::sync::Arc;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::proximity;
use crate::region::MemoryRegion;
use crate::services::{MemoryServices, Protection, RegionInfo, RegionKind};

/// Smallest cave worth handing out.
const MIN_CAVE_SIZE: isize = 0x10;

/// Bytes kept clear at the end of a cave so the last real instruction of the
/// section is never overlapped.
const CAVE_TAIL_MARGIN: isize = 8;

/// Regions based below this address are never scanned.
const LOWEST_SCAN_ADDRESS: usize = 0x10000;

/// A measured candidate. `size` may be negative when the zero padding was
/// smaller than the tail margin; such a cave is consumed but unusable.
#[derive(Clone, Copy, Debug)]
struct Cave {
    region_base: usize,
    address: usize,
    size: isize,
}

impl Cave {
    fn is_usable(&self) -> bool {
        self.size >= MIN_CAVE_SIZE
    }
}

/// Scans the address space around target addresses for reusable caves.
pub struct CaveFinder {
    services: Arc<dyn MemoryServices>,
    /// Every candidate ever measured, usable or not, keyed by the enclosing
    /// region's base so no region is scanned twice.
    caves: Vec<Cave>,
}

impl CaveFinder {
    pub fn new(services: Arc<dyn MemoryServices>) -> Self {
        Self {
            services,
            caves: Vec::new(),
        }
    }

    /// Locate a cave of at least [`MIN_CAVE_SIZE`] usable bytes near
    /// `target`. Exhausting both scan directions without one is fatal: no
    /// placement is possible for this target.
    pub fn find_cave_near(&mut self, target: usize) -> Result<MemoryRegion> {
        let start = self.services.query(target)?;

        loop {
            let cave = self.next_candidate(target, &start)?;
            self.caves.push(cave);

            if cave.is_usable() {
                debug!(
                    "cave at {:#x} ({:#x} bytes) inside region {:#x}",
                    cave.address, cave.size, cave.region_base
                );
                return Ok(MemoryRegion::Caved {
                    region_base: cave.region_base,
                    address: cave.address,
                    size: cave.size as usize,
                });
            }

            trace!(
                "region {:#x} yields no usable cave ({} bytes), continuing",
                cave.region_base, cave.size
            );
        }
    }

    /// Measure the nearest still-unscanned image region, looking upward
    /// first and then downward.
    fn next_candidate(&self, target: usize, start: &RegionInfo) -> Result<Cave> {
        if let Some(cave) = self.scan_up(target, start)? {
            return Ok(cave);
        }
        if let Some(cave) = self.scan_down(target, start)? {
            return Ok(cave);
        }

        Err(Error::NoPlacement { target })
    }

    fn scan_up(&self, target: usize, start: &RegionInfo) -> Result<Option<Cave>> {
        if self.accepts(start, target) {
            return Ok(Some(self.carve(start)?));
        }

        let mut current = *start;
        while let Some(info) = self.services.query_above(&current) {
            if !proximity::is_near(info.base, info.size, target) {
                break;
            }
            if self.accepts(&info, target) {
                return Ok(Some(self.carve(&info)?));
            }
            current = info;
        }

        Ok(None)
    }

    fn scan_down(&self, target: usize, start: &RegionInfo) -> Result<Option<Cave>> {
        let mut current = *start;
        while let Some(info) = self.services.query_below(&current) {
            if info.base < LOWEST_SCAN_ADDRESS {
                break;
            }
            if !proximity::is_near(info.base, info.size, target) {
                break;
            }
            if self.accepts(&info, target) {
                return Ok(Some(self.carve(&info)?));
            }
            current = info;
        }

        Ok(None)
    }

    /// A region is a candidate when it is an image mapping, within range,
    /// and has not been measured before.
    fn accepts(&self, info: &RegionInfo, target: usize) -> bool {
        info.kind == RegionKind::Image
            && info.base >= LOWEST_SCAN_ADDRESS
            && proximity::is_near(info.base, info.size, target)
            && !self.already_found(info.base)
    }

    fn already_found(&self, region_base: usize) -> bool {
        self.caves.iter().any(|cave| cave.region_base == region_base)
    }

    /// Measure the trailing zero padding of an accepted region and make it
    /// writable and executable for the stubs that will live there.
    fn carve(&self, info: &RegionInfo) -> Result<Cave> {
        self.services
            .protect(info.base, info.size, Protection::ExecuteReadWrite)?;

        let zeros = unsafe { count_trailing_zero_bytes(info.base, info.size) };
        let size = zeros as isize - CAVE_TAIL_MARGIN;
        let address = if size > 0 {
            info.end() - size as usize
        } else {
            info.end()
        };

        Ok(Cave {
            region_base: info.base,
            address,
            size,
        })
    }
}

/// Count zero bytes at the end of `[base, base + size)`, scanning backward
/// from the last byte.
///
/// **SAFETY**: the whole range must be mapped and readable.
unsafe fn count_trailing_zero_bytes(base: usize, size: usize) -> usize {
    let mut count = 0;
    let mut pointer = (base + size - 1) as *const u8;

    while count < size && unsafe { *pointer } == 0 {
        count += 1;
        pointer = unsafe { pointer.sub(1) };
    }

    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::SimMemory;

    #[test]
    fn finds_trailing_zero_padding_in_an_image() {
        let services = SimMemory::new();
        let image = services.add_image_region(0x2000, 0x100);
        let target = image.base + 0x10;

        let mut finder = CaveFinder::new(services);
        let cave = finder.find_cave_near(target).unwrap();

        // 0x100 zero bytes minus the 8-byte tail margin.
        assert_eq!(0x100 - 8, cave.size());
        assert_eq!(image.end() - cave.size(), cave.address());
        assert!(cave.is_near(target));
    }

    #[test]
    fn region_is_never_scanned_twice() {
        let services = SimMemory::new();
        let image = services.add_image_region(0x2000, 0x100);
        let target = image.base + 0x10;

        let mut finder = CaveFinder::new(services);
        finder.find_cave_near(target).unwrap();

        // The only image is consumed now, so the same target has nowhere
        // left to go.
        let second = finder.find_cave_near(target);
        assert!(matches!(second, Err(Error::NoPlacement { .. })));
    }

    #[test]
    fn unusable_padding_is_skipped_for_the_next_image() {
        let services = SimMemory::new();
        // First candidate has only 4 zero bytes, below margin + threshold.
        let cramped = services.add_image_region(0x2000, 4);
        let roomy = services.add_image_region(0x2000, 0x80);
        let target = cramped.base + 0x10;

        let mut finder = CaveFinder::new(services);
        let cave = finder.find_cave_near(target).unwrap();

        assert_eq!(0x80 - 8, cave.size());
        assert!(matches!(
            cave,
            MemoryRegion::Caved { region_base, .. } if region_base == roomy.base
        ));
    }

    #[test]
    fn non_image_regions_are_ignored() {
        let services = SimMemory::new();
        let anon = services.add_private_region(0x2000);
        let target = anon.base + 0x10;

        let mut finder = CaveFinder::new(services);
        let result = finder.find_cave_near(target);
        assert!(matches!(result, Err(Error::NoPlacement { .. })));
    }

    #[test]
    fn cave_region_is_made_executable() {
        let services = SimMemory::new();
        let image = services.add_image_region(0x2000, 0x100);
        let target = image.base + 0x10;

        let mut finder = CaveFinder::new(services.clone());
        finder.find_cave_near(target).unwrap();

        assert_eq!(
            Some(Protection::ExecuteReadWrite),
            services.protection_of(image.base)
        );
    }
}
