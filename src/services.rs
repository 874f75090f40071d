//! Low level memory services consumed by the allocator.
//!
//! This trait provides an abstraction to handle low level virtual memory
//! operations and syscalls. The allocator, as the top level view of this,
//! has nothing to do with the concrete implementations / APIs offered by
//! each kernel, so everything platform-dependant lives behind
//! [`MemoryServices`].
//!
//! The contract is intentionally narrow: allocate (optionally near an
//! address), free, query a region, walk to the neighbouring region above or
//! below, and change page protection. Everything else the allocator does is
//! built on top of these seven operations, which also makes the whole crate
//! testable against a simulated backend.

use std::io;

use crate::error::Result;
use crate::proximity;

/// What kind of mapping a queried region belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    /// Backed by a loaded module (executable or shared library). Only these
    /// are eligible for cave scavenging.
    Image,
    /// File-backed or special mapping that is not a module image.
    Mapped,
    /// Anonymous private mapping.
    Private,
    /// Unmapped address space.
    Free,
}

/// Page protection modes the allocator cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    Read,
    ReadWrite,
    ExecuteRead,
    ExecuteReadWrite,
}

/// Snapshot of one region of the process address space.
#[derive(Clone, Copy, Debug)]
pub struct RegionInfo {
    /// Base address of the region.
    pub base: usize,
    /// Size of the region in bytes.
    pub size: usize,
    /// Mapping kind, see [`RegionKind`].
    pub kind: RegionKind,
    /// Current page protection.
    pub protection: Protection,
}

impl RegionInfo {
    /// One past the last byte of the region.
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

/// The native memory services contract.
///
/// Implemented per platform below, and by the simulated backend the tests
/// use. Addresses are plain `usize` so that the same code paths serve both.
pub trait MemoryServices: Send + Sync {
    /// Map a new readable-writable region of at least `size` bytes anywhere
    /// in the address space. Failure here is an OS level error.
    fn allocate(&self, size: usize) -> Result<RegionInfo>;

    /// Map a new region whose placement satisfies
    /// [`proximity::is_near`] relative to `near`. Returns `Ok(None)` when the
    /// OS cannot place such a mapping; this is the caller's cue to try a
    /// cave instead.
    fn allocate_near(&self, near: usize, size: usize) -> Result<Option<RegionInfo>>;

    /// Unmap a region previously returned by [`allocate`] or
    /// [`allocate_near`].
    ///
    /// **SAFETY**: `base` and `size` must describe exactly one region
    /// obtained from this service and not yet freed.
    ///
    /// [`allocate`]: MemoryServices::allocate
    /// [`allocate_near`]: MemoryServices::allocate_near
    unsafe fn free(&self, base: usize, size: usize);

    /// Describe the region containing `address`.
    fn query(&self, address: usize) -> Result<RegionInfo>;

    /// Describe the closest region above `info`, or `None` at the top of the
    /// address space.
    fn query_above(&self, info: &RegionInfo) -> Option<RegionInfo>;

    /// Describe the closest region below `info`, or `None` at the bottom.
    fn query_below(&self, info: &RegionInfo) -> Option<RegionInfo>;

    /// Change the protection of `[base, base + size)`.
    fn protect(&self, base: usize, size: usize, protection: Protection) -> Result<()>;
}

/// The real, OS-backed implementation of [`MemoryServices`].
pub struct OsMemory;

#[cfg(unix)]
mod unix {
    use super::*;

    use std::os::raw::{c_int, c_void};

    use libc::{mmap, mprotect, munmap, off_t, size_t};

    use crate::util::align;

    fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
    }

    fn prot_flags(protection: Protection) -> c_int {
        match protection {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ExecuteRead => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ExecuteReadWrite => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
        }
    }

    /// Parse one line of `/proc/self/maps`:
    /// `55e0a000-55e0b000 r-xp 00000000 08:02 131 /usr/lib/libfoo.so`
    fn parse_maps_line(line: &str) -> Option<RegionInfo> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        // offset, dev, inode
        let _ = fields.next()?;
        let _ = fields.next()?;
        let _ = fields.next()?;
        let path = fields.next().unwrap_or("");

        let (start, end) = range.split_once('-')?;
        let base = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;

        let bytes = perms.as_bytes();
        let read = bytes.first() == Some(&b'r');
        let write = bytes.get(1) == Some(&b'w');
        let exec = bytes.get(2) == Some(&b'x');
        let protection = match (read, write, exec) {
            (true, true, true) => Protection::ExecuteReadWrite,
            (true, false, true) | (false, _, true) => Protection::ExecuteRead,
            (true, true, false) => Protection::ReadWrite,
            (true, false, false) => Protection::Read,
            (false, _, false) => Protection::NoAccess,
        };

        let kind = if path.starts_with('/') {
            RegionKind::Image
        } else if path.starts_with('[') {
            RegionKind::Mapped
        } else {
            RegionKind::Private
        };

        Some(RegionInfo {
            base,
            size: end - base,
            kind,
            protection,
        })
    }

    /// Snapshot of all mapped regions, sorted by base address.
    fn mapped_regions() -> Result<Vec<RegionInfo>> {
        let maps = std::fs::read_to_string("/proc/self/maps").map_err(io::Error::from)?;
        Ok(maps.lines().filter_map(parse_maps_line).collect())
    }

    /// Page-aligned bases of address-space gaps able to hold `size` bytes:
    /// every gap between two mappings, plus the open space above the highest
    /// mapping. `regions` must be sorted ascending by base, the order
    /// `/proc/self/maps` reports.
    pub(super) fn gap_candidates(regions: &[RegionInfo], size: usize, page: usize) -> Vec<usize> {
        let mut candidates = Vec::new();
        let mut previous_end = 0x10000;

        for region in regions {
            let gap_base = align(previous_end, page);
            if region.base > gap_base && region.base - gap_base >= size {
                candidates.push(gap_base);
            }
            previous_end = region.end();
        }
        candidates.push(align(previous_end, page));

        candidates
    }

    fn map_at(hint: usize, size: usize, extra_flags: c_int) -> Option<RegionInfo> {
        const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags;
        let addr = unsafe { mmap(hint as *mut c_void, size as size_t, PROT, flags, FD, OFFSET) };
        if addr == libc::MAP_FAILED {
            return None;
        }

        Some(RegionInfo {
            base: addr as usize,
            size,
            kind: RegionKind::Private,
            protection: Protection::ReadWrite,
        })
    }

    impl MemoryServices for OsMemory {
        fn allocate(&self, size: usize) -> Result<RegionInfo> {
            let size = align(size, page_size());
            map_at(0, size, 0).ok_or_else(|| io::Error::last_os_error().into())
        }

        fn allocate_near(&self, near: usize, size: usize) -> Result<Option<RegionInfo>> {
            let size = align(size, page_size());

            // Try each gap that fits within displacement range of `near`.
            // MAP_FIXED_NOREPLACE makes losing a race with another mapping
            // a clean failure rather than a clobber.
            let regions = mapped_regions()?;
            for gap_base in gap_candidates(&regions, size, page_size()) {
                if !proximity::is_near(gap_base, size, near) {
                    continue;
                }
                if let Some(info) = map_at(gap_base, size, libc::MAP_FIXED_NOREPLACE) {
                    return Ok(Some(info));
                }
            }

            Ok(None)
        }

        unsafe fn free(&self, base: usize, size: usize) {
            unsafe {
                munmap(base as *mut c_void, size as size_t);
            }
        }

        fn query(&self, address: usize) -> Result<RegionInfo> {
            mapped_regions()?
                .into_iter()
                .find(|region| region.base <= address && address < region.end())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "address is not mapped").into()
                })
        }

        fn query_above(&self, info: &RegionInfo) -> Option<RegionInfo> {
            mapped_regions()
                .ok()?
                .into_iter()
                .find(|region| region.base > info.base)
        }

        fn query_below(&self, info: &RegionInfo) -> Option<RegionInfo> {
            mapped_regions()
                .ok()?
                .into_iter()
                .rev()
                .find(|region| region.base < info.base)
        }

        fn protect(&self, base: usize, size: usize, protection: Protection) -> Result<()> {
            let page = page_size();
            let aligned_base = base & !(page - 1);
            let aligned_size = align(size + (base - aligned_base), page);
            let result = unsafe {
                mprotect(
                    aligned_base as *mut c_void,
                    aligned_size as size_t,
                    prot_flags(protection),
                )
            };
            if result != 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;

    use std::mem::MaybeUninit;
    use std::os::raw::c_void;

    use windows::Win32::System::Memory;
    use windows::Win32::System::SystemInformation;

    fn system_info() -> SystemInformation::SYSTEM_INFO {
        unsafe {
            let mut info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(info.as_mut_ptr());
            info.assume_init()
        }
    }

    fn page_flags(protection: Protection) -> Memory::PAGE_PROTECTION_FLAGS {
        match protection {
            Protection::NoAccess => Memory::PAGE_NOACCESS,
            Protection::Read => Memory::PAGE_READONLY,
            Protection::ReadWrite => Memory::PAGE_READWRITE,
            Protection::ExecuteRead => Memory::PAGE_EXECUTE_READ,
            Protection::ExecuteReadWrite => Memory::PAGE_EXECUTE_READWRITE,
        }
    }

    fn protection_from(flags: Memory::PAGE_PROTECTION_FLAGS) -> Protection {
        match flags {
            Memory::PAGE_EXECUTE_READWRITE | Memory::PAGE_EXECUTE_WRITECOPY => {
                Protection::ExecuteReadWrite
            }
            Memory::PAGE_EXECUTE | Memory::PAGE_EXECUTE_READ => Protection::ExecuteRead,
            Memory::PAGE_READWRITE | Memory::PAGE_WRITECOPY => Protection::ReadWrite,
            Memory::PAGE_READONLY => Protection::Read,
            _ => Protection::NoAccess,
        }
    }

    fn query_at(address: usize) -> Option<RegionInfo> {
        unsafe {
            let mut mbi = MaybeUninit::<Memory::MEMORY_BASIC_INFORMATION>::uninit();
            let written = Memory::VirtualQuery(
                Some(address as *const c_void),
                mbi.as_mut_ptr(),
                std::mem::size_of::<Memory::MEMORY_BASIC_INFORMATION>(),
            );
            if written == 0 {
                return None;
            }
            let mbi = mbi.assume_init();

            let kind = if mbi.State == Memory::MEM_FREE {
                RegionKind::Free
            } else {
                match mbi.Type {
                    Memory::MEM_IMAGE => RegionKind::Image,
                    Memory::MEM_MAPPED => RegionKind::Mapped,
                    _ => RegionKind::Private,
                }
            };

            Some(RegionInfo {
                base: mbi.BaseAddress as usize,
                size: mbi.RegionSize,
                kind,
                protection: protection_from(mbi.Protect),
            })
        }
    }

    fn commit_at(address: Option<usize>, size: usize) -> Option<RegionInfo> {
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
        let base = unsafe {
            Memory::VirtualAlloc(
                address.map(|a| a as *const c_void),
                size,
                flags,
                Memory::PAGE_READWRITE,
            )
        };
        if base.is_null() {
            return None;
        }

        Some(RegionInfo {
            base: base as usize,
            size,
            kind: RegionKind::Private,
            protection: Protection::ReadWrite,
        })
    }

    /// Commit at `address` and hand the region back only if its actual
    /// placement satisfies the displacement constraint; the OS rounds the
    /// base down to the allocation granularity, so the committed region is
    /// re-verified rather than trusted.
    fn claim_near(address: usize, size: usize, near: usize) -> Option<RegionInfo> {
        let region = commit_at(Some(address), size)?;
        if proximity::is_near(region.base, region.size, near) {
            return Some(region);
        }
        unsafe {
            let _ = Memory::VirtualFree(region.base as *mut c_void, 0, Memory::MEM_RELEASE);
        }
        None
    }

    impl MemoryServices for OsMemory {
        fn allocate(&self, size: usize) -> Result<RegionInfo> {
            commit_at(None, size).ok_or_else(|| io::Error::last_os_error().into())
        }

        fn allocate_near(&self, near: usize, size: usize) -> Result<Option<RegionInfo>> {
            let info = system_info();
            let granularity = info.dwAllocationGranularity as usize;
            let minimum = info.lpMinimumApplicationAddress as usize;

            // Walk allocation-granularity candidates outward from the
            // target, below first and then above, claiming the first free
            // region that still satisfies the displacement constraint.
            // Hitting the application minimum stops the downward walk: a
            // probe below it cannot be committed, and a zero base would turn
            // the commit into an OS-chosen placement.
            let mut below = near - near % granularity;
            loop {
                below = below.saturating_sub(granularity);
                if below < minimum {
                    break;
                }
                if !proximity::is_near(below, size, near) {
                    break;
                }
                let Some(candidate) = query_at(below) else { break };
                if candidate.kind == RegionKind::Free && candidate.size >= size {
                    if let Some(region) = claim_near(below, size, near) {
                        return Ok(Some(region));
                    }
                }
            }

            let mut above = near - near % granularity;
            while above < info.lpMaximumApplicationAddress as usize {
                above += granularity;
                if !proximity::is_near(above, size, near) {
                    break;
                }
                let Some(candidate) = query_at(above) else { break };
                if candidate.kind == RegionKind::Free && candidate.size >= size {
                    if let Some(region) = claim_near(above, size, near) {
                        return Ok(Some(region));
                    }
                }
            }

            Ok(None)
        }

        unsafe fn free(&self, base: usize, _size: usize) {
            unsafe {
                let _ = Memory::VirtualFree(base as *mut c_void, 0, Memory::MEM_RELEASE);
            }
        }

        fn query(&self, address: usize) -> Result<RegionInfo> {
            query_at(address).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "address is not queryable").into()
            })
        }

        fn query_above(&self, info: &RegionInfo) -> Option<RegionInfo> {
            query_at(info.end())
        }

        fn query_below(&self, info: &RegionInfo) -> Option<RegionInfo> {
            query_at(info.base.checked_sub(1)?)
        }

        fn protect(&self, base: usize, size: usize, protection: Protection) -> Result<()> {
            unsafe {
                let mut previous = Memory::PAGE_PROTECTION_FLAGS::default();
                Memory::VirtualProtect(
                    base as *const c_void,
                    size,
                    page_flags(protection),
                    &mut previous,
                )
                .map_err(|error| io::Error::other(error))?;
            }
            Ok(())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn query_finds_the_region_containing_a_live_address() {
        let services = OsMemory;
        let local = &services as *const _ as usize;

        let info = services.query(local).expect("stack must be mapped");
        assert!(info.base <= local && local < info.end());
    }

    #[test]
    fn allocate_and_free_round_trip() {
        let services = OsMemory;
        let region = services.allocate(0x1000).expect("plain allocation");

        unsafe {
            *(region.base as *mut u8) = 0xCC;
            assert_eq!(0xCC, *(region.base as *const u8));
            services.free(region.base, region.size);
        }
    }

    #[test]
    fn query_above_moves_upward() {
        let services = OsMemory;
        let local = &services as *const _ as usize;

        let info = services.query(local).unwrap();
        if let Some(above) = services.query_above(&info) {
            assert!(above.base > info.base);
        }
    }

    fn region_at(base: usize, size: usize) -> RegionInfo {
        RegionInfo {
            base,
            size,
            kind: RegionKind::Private,
            protection: Protection::ReadWrite,
        }
    }

    #[test]
    fn gap_search_offers_the_space_above_the_highest_mapping() {
        let regions = [
            region_at(0x10_0000, 0x1000),
            region_at(0x20_0000, 0x1000),
        ];

        let candidates = super::unix::gap_candidates(&regions, 0x1000, 0x1000);

        // Two inter-region gaps plus the open space above everything.
        assert_eq!(vec![0x10000, 0x10_1000, 0x20_1000], candidates);
    }

    #[test]
    fn gap_search_skips_gaps_too_small_for_the_request() {
        let regions = [
            region_at(0x10_0000, 0x1000),
            region_at(0x10_2000, 0x1000),
        ];

        let candidates = super::unix::gap_candidates(&regions, 0x4000, 0x1000);

        // The 0x1000-byte gap between the mappings does not fit 0x4000.
        assert_eq!(vec![0x10000, 0x10_3000], candidates);
    }
}
