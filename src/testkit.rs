//! Simulated memory services for tests.
//!
//! Every simulated mapping is backed by a real, pointer-aligned heap buffer,
//! so the raw reads and writes the subsystems perform against the addresses
//! they are given are defined behavior in tests too. Freed mappings keep
//! their buffers alive (only the bookkeeping changes) so that late handle
//! drops never touch unmapped memory.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::proximity;
use crate::services::{MemoryServices, Protection, RegionInfo, RegionKind};

struct SimMapping {
    /// Backing storage; `u64` elements keep the base pointer-aligned.
    buf: Box<[u64]>,
    size: usize,
    kind: RegionKind,
    protection: Protection,
    freed: bool,
}

impl SimMapping {
    fn new(size: usize, kind: RegionKind, protection: Protection) -> Self {
        Self {
            buf: vec![0u64; size.div_ceil(8)].into_boxed_slice(),
            size,
            kind,
            protection,
            freed: false,
        }
    }

    fn base(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    fn contains(&self, address: usize) -> bool {
        self.base() <= address && address < self.base() + self.size
    }

    fn info(&self) -> RegionInfo {
        RegionInfo {
            base: self.base(),
            size: self.size,
            kind: self.kind,
            protection: self.protection,
        }
    }
}

struct SimState {
    mappings: Vec<SimMapping>,
    deny_near: bool,
    freed: usize,
}

/// In-process stand-in for the OS memory services.
pub(crate) struct SimMemory {
    state: Mutex<SimState>,
}

impl SimMemory {
    pub fn new() -> Arc<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(Self {
            state: Mutex::new(SimState {
                mappings: Vec::new(),
                deny_near: false,
                freed: 0,
            }),
        })
    }

    /// Make every subsequent `allocate_near` miss, forcing cave fallback.
    pub fn deny_near_allocations(&self) {
        self.state.lock().deny_near = true;
    }

    /// How many mappings have been freed so far.
    pub fn freed_count(&self) -> usize {
        self.state.lock().freed
    }

    /// Current protection of the mapping based at `base`.
    pub fn protection_of(&self, base: usize) -> Option<Protection> {
        let state = self.state.lock();
        state
            .mappings
            .iter()
            .find(|mapping| mapping.base() == base)
            .map(|mapping| mapping.protection)
    }

    /// Register an image mapping whose last `trailing_zeros` bytes are zero
    /// padding; the rest is filled with a nonzero instruction pattern.
    pub fn add_image_region(&self, size: usize, trailing_zeros: usize) -> RegionInfo {
        let mapping = SimMapping::new(size, RegionKind::Image, Protection::ExecuteRead);
        let content = size - trailing_zeros;
        unsafe {
            std::ptr::write_bytes(mapping.base() as *mut u8, 0xC3, content);
        }

        let info = mapping.info();
        self.state.lock().mappings.push(mapping);
        info
    }

    /// Register an anonymous private mapping.
    pub fn add_private_region(&self, size: usize) -> RegionInfo {
        let mapping = SimMapping::new(size, RegionKind::Private, Protection::ReadWrite);
        let info = mapping.info();
        self.state.lock().mappings.push(mapping);
        info
    }
}

impl MemoryServices for SimMemory {
    fn allocate(&self, size: usize) -> Result<RegionInfo> {
        let mapping = SimMapping::new(size, RegionKind::Private, Protection::ReadWrite);
        let info = mapping.info();
        self.state.lock().mappings.push(mapping);
        Ok(info)
    }

    fn allocate_near(&self, near: usize, size: usize) -> Result<Option<RegionInfo>> {
        if self.state.lock().deny_near {
            return Ok(None);
        }

        // Heap placements in one process are within displacement range of
        // each other in practice; verify anyway and report an honest miss
        // if this run says otherwise.
        let info = self.allocate(size)?;
        if proximity::is_near(info.base, info.size, near) {
            Ok(Some(info))
        } else {
            Ok(None)
        }
    }

    unsafe fn free(&self, base: usize, _size: usize) {
        let mut state = self.state.lock();
        if let Some(mapping) = state
            .mappings
            .iter_mut()
            .find(|mapping| mapping.base() == base && !mapping.freed)
        {
            mapping.freed = true;
            state.freed += 1;
        }
    }

    fn query(&self, address: usize) -> Result<RegionInfo> {
        let state = self.state.lock();
        state
            .mappings
            .iter()
            .find(|mapping| mapping.contains(address))
            .map(|mapping| mapping.info())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "address is not mapped").into()
            })
    }

    fn query_above(&self, info: &RegionInfo) -> Option<RegionInfo> {
        let state = self.state.lock();
        state
            .mappings
            .iter()
            .filter(|mapping| mapping.base() > info.base)
            .min_by_key(|mapping| mapping.base())
            .map(|mapping| mapping.info())
    }

    fn query_below(&self, info: &RegionInfo) -> Option<RegionInfo> {
        let state = self.state.lock();
        state
            .mappings
            .iter()
            .filter(|mapping| mapping.base() < info.base)
            .max_by_key(|mapping| mapping.base())
            .map(|mapping| mapping.info())
    }

    fn protect(&self, base: usize, _size: usize, protection: Protection) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(mapping) = state.mappings.iter_mut().find(|mapping| mapping.contains(base)) {
            mapping.protection = protection;
        }
        Ok(())
    }
}
