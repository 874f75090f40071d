//! The method allocator facade.
//!
//! Single entry point composing the four subsystems: region allocation,
//! cave scavenging (inside the indirect path), routine placement and linked
//! node chains. The hook-installation layer constructs one of these per
//! process and asks it for indirect slots, routine buffers and linked value
//! chains, optionally near a target address.
//!
//! The allocator is an explicitly constructed instance with owner-controlled
//! lifetime; pass it by reference to whatever installs hooks. Disposal
//! releases every OS-backed region this instance ever mapped, so it must
//! happen after outstanding handles are released.

use std::sync::Arc;

use crate::error::Result;
use crate::indirect::{Indirect, IndirectAllocator};
use crate::linked::{EMPTY_NODE_VALUE, LinkedArray, NodeAllocator};
use crate::region::RegionAllocator;
use crate::routine::{FixedRoutine, Routine, RoutineAllocator};
use crate::services::{MemoryServices, OsMemory};

/// Process-memory manager for a method-hooking engine.
pub struct MethodAllocator {
    region_allocator: Arc<RegionAllocator>,
    indirects: IndirectAllocator,
    routines: RoutineAllocator,
    nodes: Arc<NodeAllocator>,
}

impl MethodAllocator {
    /// Build an allocator on top of arbitrary memory services. Tests use a
    /// simulated backend; production uses [`MethodAllocator::with_os`].
    pub fn new(services: Arc<dyn MemoryServices>) -> Self {
        let region_allocator = Arc::new(RegionAllocator::new(services));
        Self {
            indirects: IndirectAllocator::new(region_allocator.clone()),
            routines: RoutineAllocator::new(region_allocator.clone()),
            nodes: Arc::new(NodeAllocator::new(region_allocator.clone())),
            region_allocator,
        }
    }

    /// Build an allocator backed by the real OS memory services.
    pub fn with_os() -> Self {
        Self::new(Arc::new(OsMemory))
    }

    /// Reserve a pointer slot within displacement range of `near_to`,
    /// scavenging a cave when no near OS allocation is possible.
    pub fn create_indirect(&self, near_to: usize) -> Result<Indirect> {
        self.indirects.create_indirect(near_to)
    }

    /// Place a routine holding a copy of `bytes`.
    pub fn create_routine(&self, bytes: &[u8]) -> Result<Routine> {
        self.routines.create_routine(bytes)
    }

    /// Place a zeroed routine of `size` bytes for the caller to fill.
    pub fn create_routine_sized(&self, size: usize) -> Result<Routine> {
        self.routines.create_routine_sized(size)
    }

    /// Place a generously sized routine whose final size is fixed exactly
    /// once, after its content is written.
    pub fn create_fixed_routine(&self, initial_size: usize) -> Result<FixedRoutine> {
        self.routines.create_fixed_routine(initial_size)
    }

    /// Create a logically empty linked value chain.
    pub fn create_linked_array(&self) -> Result<LinkedArray> {
        self.create_linked_array_with(EMPTY_NODE_VALUE)
    }

    /// Create a linked value chain whose root holds `start_value`.
    pub fn create_linked_array_with(&self, start_value: usize) -> Result<LinkedArray> {
        self.nodes.create_array(start_value)
    }

    /// Release every OS-backed region this allocator ever mapped.
    /// Idempotent. All handles into those regions must be released first;
    /// their addresses are invalid afterwards.
    pub fn dispose(&self) {
        self.region_allocator.dispose();
    }
}
