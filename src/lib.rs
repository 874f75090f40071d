//! Runtime memory manager for a method-hooking engine.
//!
//! Hooking a function rewrites its first instructions with a jump into
//! generated code. On x86-64 the short encodings only reach targets within a
//! signed 32-bit displacement, so the memory holding trampolines and pointer
//! slots has to live close to the hooked code. This crate manages that
//! memory: it maps regions near a requested address, scavenges executable
//! padding inside loaded images when mapping fails, and sub-allocates three
//! kinds of objects out of the regions it owns.
//!
//! +----------------------------------------------------------+
//! | MethodAllocator                                          |
//! |                                                          |
//! |  indirects   pointer slots     (bitmap over a region)    |
//! |  routines    code buffers      (first-fit within region) |
//! |  chains      linked raw nodes  (slot scan within region) |
//! |                                                          |
//! |  RegionAllocator <- owns every OS mapping and cave       |
//! +----------------------------------------------------------+
//!
//! Handles release their storage on drop; the backing regions stay mapped
//! and registered until [`MethodAllocator::dispose`] unmaps everything at
//! once.

pub mod allocator;
pub mod cave;
pub mod error;
pub mod indirect;
pub mod linked;
pub mod proximity;
pub mod region;
pub mod routine;
pub mod services;
mod util;

#[cfg(test)]
pub(crate) mod testkit;

pub use allocator::MethodAllocator;
pub use error::{Error, Result};
pub use indirect::Indirect;
pub use linked::{LinkedArray, NodeId};
pub use routine::{FixedRoutine, Routine};
pub use services::{MemoryServices, OsMemory, Protection, RegionInfo, RegionKind};
