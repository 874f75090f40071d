//! Error types for the allocator.
//!
//! Two failure kinds exist: *capacity exhaustion* (no free slot, offset or
//! cave could be found) and *invalid reuse* (operating on an already-released
//! or already-finalized handle). Both propagate immediately to the caller;
//! silently retrying a placement failure could hand out memory that violates
//! the proximity constraint. The one non-fatal signal in the crate is
//! [`RegionAllocator::allocate_near`] returning `Ok(None)`, which means
//! "not placeable near enough, try the next strategy".
//!
//! [`RegionAllocator::allocate_near`]: crate::region::RegionAllocator::allocate_near

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No free slot, offset or node is available and no further region can
    /// satisfy the request.
    #[error("capacity exhausted: {0}")]
    ExhaustedCapacity(&'static str),

    /// An operation was applied to a handle that is already released or
    /// already finalized (e.g. a second `fix_size`).
    #[error("invalid reuse: {0}")]
    InvalidReuse(&'static str),

    /// Both scan directions ran out of candidate regions before a usable
    /// cave was found. There is no way to place memory near this target.
    #[error("no free regions or caves near {target:#x}")]
    NoPlacement { target: usize },

    /// The operating system refused an allocation, query or protection
    /// change.
    #[error("memory services failure: {0}")]
    Os(#[from] std::io::Error),
}
