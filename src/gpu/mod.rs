//! External collaborators of the allocation manager.
//!
//! [`traits`] defines the interfaces the manager consumes: the backing
//! allocator, the free-memory query, submission contexts and the page-fault
//! handler. [`dummy`] is an in-memory implementation of all of them used by
//! the tests and benchmarks.

pub mod traits;
pub use traits::{
    BackingAllocator, BackingError, BackingFlags, BackingHandle, BackingId, BackingKind,
    MemoryInfo, PageFaultHandler, SubmissionContext,
};

// Dummy backend for testing (always available)
pub mod dummy;
pub use dummy::{DummyBackend, DummyContext, Migration};
