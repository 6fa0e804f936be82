//! Host/device migration of shared allocations.
//!
//! With recoverable page faults enabled, shared allocations used by a
//! submission are migrated to the GPU domain ahead of time instead of
//! faulting on first touch.

pub mod prefetch;

pub use prefetch::{PrefetchContext, PrefetchCoordinator};
