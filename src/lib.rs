//! # usmalloc
//!
//! Unified shared-memory allocation for GPU compute drivers.
//!
//! ## Features
//!
//! - Host, device and shared (migratable) allocations addressed by one
//!   pointer on the host and on every device
//! - Size-classed pools for small and medium requests, with a free-memory
//!   budget gate for large-class pools
//! - Interior-pointer lookup over every live allocation
//! - Per-device, per-context residency tracking
//! - Deferred release driven by GPU task-count completion
//! - Prefetch of shared allocations through a page-fault handler
//! - Coded diagnostics, optionally forwarded to `log`
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use usmalloc::{AllocationManager, AllocationProperties, DeviceIndex, DummyBackend, FreeMode, UsmConfig};
//!
//! let backend = Arc::new(DummyBackend::new());
//! let manager = AllocationManager::new(UsmConfig::default(), backend.clone(), backend).unwrap();
//! manager.ensure_initialized([DeviceIndex(0)]).unwrap();
//!
//! let ptr = manager
//!     .create_allocation(4096, &AllocationProperties::host([DeviceIndex(0)]))
//!     .unwrap();
//! assert!(manager.is_in_pool(ptr));
//! manager.free_allocation(ptr, FreeMode::Deferred).unwrap();
//! ```

pub mod allocators;
pub mod api;
pub mod coordinator;
pub mod core;
pub mod diagnostics;
pub mod gpu;
pub mod util;

mod sync;

// Re-export public API at crate root for convenience
pub use api::config::UsmConfig;
pub use api::error::{Result, UsmError};
pub use api::kind::{AllocationFlags, AllocationProperties, MemoryKind};
pub use api::manager::{AllocationManager, FreeMode};
pub use api::stats::UsmStats;
pub use api::types::{ContextId, DeviceIndex, PoolId, TaskCount, UsmPtr};

// Pools
pub use allocators::pool::{Pool, PoolError};
pub use allocators::pool_set::{PoolSetKey, PoolSetManager, PooledAllocation, SizeClass};

// Records and residency
pub use crate::core::budget::{BudgetStatus, PoolBudget};
pub use crate::core::record::{AllocationInfo, Residency, ResidencyState};
pub use crate::core::residency::RegisteredCsrEntry;

// Prefetch
pub use coordinator::{PrefetchContext, PrefetchCoordinator};

// External interfaces and the in-memory backend
pub use gpu::{
    BackingAllocator, BackingError, BackingFlags, BackingHandle, BackingId, BackingKind,
    DummyBackend, DummyContext, MemoryInfo, PageFaultHandler, SubmissionContext,
};

// Diagnostics
pub use diagnostics::{suppress_diagnostics, CollectingSink, Diagnostic, DiagnosticKind, DiagnosticSink};

// Size helpers
pub use util::size::{gb, kb, mb};
