//! Interfaces to the collaborators around the allocation manager.
//!
//! The manager depends on these traits only: a backing allocator that hands
//! out graphics memory, a free-memory query, the submission contexts that
//! consume residency, and the page-fault handler that migrates shared memory.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::api::kind::MemoryKind;
use crate::api::types::{ContextId, DeviceIndex, TaskCount, UsmPtr};

/// Errors reported by a backing allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackingError {
    /// The memory domain is exhausted.
    #[error("backing memory exhausted")]
    OutOfMemory,
    /// Zero or unrepresentable size.
    #[error("invalid backing size")]
    InvalidSize,
    /// Alignment is not a power of two or cannot be honoured.
    #[error("alignment requirements not met")]
    InvalidAlignment,
    /// Backend-specific error (opaque).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Where a backing lives and how it is used.
///
/// Only the allocation site branches on this; everything downstream treats
/// handles uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    /// Host memory mapped for a device.
    HostUnified,
    /// Device-local memory.
    DeviceLocal,
    /// GPU storage of a shared migratable allocation.
    SharedGpu,
    /// Backing of a sub-allocation pool.
    PoolStorage,
}

impl BackingKind {
    /// Whether the backing lives in host memory.
    pub fn is_host(self) -> bool {
        matches!(self, BackingKind::HostUnified)
    }

    /// Memory kind a dedicated backing of this kind was allocated for.
    /// `None` for pool storage.
    pub fn memory_kind(self) -> Option<MemoryKind> {
        match self {
            BackingKind::HostUnified => Some(MemoryKind::HostVisible),
            BackingKind::DeviceLocal => Some(MemoryKind::DeviceOnly),
            BackingKind::SharedGpu => Some(MemoryKind::SharedMigratable),
            BackingKind::PoolStorage => None,
        }
    }
}

/// Extra properties passed with a device backing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingFlags {
    pub kind: BackingKind,
    pub read_only: bool,
    pub coherent: bool,
    pub shareable: bool,
    /// The same logical allocation is backed on more than one device.
    pub multi_storage: bool,
}

impl BackingFlags {
    /// Flags with only the kind set.
    pub const fn of(kind: BackingKind) -> Self {
        Self {
            kind,
            read_only: false,
            coherent: false,
            shareable: false,
            multi_storage: false,
        }
    }
}

/// Opaque identifier of a backing, used for residency submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackingId(pub u64);

/// An exclusively owned graphics allocation.
///
/// Not `Clone`: the holder is the single owner and must hand the value back
/// to [`BackingAllocator::release_memory`].
#[derive(PartialEq, Eq)]
pub struct BackingHandle {
    id: BackingId,
    address: UsmPtr,
    size: usize,
    kind: BackingKind,
    device: Option<DeviceIndex>,
}

impl BackingHandle {
    /// Create a handle. Called by backend implementations.
    pub fn new(
        id: BackingId,
        address: UsmPtr,
        size: usize,
        kind: BackingKind,
        device: Option<DeviceIndex>,
    ) -> Self {
        Self {
            id,
            address,
            size,
            kind,
            device,
        }
    }

    pub fn id(&self) -> BackingId {
        self.id
    }

    /// First byte of the backing.
    pub fn address(&self) -> UsmPtr {
        self.address
    }

    /// Underlying size, which may exceed the requested size.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> BackingKind {
        self.kind
    }

    /// Device the backing was created for; `None` for pure host memory.
    pub fn device(&self) -> Option<DeviceIndex> {
        self.device
    }
}

impl fmt::Debug for BackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingHandle")
            .field("id", &self.id.0)
            .field("address", &self.address)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("device", &self.device)
            .finish()
    }
}

/// Platform allocator for graphics memory.
///
/// Failure is always an `Err`; a successful handle is never a placeholder.
pub trait BackingAllocator: Send + Sync {
    /// Allocate memory placed for `device`.
    fn allocate_device_memory(
        &self,
        device: DeviceIndex,
        size: usize,
        alignment: usize,
        flags: BackingFlags,
    ) -> Result<BackingHandle, BackingError>;

    /// Allocate plain host memory.
    fn allocate_host_memory(&self, size: usize, alignment: usize) -> Result<BackingHandle, BackingError>;

    /// Release a backing.
    fn release_memory(&self, handle: BackingHandle);
}

/// Free-memory query used by the pool budget gate.
pub trait MemoryInfo: Send + Sync {
    /// Bytes currently free on `device`.
    fn query_free_device_memory(&self, device: DeviceIndex) -> u64;
}

/// A submission context (command stream receiver) that consumes residency
/// and reports GPU progress.
pub trait SubmissionContext: Send + Sync {
    fn id(&self) -> ContextId;

    /// Device this context submits to.
    fn device(&self) -> DeviceIndex;

    /// Last task count handed to the GPU.
    fn current_task_count(&self) -> TaskCount;

    /// Whether the GPU has finished `task_count`.
    fn is_task_count_complete(&self, task_count: TaskCount) -> bool;

    /// Add backings to the resident set of the next submission.
    fn add_to_residency_set(&self, backings: &[BackingId]);

    /// Wait until `task_count` completes or `timeout` elapses.
    ///
    /// Returns whether the task count completed. The default polls
    /// [`is_task_count_complete`](Self::is_task_count_complete).
    fn wait_for_task_count(&self, task_count: TaskCount, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_task_count_complete(task_count) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}

/// Kernel-mode page-fault / migration handler.
pub trait PageFaultHandler: Send + Sync {
    /// Migrate one allocation's working set to `device`.
    fn move_to_gpu_domain(&self, ptr: UsmPtr, size: usize, device: DeviceIndex);

    /// Migrate every managed allocation in one call.
    fn move_all_managed_to_gpu_domain(&self, ptrs: &[UsmPtr]);
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU64, Ordering};

    struct SlowContext {
        completed: AtomicU64,
    }

    impl SubmissionContext for SlowContext {
        fn id(&self) -> ContextId {
            ContextId(0)
        }
        fn device(&self) -> DeviceIndex {
            DeviceIndex(0)
        }
        fn current_task_count(&self) -> TaskCount {
            10
        }
        fn is_task_count_complete(&self, task_count: TaskCount) -> bool {
            self.completed.load(Ordering::Relaxed) >= task_count
        }
        fn add_to_residency_set(&self, _backings: &[BackingId]) {}
    }

    #[test]
    fn test_default_wait_times_out() {
        let ctx = SlowContext {
            completed: AtomicU64::new(1),
        };
        assert!(ctx.wait_for_task_count(1, Duration::from_millis(1)));
        assert!(!ctx.wait_for_task_count(5, Duration::from_millis(2)));
    }

    #[test]
    fn test_host_kinds() {
        assert!(BackingKind::HostUnified.is_host());
        assert!(!BackingKind::SharedGpu.is_host());
        assert!(!BackingKind::DeviceLocal.is_host());
        assert!(!BackingKind::PoolStorage.is_host());
        assert_eq!(BackingKind::SharedGpu.memory_kind(), Some(MemoryKind::SharedMigratable));
        assert_eq!(BackingKind::PoolStorage.memory_kind(), None);
    }
}
