//! Error types surfaced by the allocation manager.

use thiserror::Error;

use crate::api::types::{TaskCount, UsmPtr};
use crate::gpu::traits::BackingError;

/// Errors returned to callers of [`AllocationManager`](crate::AllocationManager).
///
/// Pool exhaustion is deliberately absent: it is recovered by falling back
/// to a dedicated allocation and never reaches the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsmError {
    /// Bad size, unknown pointer, or misaligned request.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A host-side backing could not be allocated.
    #[error("out of host memory")]
    OutOfHostMemory,

    /// A device-side backing could not be allocated.
    #[error("out of device memory")]
    OutOfDeviceMemory,

    /// The base pointer was already freed.
    #[error("allocation at {0} was already freed")]
    AlreadyFreed(UsmPtr),

    /// A blocking free gave up before the GPU finished with the allocation.
    /// The allocation stays pending and the free may be retried.
    #[error("timed out waiting for task count {task_count} before freeing {ptr}")]
    WaitTimedOut { ptr: UsmPtr, task_count: TaskCount },

    /// The backing allocator returned memory overlapping a live allocation.
    /// The new backing was released and nothing was registered.
    #[error("backing at {0} overlaps a live allocation")]
    OverlappingBacking(UsmPtr),

    /// `ensure_initialized` has not been called.
    #[error("allocation manager is not initialized")]
    NotInitialized,
}

impl UsmError {
    /// Map a backend failure for a host backing.
    pub(crate) fn from_host_backing(_err: BackingError) -> Self {
        UsmError::OutOfHostMemory
    }

    /// Map a backend failure for a device backing.
    pub(crate) fn from_device_backing(_err: BackingError) -> Self {
        UsmError::OutOfDeviceMemory
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, UsmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = UsmError::AlreadyFreed(UsmPtr::new(0x1000));
        assert_eq!(err.to_string(), "allocation at 0x1000 was already freed");

        let err = UsmError::WaitTimedOut {
            ptr: UsmPtr::new(0x2000),
            task_count: 7,
        };
        assert!(err.to_string().contains("task count 7"));
    }

    #[test]
    fn test_backing_failure_mapping() {
        assert_eq!(
            UsmError::from_device_backing(BackingError::OutOfMemory),
            UsmError::OutOfDeviceMemory
        );
        assert_eq!(
            UsmError::from_host_backing(BackingError::OutOfMemory),
            UsmError::OutOfHostMemory
        );
    }
}
