//! Identifier and address newtypes.

use std::fmt;

/// A unified shared-memory address.
///
/// The same value is meaningful on the host and on every device that holds
/// a backing for the allocation. There is no null `UsmPtr`; absence is
/// expressed with `Option<UsmPtr>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UsmPtr(u64);

impl UsmPtr {
    /// Wrap a raw address.
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// The raw address.
    pub const fn addr(self) -> u64 {
        self.0
    }

    /// Pointer `bytes` past this one.
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Pointer `bytes` before this one, or `None` on underflow.
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }

    /// Distance in bytes from `base` to this pointer.
    pub const fn distance_from(self, base: UsmPtr) -> u64 {
        self.0 - base.0
    }
}

impl fmt::Debug for UsmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UsmPtr({:#x})", self.0)
    }
}

impl fmt::Display for UsmPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of a root device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceIndex(pub u32);

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device{}", self.0)
    }
}

/// Identifier of a submission context (command queue / command stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub u32);

/// Identifier of a pool inside one pool set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(pub u32);

/// Monotonic per-context submission sequence number.
pub type TaskCount = u64;
