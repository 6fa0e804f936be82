//! Memory kinds and allocation properties.

use std::collections::BTreeSet;

use crate::api::types::DeviceIndex;

/// The semantic type of a unified allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryKind {
    /// Host memory visible to every device in the set.
    HostVisible,
    /// Device-local memory, not CPU accessible.
    DeviceOnly,
    /// Memory that migrates between the host and device domains.
    SharedMigratable,
}

impl MemoryKind {
    /// All kinds, in a stable order.
    pub const ALL: [MemoryKind; 3] = [
        MemoryKind::HostVisible,
        MemoryKind::DeviceOnly,
        MemoryKind::SharedMigratable,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            MemoryKind::HostVisible => 0,
            MemoryKind::DeviceOnly => 1,
            MemoryKind::SharedMigratable => 2,
        }
    }

    /// Short name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::HostVisible => "host",
            MemoryKind::DeviceOnly => "device",
            MemoryKind::SharedMigratable => "shared",
        }
    }
}

/// Flags that shape the backing of an allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationFlags {
    /// Force a dedicated backing, never a pool sub-allocation.
    pub dedicated: bool,
    /// The allocation may be exported to another process; implies dedicated.
    pub shareable: bool,
    /// Device writes are not expected.
    pub read_only: bool,
    /// Request a cache-coherent backing.
    pub coherent: bool,
    /// Do not treat this allocation as an indirect-access candidate.
    pub exclude_from_indirect_residency: bool,
}

impl AllocationFlags {
    /// Whether the flags rule out a pool sub-allocation.
    pub fn forces_dedicated(&self) -> bool {
        self.dedicated || self.shareable
    }
}

/// Everything the manager needs to place an allocation besides its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationProperties {
    pub kind: MemoryKind,
    /// Requested alignment in bytes; `0` means no requirement.
    pub alignment: usize,
    /// Devices that receive a backing.
    pub devices: BTreeSet<DeviceIndex>,
    pub flags: AllocationFlags,
}

impl AllocationProperties {
    /// Properties for `kind` on a set of devices.
    pub fn new(kind: MemoryKind, devices: impl IntoIterator<Item = DeviceIndex>) -> Self {
        Self {
            kind,
            alignment: 0,
            devices: devices.into_iter().collect(),
            flags: AllocationFlags::default(),
        }
    }

    /// Host-visible memory on the given devices.
    pub fn host(devices: impl IntoIterator<Item = DeviceIndex>) -> Self {
        Self::new(MemoryKind::HostVisible, devices)
    }

    /// Device-only memory on one device.
    pub fn device(device: DeviceIndex) -> Self {
        Self::new(MemoryKind::DeviceOnly, [device])
    }

    /// Shared migratable memory on the given devices.
    pub fn shared(devices: impl IntoIterator<Item = DeviceIndex>) -> Self {
        Self::new(MemoryKind::SharedMigratable, devices)
    }

    /// Builder pattern: set alignment.
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Builder pattern: set flags.
    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The single device of a one-device request.
    pub fn single_device(&self) -> Option<DeviceIndex> {
        if self.devices.len() == 1 {
            self.devices.iter().next().copied()
        } else {
            None
        }
    }
}
