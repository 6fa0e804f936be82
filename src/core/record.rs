//! Allocation records and their residency state.

use std::collections::{BTreeMap, BTreeSet};

use crate::allocators::pool_set::PoolSetKey;
use crate::api::kind::{AllocationFlags, MemoryKind};
use crate::api::types::{ContextId, DeviceIndex, PoolId, TaskCount, UsmPtr};
use crate::gpu::traits::{BackingHandle, BackingId};

/// Residency of an allocation for one (device, context) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidencyState {
    #[default]
    NeverResident,
    /// Submitted for a task that may not have completed yet.
    PendingResident,
    /// Part of the context's permanent resident set.
    AlwaysResident,
}

/// Residency state plus the task count at which it was last asserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Residency {
    pub state: ResidencyState,
    pub task_count: TaskCount,
}

/// Where a pooled record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMembership {
    pub set: PoolSetKey,
    pub pool: PoolId,
    pub offset: u64,
    pub chunk_size: usize,
    /// Backing of the pool
    pub backing: BackingId,
}

/// A task count a context must reach before the memory can be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaskWait {
    pub context: ContextId,
    pub task_count: TaskCount,
}

/// Storage behind a record: a pool chunk or dedicated backings.
#[derive(Debug)]
pub enum RecordStorage {
    Pooled(PoolMembership),
    Dedicated {
        per_device: BTreeMap<DeviceIndex, BackingHandle>,
        cpu: Option<BackingHandle>,
    },
}

/// One logical allocation.
#[derive(Debug)]
pub struct AllocationRecord {
    pub base: UsmPtr,
    /// Requested size
    pub size: usize,
    pub kind: MemoryKind,
    pub alignment: usize,
    pub devices: BTreeSet<DeviceIndex>,
    pub flags: AllocationFlags,
    pub storage: RecordStorage,
    pub residency: BTreeMap<(DeviceIndex, ContextId), Residency>,
    /// Set once a free was requested but GPU work is outstanding
    pub pending_free: Option<Vec<TaskWait>>,
    /// Monotonic id assigned at creation
    pub object_id: u64,
}

impl AllocationRecord {
    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.base.addr() + self.size as u64
    }

    pub fn contains(&self, ptr: UsmPtr) -> bool {
        ptr >= self.base && ptr.addr() < self.end()
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.storage, RecordStorage::Pooled(_))
    }

    pub fn pool_membership(&self) -> Option<&PoolMembership> {
        match &self.storage {
            RecordStorage::Pooled(membership) => Some(membership),
            RecordStorage::Dedicated { .. } => None,
        }
    }

    /// Whether the allocation takes part in indirect-access residency.
    pub fn is_indirect_candidate(&self) -> bool {
        !self.flags.exclude_from_indirect_residency
    }

    /// Backings a context on `device` must see. Empty if the allocation
    /// has nothing on that device.
    pub fn backings_for(&self, device: DeviceIndex) -> Vec<BackingId> {
        if !self.devices.contains(&device) {
            return Vec::new();
        }
        match &self.storage {
            RecordStorage::Pooled(membership) => vec![membership.backing],
            RecordStorage::Dedicated { per_device, .. } => {
                per_device.get(&device).map(|h| vec![h.id()]).unwrap_or_default()
            }
        }
    }

    pub fn residency(&self, device: DeviceIndex, context: ContextId) -> Residency {
        self.residency.get(&(device, context)).copied().unwrap_or_default()
    }

    /// Mark `(device, context)` as submitted at `task_count`.
    ///
    /// An always-resident entry keeps its state; only the task count moves.
    pub fn mark_pending_resident(&mut self, device: DeviceIndex, context: ContextId, task_count: TaskCount) {
        let entry = self.residency.entry((device, context)).or_default();
        if entry.state != ResidencyState::AlwaysResident {
            entry.state = ResidencyState::PendingResident;
        }
        entry.task_count = entry.task_count.max(task_count);
    }

    pub fn mark_always_resident(&mut self, device: DeviceIndex, context: ContextId, task_count: TaskCount) {
        let entry = self.residency.entry((device, context)).or_default();
        entry.state = ResidencyState::AlwaysResident;
        entry.task_count = entry.task_count.max(task_count);
    }

    /// Drop `(device, context)` back to never resident. The task count is
    /// kept so a later free still waits for it.
    pub fn evict(&mut self, device: DeviceIndex, context: ContextId) {
        if let Some(entry) = self.residency.get_mut(&(device, context)) {
            entry.state = ResidencyState::NeverResident;
        }
    }

    /// Task counts recorded by residency submissions, one per context.
    pub fn residency_waits(&self) -> Vec<TaskWait> {
        let mut waits: BTreeMap<ContextId, TaskCount> = BTreeMap::new();
        for (&(_, context), residency) in &self.residency {
            if residency.task_count > 0 {
                let slot = waits.entry(context).or_default();
                *slot = (*slot).max(residency.task_count);
            }
        }
        waits
            .into_iter()
            .map(|(context, task_count)| TaskWait { context, task_count })
            .collect()
    }

    /// A cloneable view of the record.
    pub fn info(&self) -> AllocationInfo {
        let (pool, device_backings, cpu_backing) = match &self.storage {
            RecordStorage::Pooled(membership) => (Some(*membership), BTreeMap::new(), None),
            RecordStorage::Dedicated { per_device, cpu } => (
                None,
                per_device.iter().map(|(d, h)| (*d, h.id())).collect(),
                cpu.as_ref().map(BackingHandle::id),
            ),
        };
        AllocationInfo {
            base: self.base,
            size: self.size,
            kind: self.kind,
            alignment: self.alignment,
            devices: self.devices.clone(),
            flags: self.flags,
            pool,
            device_backings,
            cpu_backing,
            cpu_address: match &self.storage {
                RecordStorage::Dedicated { cpu: Some(cpu), .. } => Some(cpu.address()),
                _ => None,
            },
            residency: self.residency.clone(),
            pending_free: self.pending_free.is_some(),
            object_id: self.object_id,
        }
    }
}

/// Snapshot of an [`AllocationRecord`] returned by lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationInfo {
    pub base: UsmPtr,
    pub size: usize,
    pub kind: MemoryKind,
    pub alignment: usize,
    pub devices: BTreeSet<DeviceIndex>,
    pub flags: AllocationFlags,
    /// Present iff served from a pool
    pub pool: Option<PoolMembership>,
    /// Dedicated backing per device; empty for pooled allocations
    pub device_backings: BTreeMap<DeviceIndex, BackingId>,
    pub cpu_backing: Option<BackingId>,
    pub cpu_address: Option<UsmPtr>,
    pub residency: BTreeMap<(DeviceIndex, ContextId), Residency>,
    pub pending_free: bool,
    pub object_id: u64,
}

impl AllocationInfo {
    pub fn residency(&self, device: DeviceIndex, context: ContextId) -> Residency {
        self.residency.get(&(device, context)).copied().unwrap_or_default()
    }
}
