//! Size-classed pool sets.
//!
//! A [`PoolSetManager`] owns every pool of one memory kind on one device
//! (or the host). Requests are routed to the smallest size class that can
//! hold them. Small classes get a pool each at initialization and may grow;
//! large classes hold at most one pool, created lazily. Every new pool must
//! pass the free-memory budget gate.

use std::sync::Arc;

use crate::allocators::pool::Pool;
use crate::api::config::UsmConfig;
use crate::api::kind::{AllocationProperties, MemoryKind};
use crate::api::types::{DeviceIndex, PoolId, UsmPtr};
use crate::core::budget::{BudgetStatus, PoolBudget};
use crate::diagnostics::{Reporter, USM101, USM102, USM103, USM104, USM105};
use crate::gpu::traits::{
    BackingAllocator, BackingFlags, BackingHandle, BackingId, BackingKind, MemoryInfo,
};
use crate::util::layout::{align_size, is_aligned};
use crate::util::size::format_bytes;

/// A contiguous range of request sizes, `(min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Exclusive lower bound
    pub min: usize,
    /// Inclusive upper bound
    pub max: usize,
    /// Created at initialization and never fully trimmed
    pub eager: bool,
}

impl SizeClass {
    pub fn contains(&self, size: usize) -> bool {
        size > self.min && size <= self.max
    }
}

/// Build the size classes described by `config`.
pub fn size_classes(config: &UsmConfig) -> Vec<SizeClass> {
    let mut classes = Vec::new();
    let mut min = 0;
    for (&max, eager) in config
        .small_class_limits
        .iter()
        .map(|m| (m, true))
        .chain(config.large_class_limits.iter().map(|m| (m, false)))
    {
        classes.push(SizeClass { min, max, eager });
        min = max;
    }
    classes
}

/// Identifies a pool set: memory kind plus owning device, `None` for the
/// host set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolSetKey {
    pub kind: MemoryKind,
    pub device: Option<DeviceIndex>,
}

/// A sub-allocation carved from a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledAllocation {
    pub ptr: UsmPtr,
    pub pool: PoolId,
    pub offset: u64,
    pub size: usize,
    /// Backing of the pool, submitted for residency
    pub backing: BackingId,
}

/// All pools of one memory kind on one device, or on the host.
pub struct PoolSetManager {
    kind: MemoryKind,
    /// Device owning the pool backings; `None` for the host set
    device: Option<DeviceIndex>,
    /// Device whose free memory feeds the budget gate
    budget_device: DeviceIndex,
    budget: PoolBudget,
    classes: Vec<SizeClass>,
    /// Pools per class, parallel to `classes`
    pools: Vec<Vec<Pool>>,
    next_pool_id: u32,
    small_pool_size: usize,
    chunk_alignment: usize,
    max_pool_alignment: usize,
    max_poolable_size: usize,
    recycled: u64,
    allocator: Arc<dyn BackingAllocator>,
    memory_info: Arc<dyn MemoryInfo>,
    reporter: Reporter,
}

impl PoolSetManager {
    /// Create an empty pool set. Call [`initialize`](Self::initialize) to
    /// create the small pools.
    pub fn new(
        kind: MemoryKind,
        device: Option<DeviceIndex>,
        budget_device: DeviceIndex,
        config: &UsmConfig,
        allocator: Arc<dyn BackingAllocator>,
        memory_info: Arc<dyn MemoryInfo>,
        reporter: Reporter,
    ) -> Self {
        let classes = size_classes(config);
        let largest = classes.last().map_or(0, |c| c.max);
        Self {
            kind,
            device,
            budget_device,
            budget: PoolBudget::new(config.recycling_fraction(kind)),
            pools: classes.iter().map(|_| Vec::new()).collect(),
            classes,
            next_pool_id: 0,
            small_pool_size: config.small_pool_size,
            chunk_alignment: config.chunk_alignment,
            max_pool_alignment: config.max_pool_alignment,
            max_poolable_size: config.max_poolable_size.min(largest),
            recycled: 0,
            allocator,
            memory_info,
            reporter,
        }
    }

    /// Create one pool per small class, bypassing the budget gate.
    ///
    /// Returns the number of pools created. Classes that already have a
    /// pool are skipped.
    pub fn initialize(&mut self) -> usize {
        let mut created = 0;
        for idx in 0..self.classes.len() {
            if self.classes[idx].eager
                && self.pools[idx].is_empty()
                && self.create_pool(idx, self.small_pool_size).is_some()
            {
                created += 1;
            }
        }
        created
    }

    pub fn key(&self) -> PoolSetKey {
        PoolSetKey {
            kind: self.kind,
            device: self.device,
        }
    }

    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }

    /// Pools of the class at `idx`.
    pub fn pools_in_class(&self, idx: usize) -> &[Pool] {
        self.pools.get(idx).map(Vec::as_slice).unwrap_or_default()
    }

    /// Index of the smallest class holding `size`.
    pub fn class_for(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.contains(size))
    }

    /// Whether a request of `size` with `props` may be served by this set.
    pub fn can_be_pooled(&self, size: usize, props: &AllocationProperties) -> bool {
        if size == 0 || size > self.max_poolable_size {
            return false;
        }
        let alignment = props.alignment;
        if alignment != 0 && (!alignment.is_power_of_two() || alignment > self.max_pool_alignment) {
            return false;
        }
        if props.flags.forces_dedicated() || props.kind != self.kind {
            return false;
        }
        match self.device {
            Some(device) => props.single_device() == Some(device),
            None => !props.devices.is_empty(),
        }
    }

    /// Carve `size` bytes from an existing or new pool.
    ///
    /// `None` means the caller falls back to a dedicated allocation.
    pub fn create_unified_memory_allocation(
        &mut self,
        size: usize,
        props: &AllocationProperties,
    ) -> Option<PooledAllocation> {
        if !self.can_be_pooled(size, props) {
            return None;
        }
        let idx = self.class_for(size)?;

        for pool in self.pools[idx].iter_mut() {
            if let Some(offset) = pool.try_reserve(size, props.alignment) {
                return Some(Self::carved(pool, offset, size));
            }
        }

        // Large classes hold a single pool sized to the request.
        let class = self.classes[idx];
        let pool_size = if class.eager {
            self.small_pool_size
        } else if self.pools[idx].is_empty() {
            align_size(size, self.chunk_alignment)
        } else {
            return None;
        };

        if !self.fits_budget(pool_size) {
            return None;
        }
        let pool = self.create_pool(idx, pool_size)?;
        let offset = pool.try_reserve(size, props.alignment)?;
        Some(Self::carved(pool, offset, size))
    }

    /// Offer the backing of a dedicated allocation being freed as storage
    /// for a new large-class pool.
    ///
    /// On refusal the handle is handed back and the caller releases it.
    pub fn recycle(&mut self, backing: BackingHandle, size: usize) -> Result<PoolId, BackingHandle> {
        let idx = match self.class_for(size) {
            Some(idx) if !self.classes[idx].eager && self.pools[idx].is_empty() => idx,
            _ => return Err(backing),
        };
        if size > self.max_poolable_size
            || backing.kind().memory_kind() != Some(self.kind)
            || !is_aligned(backing.address().addr(), self.chunk_alignment as u64)
            || (self.device.is_some() && backing.device() != self.device)
            || !self.fits_budget(backing.size())
        {
            return Err(backing);
        }

        let id = self.next_id();
        let context = format!("{} {} bytes into {}", self.describe(), backing.size(), backing.address());
        self.pools[idx].push(Pool::new(id, backing, self.chunk_alignment));
        self.recycled += 1;
        self.reporter.report(&USM104, &context);
        Ok(id)
    }

    /// Release the pooled sub-allocation whose base is `ptr`.
    ///
    /// Returns `false` when `ptr` is not the base of a live sub-allocation,
    /// so the caller treats it as a dedicated allocation.
    pub fn free_svm_alloc(&mut self, ptr: UsmPtr) -> bool {
        let Some(pool) = self.pools.iter_mut().flatten().find(|p| p.is_in_pool(ptr)) else {
            return false;
        };
        let Some((offset, size)) = pool.chunk_containing(ptr) else {
            return false;
        };
        if pool.base().offset(offset) != ptr {
            return false;
        }
        match pool.release(offset, size) {
            Ok(()) => true,
            Err(err) => {
                self.reporter.report(&USM105, &err.to_string());
                false
            }
        }
    }

    /// Destroy empty pools. Small classes keep at least one pool.
    ///
    /// Returns the number of pools destroyed.
    pub fn trim(&mut self) -> usize {
        let mut released = Vec::new();
        for (class, pools) in self.classes.iter().zip(self.pools.iter_mut()) {
            let any_live = pools.iter().any(|p| !p.is_empty());
            let mut retained_empty = false;
            for pool in std::mem::take(pools) {
                if !pool.is_empty() {
                    pools.push(pool);
                } else if class.eager && !any_live && !retained_empty {
                    retained_empty = true;
                    pools.push(pool);
                } else {
                    released.push(pool.into_backing());
                }
            }
        }

        let count = released.len();
        for backing in released {
            self.allocator.release_memory(backing);
        }
        if count > 0 {
            self.reporter.report(&USM103, &format!("{} released {} pools", self.describe(), count));
        }
        count
    }

    /// Base of the live sub-allocation containing `ptr`.
    pub fn get_pooled_allocation_base_ptr(&self, ptr: UsmPtr) -> Option<UsmPtr> {
        let pool = self.pool_containing(ptr)?;
        let (offset, _) = pool.chunk_containing(ptr)?;
        Some(pool.base().offset(offset))
    }

    /// Requested size of the live sub-allocation containing `ptr`.
    pub fn get_pooled_allocation_size(&self, ptr: UsmPtr) -> Option<usize> {
        let pool = self.pool_containing(ptr)?;
        pool.chunk_containing(ptr).map(|(_, size)| size)
    }

    /// Whether `ptr` lies inside any pool's backing extent.
    pub fn is_in_pool(&self, ptr: UsmPtr) -> bool {
        self.pool_containing(ptr).is_some()
    }

    pub fn pool_containing(&self, ptr: UsmPtr) -> Option<&Pool> {
        self.pools.iter().flatten().find(|p| p.is_in_pool(ptr))
    }

    /// Combined size of every pool in the set.
    pub fn total_pool_size(&self) -> usize {
        self.pools.iter().flatten().map(Pool::total_size).sum()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.iter().map(Vec::len).sum()
    }

    /// Dedicated backings turned into pools so far.
    pub fn recycled_count(&self) -> u64 {
        self.recycled
    }

    /// Release every pool regardless of live sub-allocations.
    pub fn cleanup(&mut self) {
        for pools in self.pools.iter_mut() {
            for pool in pools.drain(..) {
                self.allocator.release_memory(pool.into_backing());
            }
        }
    }

    fn carved(pool: &Pool, offset: u64, size: usize) -> PooledAllocation {
        PooledAllocation {
            ptr: pool.base().offset(offset),
            pool: pool.id(),
            offset,
            size,
            backing: pool.backing_id(),
        }
    }

    fn fits_budget(&self, pool_size: usize) -> bool {
        let free = self.memory_info.query_free_device_memory(self.budget_device);
        match self.budget.check(self.total_pool_size(), pool_size, free) {
            BudgetStatus::Ok => true,
            BudgetStatus::Exceeded => {
                self.reporter.report(
                    &USM102,
                    &format!(
                        "{}: {} requested, {} pooled, limit {}",
                        self.describe(),
                        format_bytes(pool_size),
                        format_bytes(self.total_pool_size()),
                        format_bytes(self.budget.limit(free) as usize),
                    ),
                );
                false
            }
        }
    }

    fn create_pool(&mut self, idx: usize, size: usize) -> Option<&mut Pool> {
        let backing = match self.device {
            None => self.allocator.allocate_host_memory(size, self.max_pool_alignment),
            Some(device) => self.allocator.allocate_device_memory(
                device,
                size,
                self.max_pool_alignment,
                BackingFlags::of(BackingKind::PoolStorage),
            ),
        }
        .ok()?;

        let id = self.next_id();
        self.reporter.report(
            &USM101,
            &format!("{} class {} pool {} of {}", self.describe(), idx, id.0, format_bytes(backing.size())),
        );
        self.pools[idx].push(Pool::new(id, backing, self.chunk_alignment));
        self.pools[idx].last_mut()
    }

    fn next_id(&mut self) -> PoolId {
        let id = PoolId(self.next_pool_id);
        self.next_pool_id += 1;
        id
    }

    fn describe(&self) -> String {
        match self.device {
            Some(device) => format!("{} pools on {}", self.kind.name(), device),
            None => format!("{} pools", self.kind.name()),
        }
    }
}

impl std::fmt::Debug for PoolSetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSetManager")
            .field("kind", &self.kind)
            .field("device", &self.device)
            .field("pools", &self.pool_count())
            .field("total_pool_size", &self.total_pool_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::kind::AllocationFlags;
    use crate::gpu::dummy::DummyBackend;
    use crate::util::size::{gb, kb, mb};

    const DEV: DeviceIndex = DeviceIndex(0);

    fn device_set(free: u64) -> (Arc<DummyBackend>, PoolSetManager) {
        let backend = Arc::new(DummyBackend::with_free_memory(free));
        let set = PoolSetManager::new(
            MemoryKind::DeviceOnly,
            Some(DEV),
            DEV,
            &UsmConfig::default(),
            backend.clone(),
            backend.clone(),
            Reporter::default(),
        );
        (backend, set)
    }

    #[test]
    fn test_default_size_classes() {
        let classes = size_classes(&UsmConfig::default());
        assert_eq!(classes.len(), 6);
        assert_eq!(classes.iter().filter(|c| c.eager).count(), 3);

        let (_, set) = device_set(gb(16) as u64);
        assert_eq!(set.class_for(1), Some(0));
        assert_eq!(set.class_for(kb(4)), Some(0));
        assert_eq!(set.class_for(kb(4) + 1), Some(1));
        assert_eq!(set.class_for(mb(2)), Some(2));
        assert_eq!(set.class_for(mb(3)), Some(3));
        assert_eq!(set.class_for(mb(256)), Some(5));
        assert_eq!(set.class_for(mb(256) + 1), None);
    }

    #[test]
    fn test_can_be_pooled() {
        let (_, set) = device_set(gb(16) as u64);
        let props = AllocationProperties::device(DEV);

        assert!(set.can_be_pooled(kb(4), &props));
        assert!(set.can_be_pooled(kb(4), &props.clone().with_alignment(64)));
        assert!(set.can_be_pooled(kb(4), &props.clone().with_alignment(mb(2))));
        assert!(!set.can_be_pooled(kb(4), &props.clone().with_alignment(mb(4))));
        assert!(!set.can_be_pooled(kb(4), &props.clone().with_alignment(768)));
        assert!(!set.can_be_pooled(0, &props));
        assert!(!set.can_be_pooled(mb(257), &props));

        let dedicated = props.clone().with_flags(AllocationFlags {
            dedicated: true,
            ..Default::default()
        });
        assert!(!set.can_be_pooled(kb(4), &dedicated));
        assert!(!set.can_be_pooled(kb(4), &AllocationProperties::device(DeviceIndex(1))));
        assert!(!set.can_be_pooled(kb(4), &AllocationProperties::host([DEV])));
    }

    #[test]
    fn test_budget_gate_for_large_pools() {
        let props = AllocationProperties::device(DEV);

        let (_, mut set) = device_set(mb(100) as u64);
        assert!(set.create_unified_memory_allocation(mb(7), &props).is_some());
        assert_eq!(set.pools_in_class(3).len(), 1);

        let (backend, mut set) = device_set(mb(100) as u64);
        assert!(set.create_unified_memory_allocation(mb(9), &props).is_none());
        assert_eq!(set.pool_count(), 0);
        assert_eq!(backend.live_backings(), 0);
    }

    #[test]
    fn test_small_class_routing_and_growth() {
        let (_, mut set) = device_set(gb(16) as u64);
        assert_eq!(set.initialize(), 3);
        assert_eq!(set.initialize(), 0);

        let props = AllocationProperties::device(DEV);
        let a = set.create_unified_memory_allocation(kb(4), &props).unwrap();
        let b = set.create_unified_memory_allocation(kb(8), &props).unwrap();
        assert_eq!(a.pool, set.pools_in_class(0)[0].id());
        assert_eq!(b.pool, set.pools_in_class(1)[0].id());

        // Two 1 MB chunks fill the 2 MB pool; the third grows the class.
        let c = set.create_unified_memory_allocation(mb(1), &props).unwrap();
        let d = set.create_unified_memory_allocation(mb(1), &props).unwrap();
        assert_eq!(c.pool, d.pool);
        let e = set.create_unified_memory_allocation(mb(1), &props).unwrap();
        assert_ne!(e.pool, c.pool);
        assert_eq!(set.pools_in_class(2).len(), 2);
    }

    #[test]
    fn test_large_class_holds_one_pool() {
        let (_, mut set) = device_set(gb(16) as u64);
        let props = AllocationProperties::device(DEV);

        let first = set.create_unified_memory_allocation(mb(3), &props).unwrap();
        assert!(set.create_unified_memory_allocation(mb(3), &props).is_none());
        assert!(set.free_svm_alloc(first.ptr));

        let again = set.create_unified_memory_allocation(mb(3), &props).unwrap();
        assert_eq!(again.pool, first.pool);
    }

    #[test]
    fn test_pooled_lookups() {
        let (_, mut set) = device_set(gb(16) as u64);
        set.initialize();
        let props = AllocationProperties::device(DEV);
        let a = set.create_unified_memory_allocation(kb(8), &props).unwrap();

        let interior = a.ptr.offset(100);
        assert_eq!(set.get_pooled_allocation_base_ptr(interior), Some(a.ptr));
        assert_eq!(set.get_pooled_allocation_size(interior), Some(kb(8)));
        assert!(set.is_in_pool(interior));

        // Inside the pool extent but past every live chunk.
        let past = a.ptr.offset(kb(16) as u64);
        assert!(set.is_in_pool(past));
        assert_eq!(set.get_pooled_allocation_base_ptr(past), None);
        assert_eq!(set.get_pooled_allocation_size(past), None);

        assert!(!set.free_svm_alloc(interior));
        assert!(set.free_svm_alloc(a.ptr));
        assert!(!set.free_svm_alloc(a.ptr));
        assert_eq!(set.get_pooled_allocation_base_ptr(a.ptr), None);
    }

    #[test]
    fn test_trim_keeps_small_pools() {
        let (backend, mut set) = device_set(gb(16) as u64);
        set.initialize();
        let props = AllocationProperties::device(DEV);

        let big = set.create_unified_memory_allocation(mb(3), &props).unwrap();
        let grown: Vec<_> = (0..3)
            .map(|_| set.create_unified_memory_allocation(mb(1), &props).unwrap())
            .collect();
        assert_eq!(set.pool_count(), 5);

        // Nothing is empty except classes 0 and 1, which are kept.
        assert_eq!(set.trim(), 0);

        assert!(set.free_svm_alloc(big.ptr));
        for alloc in &grown {
            assert!(set.free_svm_alloc(alloc.ptr));
        }
        assert_eq!(set.trim(), 2);
        assert_eq!(set.pool_count(), 3);
        for idx in 0..3 {
            assert_eq!(set.pools_in_class(idx).len(), 1);
        }
        assert_eq!(backend.live_backings(), 3);
    }

    #[test]
    fn test_recycle() {
        let (backend, mut set) = device_set(gb(16) as u64);
        let flags = BackingFlags::of(BackingKind::DeviceLocal);

        let handle = backend.allocate_device_memory(DEV, mb(3), 0, flags).unwrap();
        let base = handle.address();
        let pool = set.recycle(handle, mb(3)).unwrap();
        assert_eq!(set.recycled_count(), 1);

        // The class is now occupied.
        let other = backend.allocate_device_memory(DEV, mb(3), 0, flags).unwrap();
        let other = set.recycle(other, mb(3)).unwrap_err();
        backend.release_memory(other);

        // Small sizes are never recycled.
        let small = backend.allocate_device_memory(DEV, kb(8), 0, flags).unwrap();
        let small = set.recycle(small, kb(8)).unwrap_err();
        backend.release_memory(small);

        let props = AllocationProperties::device(DEV);
        let reused = set.create_unified_memory_allocation(mb(3), &props).unwrap();
        assert_eq!(reused.pool, pool);
        assert_eq!(reused.ptr, base);
    }

    #[test]
    fn test_recycle_rejects_foreign_kind() {
        let (backend, mut set) = device_set(gb(16) as u64);
        for kind in [BackingKind::SharedGpu, BackingKind::HostUnified, BackingKind::PoolStorage] {
            let handle = backend
                .allocate_device_memory(DEV, mb(3), 0, BackingFlags::of(kind))
                .unwrap();
            let handle = set.recycle(handle, mb(3)).unwrap_err();
            backend.release_memory(handle);
        }
        assert_eq!(set.pool_count(), 0);
        assert_eq!(set.recycled_count(), 0);
        assert_eq!(backend.live_backings(), 0);
    }

    #[test]
    fn test_recycle_respects_budget() {
        let (backend, mut set) = device_set(mb(100) as u64);
        let handle = backend
            .allocate_device_memory(DEV, mb(9), 0, BackingFlags::of(BackingKind::DeviceLocal))
            .unwrap();
        let handle = set.recycle(handle, mb(9)).unwrap_err();
        backend.release_memory(handle);
        assert_eq!(set.pool_count(), 0);
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let (backend, mut set) = device_set(gb(16) as u64);
        set.initialize();
        let props = AllocationProperties::device(DEV);
        set.create_unified_memory_allocation(mb(3), &props).unwrap();

        set.cleanup();
        assert_eq!(set.pool_count(), 0);
        assert_eq!(backend.live_backings(), 0);
    }
}
