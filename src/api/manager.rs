//! The allocation manager.
//!
//! [`AllocationManager`] owns the registry, the pool sets, the residency
//! tracker and the deferred-free queue of one driver instance. All of that
//! state sits behind a single `RwLock`; lookups take it shared, everything
//! that mutates takes it exclusive. The only call that blocks on the GPU is
//! a [`FreeMode::Blocking`] free, and it waits with the lock released.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::allocators::deferred::DeferredFreeQueue;
use crate::allocators::pool_set::{PoolSetKey, PoolSetManager};
use crate::api::config::UsmConfig;
use crate::api::error::{Result, UsmError};
use crate::api::kind::{AllocationProperties, MemoryKind};
use crate::api::stats::UsmStats;
use crate::api::types::{ContextId, DeviceIndex, TaskCount, UsmPtr};
use crate::core::record::{AllocationInfo, AllocationRecord, PoolMembership, RecordStorage, ResidencyState, TaskWait};
use crate::core::registry::AllocationRegistry;
use crate::core::residency::{RegisteredCsrEntry, ResidencyTracker};
use crate::diagnostics::{
    DiagnosticSink, Reporter, USM001, USM002, USM003, USM004, USM105, USM201, USM202, USM203,
    USM901, USM902,
};
use crate::gpu::traits::{BackingAllocator, BackingFlags, BackingHandle, BackingKind, MemoryInfo, SubmissionContext};
use crate::sync::counters::{Counter, Gauge};
use crate::sync::lock::RwLock;

/// How [`AllocationManager::free_allocation`] treats outstanding GPU work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeMode {
    /// Release now if the GPU is done, otherwise queue for
    /// [`reclaim_deferred`](AllocationManager::reclaim_deferred).
    Deferred,
    /// Wait up to `timeout` for the GPU, then release.
    Blocking { timeout: Duration },
}

/// Everything guarded by the manager lock.
struct ManagerState {
    initialized: bool,
    devices: BTreeSet<DeviceIndex>,
    registry: AllocationRegistry,
    pool_sets: BTreeMap<PoolSetKey, PoolSetManager>,
    tracker: ResidencyTracker,
    contexts: HashMap<ContextId, Arc<dyn SubmissionContext>>,
}

#[derive(Default)]
struct Counters {
    allocations: Counter,
    releases: Counter,
    residency_submissions: Counter,
    migrations: Counter,
    requested: Gauge,
}

/// Creates, tracks, pools, makes resident and frees unified allocations.
pub struct AllocationManager {
    config: UsmConfig,
    allocator: Arc<dyn BackingAllocator>,
    memory_info: Arc<dyn MemoryInfo>,
    state: RwLock<ManagerState>,
    deferred: DeferredFreeQueue,
    /// Source of record object ids; advanced under the write lock only
    object_ids: Counter,
    counters: Counters,
    reporter: Reporter,
}

impl AllocationManager {
    /// Create a manager. Nothing is allocated until
    /// [`ensure_initialized`](Self::ensure_initialized).
    pub fn new(
        config: UsmConfig,
        allocator: Arc<dyn BackingAllocator>,
        memory_info: Arc<dyn MemoryInfo>,
    ) -> Result<Self> {
        config.validate()?;
        let state = ManagerState {
            initialized: false,
            devices: BTreeSet::new(),
            registry: AllocationRegistry::new(config.freed_history_depth),
            pool_sets: BTreeMap::new(),
            tracker: ResidencyTracker::new(),
            contexts: HashMap::new(),
        };
        Ok(Self {
            config,
            allocator,
            memory_info,
            state: RwLock::new(state),
            deferred: DeferredFreeQueue::new(),
            object_ids: Counter::new(),
            counters: Counters::default(),
            reporter: Reporter::default(),
        })
    }

    /// Builder pattern: forward diagnostics to `sink` as well.
    ///
    /// Must be called before `ensure_initialized` for pool diagnostics to
    /// reach the sink.
    pub fn with_diagnostic_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.reporter = Reporter::with_sink(sink);
        self
    }

    pub fn config(&self) -> &UsmConfig {
        &self.config
    }

    /// Build the pool sets for `devices` and create their small pools.
    ///
    /// Idempotent; devices seen for the first time get their pool sets
    /// added. The host pool set is budgeted against the lowest device of the
    /// first call.
    pub fn ensure_initialized(&self, devices: impl IntoIterator<Item = DeviceIndex>) -> Result<()> {
        let devices: BTreeSet<DeviceIndex> = devices.into_iter().collect();
        let Some(&lowest) = devices.iter().next() else {
            return Err(UsmError::InvalidArgument("no devices to initialize"));
        };

        let mut state = self.state.write();
        let host_key = PoolSetKey {
            kind: MemoryKind::HostVisible,
            device: None,
        };
        if self.config.pooling_enabled(MemoryKind::HostVisible) && !state.pool_sets.contains_key(&host_key) {
            let mut set = self.new_pool_set(host_key, lowest);
            set.initialize();
            state.pool_sets.insert(host_key, set);
        }

        for &device in &devices {
            if !state.devices.insert(device) {
                continue;
            }
            for kind in [MemoryKind::DeviceOnly, MemoryKind::SharedMigratable] {
                if !self.config.pooling_enabled(kind) {
                    continue;
                }
                let key = PoolSetKey {
                    kind,
                    device: Some(device),
                };
                let mut set = self.new_pool_set(key, device);
                set.initialize();
                state.pool_sets.insert(key, set);
            }
        }
        state.initialized = true;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Devices known to the manager.
    pub fn devices(&self) -> BTreeSet<DeviceIndex> {
        self.state.read().devices.clone()
    }

    /// Release every allocation and pool and forget all contexts.
    ///
    /// Outstanding GPU work is not waited for. The manager can be
    /// initialized again afterwards.
    pub fn cleanup(&self) {
        let mut state = self.state.write();
        let records = state.registry.drain();
        let pending = records.iter().filter(|r| r.pending_free.is_some()).count();
        if pending > 0 {
            self.reporter.report(&USM902, &format!("{} pending", pending));
        }
        for record in records {
            self.counters.requested.sub(record.size);
            self.counters.releases.increment();
            self.release_storage(&mut state, record, false);
        }
        for set in state.pool_sets.values_mut() {
            set.cleanup();
        }
        state.pool_sets.clear();
        state.tracker.clear();
        state.contexts.clear();
        state.devices.clear();
        state.initialized = false;
        self.deferred.clear();
    }

    /// Create an allocation of `size` bytes.
    ///
    /// Poolable requests are carved from a pool; everything else, and any
    /// pool miss, gets a dedicated backing on every requested device.
    pub fn create_allocation(&self, size: usize, props: &AllocationProperties) -> Result<UsmPtr> {
        if size == 0 {
            self.reporter.report(&USM001, props.kind.name());
            return Err(UsmError::InvalidArgument("zero-size allocation"));
        }
        if props.devices.is_empty() {
            return Err(UsmError::InvalidArgument("allocation needs at least one device"));
        }
        if props.alignment != 0 && !props.alignment.is_power_of_two() {
            return Err(UsmError::InvalidArgument("alignment must be a power of two"));
        }

        let mut state = self.state.write();
        if !state.initialized {
            return Err(UsmError::NotInitialized);
        }
        if !props.devices.is_subset(&state.devices) {
            return Err(UsmError::InvalidArgument("device was not initialized"));
        }

        let pooled = pool_set_key(props).and_then(|key| {
            let set = state.pool_sets.get_mut(&key)?;
            let carved = set.create_unified_memory_allocation(size, props)?;
            Some((key, carved))
        });

        let (base, storage) = match pooled {
            Some((set, carved)) => (
                carved.ptr,
                RecordStorage::Pooled(PoolMembership {
                    set,
                    pool: carved.pool,
                    offset: carved.offset,
                    chunk_size: carved.size,
                    backing: carved.backing,
                }),
            ),
            None => self.allocate_dedicated(size, props)?,
        };

        let record = AllocationRecord {
            base,
            size,
            kind: props.kind,
            alignment: props.alignment,
            devices: props.devices.clone(),
            flags: props.flags,
            storage,
            residency: BTreeMap::new(),
            pending_free: None,
            object_id: self.object_ids.next(),
        };

        if let Err(record) = state.registry.insert(record) {
            self.reporter.report(&USM901, &base.to_string());
            self.release_storage(&mut state, record, false);
            return Err(UsmError::OverlappingBacking(base));
        }
        self.counters.allocations.increment();
        self.counters.requested.add(size);
        Ok(base)
    }

    /// Snapshot of the allocation containing `ptr`. Interior pointers,
    /// including ones inside pooled chunks, resolve to their allocation.
    pub fn get_record(&self, ptr: UsmPtr) -> Option<AllocationInfo> {
        self.state.read().registry.lookup(ptr).map(AllocationRecord::info)
    }

    /// Free the allocation containing `ptr`.
    ///
    /// Releases immediately when no recorded task count is outstanding.
    /// Otherwise `Deferred` marks the allocation pending and returns, and
    /// `Blocking` waits with the lock released. A timed-out blocking free
    /// leaves the allocation pending and may be retried.
    pub fn free_allocation(&self, ptr: UsmPtr, mode: FreeMode) -> Result<()> {
        let mut state = self.state.write();
        let (base, pending) = match state.registry.lookup(ptr) {
            Some(record) => (record.base, record.pending_free.clone()),
            None if state.registry.was_freed(ptr) => {
                self.reporter.report(&USM004, &ptr.to_string());
                return Err(UsmError::AlreadyFreed(ptr));
            }
            None => {
                self.reporter.report(&USM003, &ptr.to_string());
                return Err(UsmError::InvalidArgument("pointer is not a live allocation"));
            }
        };
        if pending.is_some() && mode == FreeMode::Deferred {
            self.reporter.report(&USM004, &base.to_string());
            return Err(UsmError::AlreadyFreed(base));
        }
        self.reclaim_locked(&mut state);

        let waits = match pending {
            Some(waits) => waits,
            None => collect_waits(&state, base),
        };
        let outstanding = outstanding_waits(&state, &waits);
        if outstanding.is_empty() {
            self.release_record(&mut state, base, true);
            return Ok(());
        }

        if let Some(record) = state.registry.get_mut(base) {
            if record.pending_free.is_none() {
                record.pending_free = Some(waits);
                self.deferred.push(base);
            }
        }

        let FreeMode::Blocking { timeout } = mode else {
            return Ok(());
        };
        drop(state);

        let deadline = Instant::now() + timeout;
        for (context, task_count) in outstanding {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !context.wait_for_task_count(task_count, remaining) {
                self.reporter.report(
                    &USM201,
                    &format!("{} waiting for task {} on context {}", base, task_count, context.id().0),
                );
                return Err(UsmError::WaitTimedOut { ptr: base, task_count });
            }
        }

        let mut state = self.state.write();
        let still_pending = state
            .registry
            .get(base)
            .is_some_and(|record| record.pending_free.is_some());
        if still_pending {
            self.release_record(&mut state, base, true);
        }
        Ok(())
    }

    /// Release every pending free whose task counts have completed.
    ///
    /// Returns the number of allocations released.
    pub fn reclaim_deferred(&self) -> usize {
        let mut state = self.state.write();
        self.reclaim_locked(&mut state)
    }

    /// Number of frees waiting for GPU completion.
    pub fn pending_free_count(&self) -> usize {
        self.state
            .read()
            .registry
            .iter()
            .filter(|record| record.pending_free.is_some())
            .count()
    }

    /// Make every indirect-access candidate resident for `context`.
    ///
    /// Allocations already always-resident for the context are skipped, and
    /// the whole call does no residency work when nothing was allocated
    /// since the context's last call. With `submit_as_pack` the set goes to
    /// the context in one call.
    pub fn make_internal_allocations_resident(&self, context: &Arc<dyn SubmissionContext>, task_count: TaskCount) {
        let mut state = self.state.write();
        let id = context.id();
        let device = context.device();
        state.contexts.entry(id).or_insert_with(|| context.clone());

        let counter = self.object_ids.get();
        if !state.tracker.needs_parse(id, counter) {
            state.tracker.record_submission(id, task_count, None);
            return;
        }

        let mut pack = Vec::new();
        for record in state.registry.iter_mut() {
            if !record.is_indirect_candidate()
                || record.pending_free.is_some()
                || record.residency(device, id).state == ResidencyState::AlwaysResident
            {
                continue;
            }
            let backings = record.backings_for(device);
            if backings.is_empty() {
                continue;
            }
            record.mark_always_resident(device, id, task_count);
            if self.config.submit_as_pack {
                pack.extend(backings);
            } else {
                context.add_to_residency_set(&backings);
                self.counters.residency_submissions.increment();
            }
        }
        if !pack.is_empty() {
            pack.sort_unstable();
            pack.dedup();
            context.add_to_residency_set(&pack);
            self.counters.residency_submissions.increment();
        }
        state.tracker.record_submission(id, task_count, Some(counter));
    }

    /// Residency progress of `context`, if it ever made the internal set
    /// resident.
    pub fn registered_csr_entry(&self, context: ContextId) -> Option<RegisteredCsrEntry> {
        self.state.read().tracker.get(context)
    }

    /// Submit the allocation containing `ptr` for `context` at `task_count`.
    ///
    /// Only the entry for the context's own device changes.
    pub fn make_resident(&self, ptr: UsmPtr, context: &Arc<dyn SubmissionContext>, task_count: TaskCount) -> Result<()> {
        let mut state = self.state.write();
        self.make_resident_locked(&mut state, ptr, context, task_count)
    }

    /// Record that a kernel argument referencing `ptr` was submitted.
    pub fn record_usage(&self, ptr: UsmPtr, context: &Arc<dyn SubmissionContext>, task_count: TaskCount) -> Result<()> {
        self.make_resident(ptr, context, task_count)
    }

    /// Reset residency of the allocation containing `ptr` for `context`.
    pub fn evict(&self, ptr: UsmPtr, context: &dyn SubmissionContext) -> Result<()> {
        let mut state = self.state.write();
        let record = state
            .registry
            .lookup_mut(ptr)
            .ok_or(UsmError::InvalidArgument("pointer is not a live allocation"))?;
        record.evict(context.device(), context.id());
        Ok(())
    }

    /// Make `context` known so frees wait for its task counts.
    pub fn register_context(&self, context: &Arc<dyn SubmissionContext>) {
        self.state
            .write()
            .contexts
            .insert(context.id(), context.clone());
    }

    /// Forget `context`. Waits on it count as complete from now on.
    pub fn unregister_context(&self, context: ContextId) {
        let mut state = self.state.write();
        state.contexts.remove(&context);
        state.tracker.unregister(context);
    }

    /// Change the memory kind recorded for the allocation containing `ptr`.
    pub fn set_memory_kind(&self, ptr: UsmPtr, kind: MemoryKind) -> Result<()> {
        let mut state = self.state.write();
        let record = state
            .registry
            .lookup_mut(ptr)
            .ok_or(UsmError::InvalidArgument("pointer is not a live allocation"))?;
        record.kind = kind;
        Ok(())
    }

    /// Bases of every live allocation of `kind`, in address order.
    pub fn bases_of_kind(&self, kind: MemoryKind) -> Vec<UsmPtr> {
        self.state
            .read()
            .registry
            .iter()
            .filter(|record| record.kind == kind && record.pending_free.is_none())
            .map(|record| record.base)
            .collect()
    }

    /// Base of the live pooled chunk containing `ptr`.
    pub fn get_pooled_allocation_base_ptr(&self, ptr: UsmPtr) -> Option<UsmPtr> {
        let state = self.state.read();
        state
            .pool_sets
            .values()
            .find_map(|set| set.get_pooled_allocation_base_ptr(ptr))
    }

    /// Requested size of the live pooled chunk containing `ptr`.
    pub fn get_pooled_allocation_size(&self, ptr: UsmPtr) -> Option<usize> {
        let state = self.state.read();
        state
            .pool_sets
            .values()
            .find_map(|set| set.get_pooled_allocation_size(ptr))
    }

    /// Whether `ptr` lies inside any pool's backing.
    pub fn is_in_pool(&self, ptr: UsmPtr) -> bool {
        self.state.read().pool_sets.values().any(|set| set.is_in_pool(ptr))
    }

    /// Destroy empty pools in every pool set.
    pub fn trim_pools(&self) -> usize {
        self.state.write().pool_sets.values_mut().map(PoolSetManager::trim).sum()
    }

    /// Run `f` on one pool set.
    pub fn inspect_pool_set<R>(&self, key: PoolSetKey, f: impl FnOnce(&PoolSetManager) -> R) -> Option<R> {
        self.state.read().pool_sets.get(&key).map(f)
    }

    pub fn stats(&self) -> UsmStats {
        let state = self.state.read();
        let mut stats = UsmStats::new();
        for record in state.registry.iter() {
            stats.live_allocations += 1;
            if record.is_pooled() {
                stats.pooled_allocations += 1;
            } else {
                stats.dedicated_allocations += 1;
            }
            if record.pending_free.is_some() {
                stats.pending_frees += 1;
            }
        }
        for set in state.pool_sets.values() {
            stats.pool_count += set.pool_count();
            stats.pool_bytes += set.total_pool_size();
            stats.recycled_count += set.recycled_count();
        }
        stats.requested_bytes = self.counters.requested.get();
        stats.peak_requested_bytes = self.counters.requested.peak();
        stats.allocation_count = self.counters.allocations.get();
        stats.release_count = self.counters.releases.get();
        stats.residency_submissions = self.counters.residency_submissions.get();
        stats.migrations = self.counters.migrations.get();
        stats
    }

    /// Run `migrate` for the shared allocation containing `ptr` and make it
    /// resident for `context`, all under one lock. Returns `false`, without
    /// calling `migrate`, when `ptr` is not a live shared allocation.
    pub(crate) fn migrate_resident<F>(
        &self,
        ptr: UsmPtr,
        context: &Arc<dyn SubmissionContext>,
        task_count: TaskCount,
        migrate: F,
    ) -> bool
    where
        F: FnOnce(),
    {
        let mut state = self.state.write();
        let base = match state.registry.lookup(ptr) {
            Some(record) if record.kind == MemoryKind::SharedMigratable && record.pending_free.is_none() => {
                record.base
            }
            _ => return false,
        };
        migrate();
        self.counters.migrations.increment();
        // Cannot fail: the record was found above and the lock is held.
        let _ = self.make_resident_locked(&mut state, base, context, task_count);
        true
    }

    fn make_resident_locked(
        &self,
        state: &mut ManagerState,
        ptr: UsmPtr,
        context: &Arc<dyn SubmissionContext>,
        task_count: TaskCount,
    ) -> Result<()> {
        let id = context.id();
        let device = context.device();
        state.contexts.entry(id).or_insert_with(|| context.clone());

        let Some(record) = state.registry.lookup_mut(ptr) else {
            self.reporter.report(&USM003, &ptr.to_string());
            return Err(UsmError::InvalidArgument("pointer is not a live allocation"));
        };
        let backings = record.backings_for(device);
        if backings.is_empty() {
            self.reporter.report(&USM203, &format!("{} on {}", record.base, device));
            return Ok(());
        }
        record.mark_pending_resident(device, id, task_count);
        context.add_to_residency_set(&backings);
        self.counters.residency_submissions.increment();
        Ok(())
    }

    pub(crate) fn note_migrations(&self, count: usize) {
        for _ in 0..count {
            self.counters.migrations.increment();
        }
    }

    fn new_pool_set(&self, key: PoolSetKey, budget_device: DeviceIndex) -> PoolSetManager {
        PoolSetManager::new(
            key.kind,
            key.device,
            budget_device,
            &self.config,
            self.allocator.clone(),
            self.memory_info.clone(),
            self.reporter.clone(),
        )
    }

    fn allocate_dedicated(&self, size: usize, props: &AllocationProperties) -> Result<(UsmPtr, RecordStorage)> {
        let kind = match props.kind {
            MemoryKind::HostVisible => BackingKind::HostUnified,
            MemoryKind::DeviceOnly => BackingKind::DeviceLocal,
            MemoryKind::SharedMigratable => BackingKind::SharedGpu,
        };
        let flags = BackingFlags {
            kind,
            read_only: props.flags.read_only,
            coherent: props.flags.coherent,
            shareable: props.flags.shareable,
            multi_storage: props.devices.len() > 1,
        };

        let mut cpu = None;
        if props.kind == MemoryKind::SharedMigratable && self.config.independent_shared_storage {
            match self.allocator.allocate_host_memory(size, props.alignment) {
                Ok(handle) => cpu = Some(handle),
                Err(err) => {
                    self.reporter.report(&USM002, &format!("cpu storage of {} bytes: {}", size, err));
                    return Err(UsmError::from_host_backing(err));
                }
            }
        }

        let mut per_device = BTreeMap::new();
        for &device in &props.devices {
            match self.allocator.allocate_device_memory(device, size, props.alignment, flags) {
                Ok(handle) => {
                    per_device.insert(device, handle);
                }
                Err(err) => {
                    self.reporter.report(&USM002, &format!("{} bytes on {}: {}", size, device, err));
                    for handle in per_device.into_values().chain(cpu) {
                        self.allocator.release_memory(handle);
                    }
                    return Err(if kind.is_host() {
                        UsmError::from_host_backing(err)
                    } else {
                        UsmError::from_device_backing(err)
                    });
                }
            }
        }

        let base = cpu
            .as_ref()
            .or_else(|| per_device.values().next())
            .map(BackingHandle::address)
            .ok_or(UsmError::InvalidArgument("allocation needs at least one device"))?;
        Ok((base, RecordStorage::Dedicated { per_device, cpu }))
    }

    fn reclaim_locked(&self, state: &mut ManagerState) -> usize {
        if self.deferred.is_empty() {
            return 0;
        }
        let mut released = 0;
        self.deferred.drain(|base| {
            let waits = match state.registry.get(base) {
                Some(record) => match &record.pending_free {
                    Some(waits) => waits.clone(),
                    // The base was released and reused; this entry is stale.
                    None => return true,
                },
                None => return true,
            };
            if !outstanding_waits(state, &waits).is_empty() {
                return false;
            }
            self.release_record(state, base, true);
            released += 1;
            true
        });
        if released > 0 {
            self.reporter.report(&USM202, &format!("{} released", released));
        }
        released
    }

    fn release_record(&self, state: &mut ManagerState, base: UsmPtr, recycle: bool) {
        if let Some(record) = state.registry.remove(base) {
            self.counters.requested.sub(record.size);
            self.counters.releases.increment();
            self.release_storage(state, record, recycle);
        }
    }

    fn release_storage(&self, state: &mut ManagerState, record: AllocationRecord, recycle: bool) {
        match record.storage {
            RecordStorage::Pooled(membership) => {
                let released = state
                    .pool_sets
                    .get_mut(&membership.set)
                    .is_some_and(|set| set.free_svm_alloc(record.base));
                if !released {
                    self.reporter.report(
                        &USM105,
                        &format!("{} in pool {}", record.base, membership.pool.0),
                    );
                }
            }
            RecordStorage::Dedicated { mut per_device, cpu } => {
                let recyclable = recycle && cpu.is_none() && per_device.len() == 1 && !record.flags.shareable;
                if recyclable {
                    // The record's kind may have changed since allocation;
                    // the backing still says what storage it is.
                    let key = per_device.iter().next().and_then(|(&device, handle)| {
                        let kind = handle.kind().memory_kind()?;
                        Some(PoolSetKey {
                            kind,
                            device: (kind != MemoryKind::HostVisible).then_some(device),
                        })
                    });
                    if let Some(set) = key.and_then(|key| state.pool_sets.get_mut(&key)) {
                        if let Some((_, handle)) = per_device.pop_first() {
                            if let Err(handle) = set.recycle(handle, record.size) {
                                self.allocator.release_memory(handle);
                            }
                        }
                    }
                }
                for handle in per_device.into_values().chain(cpu) {
                    self.allocator.release_memory(handle);
                }
            }
        }
    }
}

impl Drop for AllocationManager {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for AllocationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pool set a request would be served from.
fn pool_set_key(props: &AllocationProperties) -> Option<PoolSetKey> {
    let device = match props.kind {
        MemoryKind::HostVisible => None,
        MemoryKind::DeviceOnly | MemoryKind::SharedMigratable => Some(props.single_device()?),
    };
    Some(PoolSetKey {
        kind: props.kind,
        device,
    })
}

/// Task counts that must complete before the allocation at `base` is
/// released: its own residency submissions, plus the last internal-set
/// submission of every context on one of its devices when it is an
/// indirect-access candidate.
fn collect_waits(state: &ManagerState, base: UsmPtr) -> Vec<TaskWait> {
    let Some(record) = state.registry.get(base) else {
        return Vec::new();
    };
    let mut waits: BTreeMap<ContextId, TaskCount> = record
        .residency_waits()
        .into_iter()
        .map(|wait| (wait.context, wait.task_count))
        .collect();

    if record.is_indirect_candidate() {
        for (context, sent) in state.tracker.sent_task_counts() {
            let on_device = state
                .contexts
                .get(&context)
                .is_some_and(|ctx| record.devices.contains(&ctx.device()));
            if sent > 0 && on_device {
                let slot = waits.entry(context).or_default();
                *slot = (*slot).max(sent);
            }
        }
    }

    waits
        .into_iter()
        .map(|(context, task_count)| TaskWait { context, task_count })
        .collect()
}

/// Waits whose context is registered and not yet past the task count.
fn outstanding_waits(state: &ManagerState, waits: &[TaskWait]) -> Vec<(Arc<dyn SubmissionContext>, TaskCount)> {
    waits
        .iter()
        .filter_map(|wait| {
            let context = state.contexts.get(&wait.context)?;
            (!context.is_task_count_complete(wait.task_count)).then(|| (context.clone(), wait.task_count))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::kind::AllocationFlags;
    use crate::gpu::dummy::{DummyBackend, DummyContext};
    use crate::util::size::{kb, mb};

    const DEV0: DeviceIndex = DeviceIndex(0);

    fn manager_with(config: UsmConfig) -> (AllocationManager, Arc<DummyBackend>) {
        let backend = Arc::new(DummyBackend::new());
        let manager = AllocationManager::new(config, backend.clone(), backend.clone()).unwrap();
        manager.ensure_initialized([DEV0]).unwrap();
        (manager, backend)
    }

    fn context(id: u32) -> (Arc<DummyContext>, Arc<dyn SubmissionContext>) {
        let ctx = Arc::new(DummyContext::new(id, DEV0));
        let dyn_ctx: Arc<dyn SubmissionContext> = ctx.clone();
        (ctx, dyn_ctx)
    }

    #[test]
    fn test_requires_initialization() {
        let backend = Arc::new(DummyBackend::new());
        let manager = AllocationManager::new(UsmConfig::default(), backend.clone(), backend).unwrap();
        let result = manager.create_allocation(kb(4), &AllocationProperties::host([DEV0]));
        assert_eq!(result, Err(UsmError::NotInitialized));
        assert_eq!(
            manager.ensure_initialized(Vec::new()),
            Err(UsmError::InvalidArgument("no devices to initialize"))
        );
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let (manager, _) = manager_with(UsmConfig::default());
        let result = manager.create_allocation(0, &AllocationProperties::host([DEV0]));
        assert!(matches!(result, Err(UsmError::InvalidArgument(_))));
        assert_eq!(manager.stats().live_allocations, 0);
    }

    #[test]
    fn test_small_host_allocation_is_pooled() {
        let (manager, _) = manager_with(UsmConfig::default());
        let ptr = manager.create_allocation(kb(4), &AllocationProperties::host([DEV0])).unwrap();

        let info = manager.get_record(ptr.offset(100)).unwrap();
        assert_eq!(info.base, ptr);
        assert_eq!(info.size, kb(4));
        assert!(info.pool.is_some());
        assert!(manager.is_in_pool(ptr));
        assert_eq!(manager.get_pooled_allocation_base_ptr(ptr.offset(100)), Some(ptr));
        assert_eq!(manager.get_pooled_allocation_size(ptr), Some(kb(4)));

        manager.free_allocation(ptr, FreeMode::Deferred).unwrap();
        assert!(manager.get_record(ptr).is_none());
        assert_eq!(manager.get_pooled_allocation_base_ptr(ptr), None);
    }

    #[test]
    fn test_unknown_and_double_free() {
        let (manager, _) = manager_with(UsmConfig::default());
        assert!(matches!(
            manager.free_allocation(UsmPtr::new(0x10), FreeMode::Deferred),
            Err(UsmError::InvalidArgument(_))
        ));

        let ptr = manager.create_allocation(mb(3), &AllocationProperties::host([DEV0])).unwrap();
        manager.free_allocation(ptr, FreeMode::Deferred).unwrap();
        assert_eq!(
            manager.free_allocation(ptr, FreeMode::Deferred),
            Err(UsmError::AlreadyFreed(ptr))
        );
    }

    #[test]
    fn test_deferred_free_waits_for_task_count() {
        let (manager, backend) = manager_with(UsmConfig::no_pooling());
        let (ctx, dyn_ctx) = context(1);
        let ptr = manager.create_allocation(kb(64), &AllocationProperties::device(DEV0)).unwrap();

        let task = ctx.submit();
        manager.make_resident(ptr, &dyn_ctx, task).unwrap();
        manager.free_allocation(ptr, FreeMode::Deferred).unwrap();

        assert!(manager.get_record(ptr).unwrap().pending_free);
        assert_eq!(manager.pending_free_count(), 1);
        assert_eq!(manager.reclaim_deferred(), 0);
        assert_eq!(backend.live_backings(), 1);

        ctx.complete_up_to(task);
        assert_eq!(manager.reclaim_deferred(), 1);
        assert!(manager.get_record(ptr).is_none());
        assert_eq!(backend.live_backings(), 0);
    }

    #[test]
    fn test_blocking_free_timeout_is_retryable() {
        let (manager, _) = manager_with(UsmConfig::no_pooling());
        let (ctx, dyn_ctx) = context(1);
        let ptr = manager.create_allocation(kb(64), &AllocationProperties::device(DEV0)).unwrap();
        let task = ctx.submit();
        manager.make_resident(ptr, &dyn_ctx, task).unwrap();

        let blocking = FreeMode::Blocking {
            timeout: Duration::from_millis(5),
        };
        assert_eq!(
            manager.free_allocation(ptr, blocking),
            Err(UsmError::WaitTimedOut { ptr, task_count: task })
        );
        assert!(manager.get_record(ptr).unwrap().pending_free);

        ctx.complete_up_to(task);
        manager.free_allocation(ptr, blocking).unwrap();
        assert!(manager.get_record(ptr).is_none());
    }

    #[test]
    fn test_unregistered_context_does_not_block() {
        let (manager, _) = manager_with(UsmConfig::no_pooling());
        let (ctx, dyn_ctx) = context(3);
        let ptr = manager.create_allocation(kb(8), &AllocationProperties::device(DEV0)).unwrap();
        manager.make_resident(ptr, &dyn_ctx, ctx.submit()).unwrap();

        manager.unregister_context(ContextId(3));
        manager.free_allocation(ptr, FreeMode::Deferred).unwrap();
        assert!(manager.get_record(ptr).is_none());
    }

    #[test]
    fn test_internal_residency_skips_unchanged_set() {
        let (manager, _) = manager_with(UsmConfig::no_pooling());
        let (ctx, dyn_ctx) = context(1);
        let a = manager.create_allocation(kb(4), &AllocationProperties::device(DEV0)).unwrap();
        let excluded = AllocationProperties::device(DEV0).with_flags(AllocationFlags {
            exclude_from_indirect_residency: true,
            ..Default::default()
        });
        manager.create_allocation(kb(4), &excluded).unwrap();

        manager.make_internal_allocations_resident(&dyn_ctx, 1);
        assert_eq!(ctx.residency_calls().len(), 1);
        assert_eq!(ctx.residency_calls()[0].len(), 1);
        assert_eq!(
            manager.get_record(a).unwrap().residency(DEV0, ContextId(1)).state,
            ResidencyState::AlwaysResident
        );

        manager.make_internal_allocations_resident(&dyn_ctx, 2);
        assert_eq!(ctx.residency_calls().len(), 1);
        assert_eq!(
            manager.registered_csr_entry(ContextId(1)).map(|e| e.latest_sent_task_count),
            Some(2)
        );
    }

    /// Hands every dedicated backing out at the same address.
    struct AliasingBackend(DummyBackend);

    impl AliasingBackend {
        fn alias(handle: BackingHandle) -> BackingHandle {
            if handle.kind() == BackingKind::PoolStorage {
                return handle;
            }
            BackingHandle::new(handle.id(), UsmPtr::new(0x1000_0000), handle.size(), handle.kind(), handle.device())
        }
    }

    impl BackingAllocator for AliasingBackend {
        fn allocate_device_memory(
            &self,
            device: DeviceIndex,
            size: usize,
            alignment: usize,
            flags: BackingFlags,
        ) -> std::result::Result<BackingHandle, crate::gpu::traits::BackingError> {
            self.0.allocate_device_memory(device, size, alignment, flags).map(Self::alias)
        }

        fn allocate_host_memory(
            &self,
            size: usize,
            alignment: usize,
        ) -> std::result::Result<BackingHandle, crate::gpu::traits::BackingError> {
            self.0.allocate_host_memory(size, alignment).map(Self::alias)
        }

        fn release_memory(&self, handle: BackingHandle) {
            self.0.release_memory(handle);
        }
    }

    impl MemoryInfo for AliasingBackend {
        fn query_free_device_memory(&self, device: DeviceIndex) -> u64 {
            self.0.query_free_device_memory(device)
        }
    }

    #[test]
    fn test_overlapping_backing_is_rejected() {
        let backend = Arc::new(AliasingBackend(DummyBackend::new()));
        let manager = AllocationManager::new(UsmConfig::no_pooling(), backend.clone(), backend.clone()).unwrap();
        manager.ensure_initialized([DEV0]).unwrap();

        let props = AllocationProperties::device(DEV0);
        let first = manager.create_allocation(kb(4), &props).unwrap();
        let live = backend.0.live_backings();

        assert_eq!(
            manager.create_allocation(kb(4), &props),
            Err(UsmError::OverlappingBacking(first))
        );
        assert_eq!(backend.0.live_backings(), live);
        assert_eq!(manager.stats().live_allocations, 1);
        assert!(manager.get_record(first).is_some());
    }

    #[test]
    fn test_dedicated_backing_is_recycled_into_pool() {
        let (manager, backend) = manager_with(UsmConfig::default());
        let dedicated = AllocationProperties::device(DEV0).with_flags(AllocationFlags {
            dedicated: true,
            ..Default::default()
        });
        let ptr = manager.create_allocation(mb(10), &dedicated).unwrap();
        assert!(manager.get_record(ptr).unwrap().pool.is_none());

        let live = backend.live_backings();
        manager.free_allocation(ptr, FreeMode::Deferred).unwrap();
        assert_eq!(backend.live_backings(), live);
        assert_eq!(manager.stats().recycled_count, 1);

        let again = manager.create_allocation(mb(10), &AllocationProperties::device(DEV0)).unwrap();
        assert_eq!(again, ptr);
        assert!(manager.get_record(again).unwrap().pool.is_some());
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let (manager, backend) = manager_with(UsmConfig::default());
        manager.create_allocation(kb(4), &AllocationProperties::host([DEV0])).unwrap();
        manager.create_allocation(mb(300), &AllocationProperties::device(DEV0)).unwrap();

        manager.cleanup();
        assert_eq!(backend.live_backings(), 0);
        assert!(!manager.is_initialized());
        assert_eq!(manager.stats().live_allocations, 0);
    }
}
