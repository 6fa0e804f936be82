//! Prefetch of shared allocations before submission.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::kind::MemoryKind;
use crate::api::manager::AllocationManager;
use crate::api::types::{DeviceIndex, UsmPtr};
use crate::gpu::traits::{PageFaultHandler, SubmissionContext};

/// Shared allocations a submission context wants migrated, keyed by
/// `(device, base)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchContext {
    tracked: BTreeMap<(DeviceIndex, UsmPtr), usize>,
}

impl PrefetchContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn contains(&self, device: DeviceIndex, ptr: UsmPtr) -> bool {
        self.tracked.contains_key(&(device, ptr))
    }

    /// Tracked `(device, ptr, size)` entries.
    pub fn entries(&self) -> impl Iterator<Item = (DeviceIndex, UsmPtr, usize)> + '_ {
        self.tracked
            .iter()
            .map(|(&(device, ptr), &size)| (device, ptr, size))
    }
}

/// Issues migrations through an external page-fault handler.
pub struct PrefetchCoordinator {
    handler: Arc<dyn PageFaultHandler>,
}

impl PrefetchCoordinator {
    pub fn new(handler: Arc<dyn PageFaultHandler>) -> Self {
        Self { handler }
    }

    /// Track `(device, ptr, size)` for migration.
    ///
    /// A no-op unless `ptr` is a shared allocation and recoverable page
    /// faults are enabled. Returns whether the entry is tracked.
    pub fn insert_tracked(
        &self,
        context: &mut PrefetchContext,
        manager: &AllocationManager,
        device: DeviceIndex,
        ptr: UsmPtr,
        size: usize,
    ) -> bool {
        if !manager.config().recoverable_page_faults {
            return false;
        }
        let shared = manager
            .get_record(ptr)
            .is_some_and(|info| info.kind == MemoryKind::SharedMigratable);
        if !shared {
            return false;
        }
        context.tracked.insert((device, ptr), size);
        true
    }

    /// Migrate every entry tracked for `device` and make it resident for
    /// `csr` at its current task count.
    ///
    /// Entries stay tracked. Entries whose allocation is gone or no longer
    /// shared are skipped. Returns the number of migrations issued.
    pub fn migrate_to_gpu(
        &self,
        context: &PrefetchContext,
        manager: &AllocationManager,
        device: DeviceIndex,
        csr: &Arc<dyn SubmissionContext>,
    ) -> usize {
        let mut migrated = 0;
        for (&(_, ptr), &size) in context.tracked.range((device, UsmPtr::new(0))..=(device, UsmPtr::new(u64::MAX))) {
            let issued = manager.migrate_resident(ptr, csr, csr.current_task_count(), || {
                self.handler.move_to_gpu_domain(ptr, size, device);
            });
            if issued {
                migrated += 1;
            }
        }
        migrated
    }

    /// Forget every tracked entry.
    pub fn remove_tracked(&self, context: &mut PrefetchContext) {
        context.tracked.clear();
    }

    /// Hand every live shared allocation to the handler in one call.
    pub fn migrate_all_managed(&self, manager: &AllocationManager) -> usize {
        let bases = manager.bases_of_kind(MemoryKind::SharedMigratable);
        if bases.is_empty() {
            return 0;
        }
        self.handler.move_all_managed_to_gpu_domain(&bases);
        manager.note_migrations(bases.len());
        bases.len()
    }
}

impl std::fmt::Debug for PrefetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrefetchCoordinator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::config::UsmConfig;
    use crate::api::kind::AllocationProperties;
    use crate::api::manager::FreeMode;
    use crate::gpu::dummy::{DummyBackend, DummyContext};
    use crate::util::size::kb;

    const DEV0: DeviceIndex = DeviceIndex(0);
    const DEV1: DeviceIndex = DeviceIndex(1);

    fn setup(recoverable: bool) -> (AllocationManager, Arc<DummyBackend>, PrefetchCoordinator) {
        let backend = Arc::new(DummyBackend::new());
        let config = UsmConfig::default().with_recoverable_page_faults(recoverable);
        let manager = AllocationManager::new(config, backend.clone(), backend.clone()).unwrap();
        manager.ensure_initialized([DEV0, DEV1]).unwrap();
        let coordinator = PrefetchCoordinator::new(backend.clone());
        (manager, backend, coordinator)
    }

    #[test]
    fn test_insert_requires_shared_and_page_faults() {
        let (manager, _, coordinator) = setup(false);
        let shared = manager.create_allocation(kb(64), &AllocationProperties::shared([DEV0])).unwrap();
        let mut context = PrefetchContext::new();
        assert!(!coordinator.insert_tracked(&mut context, &manager, DEV0, shared, kb(64)));
        assert!(context.is_empty());

        let (manager, _, coordinator) = setup(true);
        let host = manager.create_allocation(kb(64), &AllocationProperties::host([DEV0])).unwrap();
        assert!(!coordinator.insert_tracked(&mut context, &manager, DEV0, host, kb(64)));
        assert!(context.is_empty());
    }

    #[test]
    fn test_migrate_filters_by_device_and_repeats() {
        let (manager, backend, coordinator) = setup(true);
        let a = manager.create_allocation(kb(64), &AllocationProperties::shared([DEV0])).unwrap();
        let b = manager.create_allocation(kb(64), &AllocationProperties::shared([DEV1])).unwrap();

        let mut context = PrefetchContext::new();
        assert!(coordinator.insert_tracked(&mut context, &manager, DEV0, a, kb(64)));
        assert!(coordinator.insert_tracked(&mut context, &manager, DEV1, b, kb(64)));

        let csr: Arc<dyn SubmissionContext> = Arc::new(DummyContext::new(1, DEV0));
        assert_eq!(coordinator.migrate_to_gpu(&context, &manager, DEV0, &csr), 1);
        assert_eq!(coordinator.migrate_to_gpu(&context, &manager, DEV0, &csr), 1);

        let migrations = backend.migrations();
        assert_eq!(migrations.len(), 2);
        assert!(migrations.iter().all(|m| m.ptr == a && m.device == DEV0));
        assert_eq!(context.len(), 2);

        coordinator.remove_tracked(&mut context);
        assert!(context.is_empty());
        assert_eq!(manager.stats().migrations, 2);
    }

    #[test]
    fn test_kind_change_skips_entry() {
        let (manager, backend, coordinator) = setup(true);
        let ptr = manager.create_allocation(kb(64), &AllocationProperties::shared([DEV0])).unwrap();
        let mut context = PrefetchContext::new();
        coordinator.insert_tracked(&mut context, &manager, DEV0, ptr, kb(64));

        manager.set_memory_kind(ptr, MemoryKind::DeviceOnly).unwrap();
        let csr: Arc<dyn SubmissionContext> = Arc::new(DummyContext::new(1, DEV0));
        assert_eq!(coordinator.migrate_to_gpu(&context, &manager, DEV0, &csr), 0);
        assert!(backend.migrations().is_empty());
        assert!(context.contains(DEV0, ptr));
    }

    #[test]
    fn test_freed_entry_is_neither_migrated_nor_counted() {
        let (manager, backend, coordinator) = setup(true);
        let kept = manager.create_allocation(kb(64), &AllocationProperties::shared([DEV0])).unwrap();
        let freed = manager.create_allocation(kb(64), &AllocationProperties::shared([DEV0])).unwrap();
        let mut context = PrefetchContext::new();
        coordinator.insert_tracked(&mut context, &manager, DEV0, kept, kb(64));
        coordinator.insert_tracked(&mut context, &manager, DEV0, freed, kb(64));

        manager.free_allocation(freed, FreeMode::Deferred).unwrap();
        let csr: Arc<dyn SubmissionContext> = Arc::new(DummyContext::new(1, DEV0));
        assert_eq!(coordinator.migrate_to_gpu(&context, &manager, DEV0, &csr), 1);

        let migrations = backend.migrations();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].ptr, kept);
        assert_eq!(manager.stats().migrations, migrations.len() as u64);
    }

    #[test]
    fn test_migrate_all_managed() {
        let (manager, backend, coordinator) = setup(false);
        let a = manager.create_allocation(kb(4), &AllocationProperties::shared([DEV0])).unwrap();
        let b = manager.create_allocation(kb(4), &AllocationProperties::shared([DEV1])).unwrap();
        manager.create_allocation(kb(4), &AllocationProperties::device(DEV0)).unwrap();

        assert_eq!(coordinator.migrate_all_managed(&manager), 2);
        let bulk = backend.bulk_migrations();
        assert_eq!(bulk.len(), 1);
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(bulk[0], expected);
    }
}
