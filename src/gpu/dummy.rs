//! In-memory reference backend for testing.
//!
//! Hands out addresses from a virtual address space without touching real
//! memory, tracks per-device free memory, and records every call so tests
//! can observe what the manager asked for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::traits::*;
use crate::api::types::{ContextId, DeviceIndex, TaskCount, UsmPtr};
use crate::sync::lock::Mutex;
use crate::util::layout::{checked_align_size, checked_align_up};
use crate::util::size::gb;

/// Smallest granule handed out by the dummy address space.
const PAGE_SIZE: usize = 4096;

/// First address of the dummy address space.
const ADDRESS_SPACE_BASE: u64 = 0x7f00_0000_0000;

/// A migration observed by the dummy page-fault handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub ptr: UsmPtr,
    pub size: usize,
    pub device: DeviceIndex,
}

/// Dummy backing allocator, free-memory query and page-fault handler.
#[derive(Debug)]
pub struct DummyBackend {
    /// Next unused virtual address
    next_address: Mutex<u64>,
    /// Next backing id
    next_id: AtomicU64,
    /// Remaining device memory per device
    free_memory: Mutex<HashMap<DeviceIndex, u64>>,
    /// Default free memory for devices not yet seen
    default_free_memory: u64,
    /// Live backings: id -> (size, device charged)
    live: Mutex<HashMap<BackingId, (usize, Option<DeviceIndex>)>>,
    fail_host: AtomicBool,
    fail_device: AtomicBool,
    allocation_count: AtomicU64,
    release_count: AtomicU64,
    migrations: Mutex<Vec<Migration>>,
    bulk_migrations: Mutex<Vec<Vec<UsmPtr>>>,
}

impl DummyBackend {
    /// Create a backend where every device starts with 16 GB free.
    pub fn new() -> Self {
        Self::with_free_memory(gb(16) as u64)
    }

    /// Create a backend where every device starts with `bytes` free.
    pub fn with_free_memory(bytes: u64) -> Self {
        Self {
            next_address: Mutex::new(ADDRESS_SPACE_BASE),
            next_id: AtomicU64::new(1),
            free_memory: Mutex::new(HashMap::new()),
            default_free_memory: bytes,
            live: Mutex::new(HashMap::new()),
            fail_host: AtomicBool::new(false),
            fail_device: AtomicBool::new(false),
            allocation_count: AtomicU64::new(0),
            release_count: AtomicU64::new(0),
            migrations: Mutex::new(Vec::new()),
            bulk_migrations: Mutex::new(Vec::new()),
        }
    }

    /// Override the free memory reported for one device.
    pub fn set_free_memory(&self, device: DeviceIndex, bytes: u64) {
        self.free_memory.lock().insert(device, bytes);
    }

    /// Make every host allocation fail.
    pub fn fail_host_allocations(&self, fail: bool) {
        self.fail_host.store(fail, Ordering::Relaxed);
    }

    /// Make every device allocation fail.
    pub fn fail_device_allocations(&self, fail: bool) {
        self.fail_device.store(fail, Ordering::Relaxed);
    }

    /// Number of backings currently alive.
    pub fn live_backings(&self) -> usize {
        self.live.lock().len()
    }

    /// Total successful allocations.
    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Total releases.
    pub fn release_count(&self) -> u64 {
        self.release_count.load(Ordering::Relaxed)
    }

    /// Migrations issued through `move_to_gpu_domain`.
    pub fn migrations(&self) -> Vec<Migration> {
        self.migrations.lock().clone()
    }

    /// Batches issued through `move_all_managed_to_gpu_domain`.
    pub fn bulk_migrations(&self) -> Vec<Vec<UsmPtr>> {
        self.bulk_migrations.lock().clone()
    }

    fn reserve_range(&self, size: usize, alignment: usize) -> Result<(UsmPtr, usize), BackingError> {
        if size == 0 {
            return Err(BackingError::InvalidSize);
        }
        let alignment = alignment.max(PAGE_SIZE);
        if !alignment.is_power_of_two() {
            return Err(BackingError::InvalidAlignment);
        }

        let size = checked_align_size(size, PAGE_SIZE).ok_or(BackingError::OutOfMemory)?;
        let mut next = self.next_address.lock();
        let address = checked_align_up(*next, alignment as u64)
            .and_then(|address| Some((address, address.checked_add(size as u64)?)));
        let Some((address, end)) = address else {
            return Err(BackingError::OutOfMemory);
        };
        *next = end;
        Ok((UsmPtr::new(address), size))
    }

    fn record(&self, address: UsmPtr, size: usize, kind: BackingKind, device: Option<DeviceIndex>, charged: Option<DeviceIndex>) -> BackingHandle {
        let id = BackingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live.lock().insert(id, (size, charged));
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        BackingHandle::new(id, address, size, kind, device)
    }
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingAllocator for DummyBackend {
    fn allocate_device_memory(
        &self,
        device: DeviceIndex,
        size: usize,
        alignment: usize,
        flags: BackingFlags,
    ) -> Result<BackingHandle, BackingError> {
        let host_placed = flags.kind.is_host();
        if host_placed && self.fail_host.load(Ordering::Relaxed) {
            return Err(BackingError::OutOfMemory);
        }
        if !host_placed && self.fail_device.load(Ordering::Relaxed) {
            return Err(BackingError::OutOfMemory);
        }

        let (address, size) = self.reserve_range(size, alignment)?;

        // Host-placed backings do not consume device memory.
        let charged = if host_placed {
            None
        } else {
            let mut free = self.free_memory.lock();
            let remaining = free.entry(device).or_insert(self.default_free_memory);
            if *remaining < size as u64 {
                return Err(BackingError::OutOfMemory);
            }
            *remaining -= size as u64;
            Some(device)
        };

        Ok(self.record(address, size, flags.kind, Some(device), charged))
    }

    fn allocate_host_memory(&self, size: usize, alignment: usize) -> Result<BackingHandle, BackingError> {
        if self.fail_host.load(Ordering::Relaxed) {
            return Err(BackingError::OutOfMemory);
        }
        let (address, size) = self.reserve_range(size, alignment)?;
        Ok(self.record(address, size, BackingKind::HostUnified, None, None))
    }

    fn release_memory(&self, handle: BackingHandle) {
        let entry = self.live.lock().remove(&handle.id());
        if let Some((size, Some(device))) = entry {
            let mut free = self.free_memory.lock();
            let remaining = free.entry(device).or_insert(self.default_free_memory);
            *remaining += size as u64;
        }
        self.release_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl MemoryInfo for DummyBackend {
    fn query_free_device_memory(&self, device: DeviceIndex) -> u64 {
        self.free_memory
            .lock()
            .get(&device)
            .copied()
            .unwrap_or(self.default_free_memory)
    }
}

impl PageFaultHandler for DummyBackend {
    fn move_to_gpu_domain(&self, ptr: UsmPtr, size: usize, device: DeviceIndex) {
        self.migrations.lock().push(Migration { ptr, size, device });
    }

    fn move_all_managed_to_gpu_domain(&self, ptrs: &[UsmPtr]) {
        self.bulk_migrations.lock().push(ptrs.to_vec());
    }
}

/// Dummy submission context with manually driven completion.
#[derive(Debug)]
pub struct DummyContext {
    id: ContextId,
    device: DeviceIndex,
    submitted: AtomicU64,
    completed: AtomicU64,
    residency_calls: Mutex<Vec<Vec<BackingId>>>,
}

impl DummyContext {
    /// Create a context for `device`; nothing submitted yet.
    pub fn new(id: u32, device: DeviceIndex) -> Self {
        Self {
            id: ContextId(id),
            device,
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            residency_calls: Mutex::new(Vec::new()),
        }
    }

    /// Simulate a submission; returns the new task count.
    pub fn submit(&self) -> TaskCount {
        self.submitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Simulate GPU progress up to and including `task_count`.
    pub fn complete_up_to(&self, task_count: TaskCount) {
        self.completed.fetch_max(task_count, Ordering::Relaxed);
    }

    /// Every residency call received, in order.
    pub fn residency_calls(&self) -> Vec<Vec<BackingId>> {
        self.residency_calls.lock().clone()
    }
}

impl SubmissionContext for DummyContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn device(&self) -> DeviceIndex {
        self.device
    }

    fn current_task_count(&self) -> TaskCount {
        self.submitted.load(Ordering::Relaxed)
    }

    fn is_task_count_complete(&self, task_count: TaskCount) -> bool {
        self.completed.load(Ordering::Relaxed) >= task_count
    }

    fn add_to_residency_set(&self, backings: &[BackingId]) {
        self.residency_calls.lock().push(backings.to_vec());
    }
}
