//! Pointer-range index over live allocations.
//!
//! Records are keyed by base address in a `BTreeMap`; a lookup takes the
//! last record starting at or below the pointer and checks its extent, so
//! interior pointers resolve in O(log n). Stored ranges are kept pairwise
//! disjoint.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::api::types::UsmPtr;
use crate::core::record::AllocationRecord;

/// Index of live allocations by address range.
#[derive(Debug)]
pub struct AllocationRegistry {
    records: BTreeMap<u64, AllocationRecord>,
    freed: FreedHistory,
}

impl AllocationRegistry {
    /// Create an empty registry remembering `history_depth` freed bases.
    pub fn new(history_depth: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            freed: FreedHistory::new(history_depth),
        }
    }

    /// Insert a record. A record overlapping a live one is handed back.
    pub fn insert(&mut self, record: AllocationRecord) -> Result<(), AllocationRecord> {
        let base = record.base.addr();
        let end = record.end();

        let overlaps_prev = self
            .records
            .range(..=base)
            .next_back()
            .is_some_and(|(_, prev)| prev.end() > base);
        let overlaps_next = self
            .records
            .range(base..)
            .next()
            .is_some_and(|(&next_base, _)| next_base < end.max(base + 1));
        if overlaps_prev || overlaps_next {
            return Err(record);
        }

        self.freed.forget_range(base, end.max(base + 1));
        self.records.insert(base, record);
        Ok(())
    }

    /// The record whose `[base, base + size)` contains `ptr`.
    pub fn lookup(&self, ptr: UsmPtr) -> Option<&AllocationRecord> {
        self.records
            .range(..=ptr.addr())
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.contains(ptr))
    }

    pub fn lookup_mut(&mut self, ptr: UsmPtr) -> Option<&mut AllocationRecord> {
        self.records
            .range_mut(..=ptr.addr())
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.contains(ptr))
    }

    /// The record starting exactly at `base`.
    pub fn get(&self, base: UsmPtr) -> Option<&AllocationRecord> {
        self.records.get(&base.addr())
    }

    pub fn get_mut(&mut self, base: UsmPtr) -> Option<&mut AllocationRecord> {
        self.records.get_mut(&base.addr())
    }

    /// Remove the record starting exactly at `base` and remember the base
    /// as freed.
    pub fn remove(&mut self, base: UsmPtr) -> Option<AllocationRecord> {
        let record = self.records.remove(&base.addr())?;
        self.freed.remember(base);
        Some(record)
    }

    /// Whether `ptr` is the base of a recently removed record that no live
    /// record has reused.
    pub fn was_freed(&self, ptr: UsmPtr) -> bool {
        self.freed.contains(ptr)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AllocationRecord> {
        self.records.values_mut()
    }

    /// Take every record out, leaving the registry empty.
    pub fn drain(&mut self) -> Vec<AllocationRecord> {
        std::mem::take(&mut self.records).into_values().collect()
    }
}

/// Bounded FIFO of recently freed base pointers.
#[derive(Debug)]
struct FreedHistory {
    depth: usize,
    order: VecDeque<u64>,
    members: BTreeSet<u64>,
}

impl FreedHistory {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            order: VecDeque::with_capacity(depth.min(1024)),
            members: BTreeSet::new(),
        }
    }

    fn remember(&mut self, base: UsmPtr) {
        if self.depth == 0 || !self.members.insert(base.addr()) {
            return;
        }
        self.order.push_back(base.addr());
        while self.order.len() > self.depth {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, ptr: UsmPtr) -> bool {
        self.members.contains(&ptr.addr())
    }

    /// Forget every remembered base in `[start, end)`.
    fn forget_range(&mut self, start: u64, end: u64) {
        let stale: Vec<u64> = self.members.range(start..end).copied().collect();
        if stale.is_empty() {
            return;
        }
        for addr in &stale {
            self.members.remove(addr);
        }
        self.order.retain(|addr| !stale.contains(addr));
    }
}
