//! A single pool: one backing allocation carved into chunks.
//!
//! Free space is a first-fit free list keyed by offset and coalesced on
//! release. Live reservations are indexed separately so a release can be
//! checked against what was actually handed out.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::api::types::{PoolId, UsmPtr};
use crate::gpu::traits::{BackingHandle, BackingId};
use crate::util::layout::align_up;

/// Bookkeeping failures inside a pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The range was never reserved, or was reserved with another size.
    #[error("no reservation of {size} bytes at pool offset {offset:#x}")]
    NotReserved { offset: u64, size: usize },
}

/// One live reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    /// Size the caller asked for
    requested: usize,
    /// Size taken out of the free list (chunk-aligned)
    reserved: u64,
}

/// A pool of sub-allocations backed by one allocation.
#[derive(Debug)]
pub struct Pool {
    id: PoolId,
    backing: BackingHandle,
    chunk_alignment: u64,
    /// Free ranges: offset -> length, disjoint and coalesced
    free: BTreeMap<u64, u64>,
    /// Live reservations by offset
    allocated: BTreeMap<u64, Chunk>,
    used: u64,
}

impl Pool {
    /// Wrap `backing` as a pool placing chunks on `chunk_alignment`.
    pub fn new(id: PoolId, backing: BackingHandle, chunk_alignment: usize) -> Self {
        let total = backing.size() as u64;
        let mut free = BTreeMap::new();
        if total > 0 {
            free.insert(0, total);
        }
        Self {
            id,
            backing,
            chunk_alignment: chunk_alignment.max(1) as u64,
            free,
            allocated: BTreeMap::new(),
            used: 0,
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// First address of the pool.
    pub fn base(&self) -> UsmPtr {
        self.backing.address()
    }

    pub fn total_size(&self) -> usize {
        self.backing.size()
    }

    pub fn backing_id(&self) -> BackingId {
        self.backing.id()
    }

    /// Bytes currently reserved, including chunk padding.
    pub fn used_bytes(&self) -> usize {
        self.used as usize
    }

    pub fn allocation_count(&self) -> usize {
        self.allocated.len()
    }

    /// Reserve `size` bytes at an address aligned to `alignment` (and at
    /// least the chunk alignment). First fit; `None` when nothing fits.
    pub fn try_reserve(&mut self, size: usize, alignment: usize) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = (alignment as u64).max(self.chunk_alignment);
        let reserved = align_up(size as u64, self.chunk_alignment);
        let base = self.base().addr();

        // Alignment applies to the address, not the offset: recycled
        // backings are not necessarily aligned like fresh pools.
        let (offset, len, start) = self.free.iter().find_map(|(&offset, &len)| {
            let start = align_up(base + offset, align) - base;
            (start + reserved <= offset + len).then_some((offset, len, start))
        })?;

        self.free.remove(&offset);
        if start > offset {
            self.free.insert(offset, start - offset);
        }
        let tail = offset + len - (start + reserved);
        if tail > 0 {
            self.free.insert(start + reserved, tail);
        }

        self.allocated.insert(
            start,
            Chunk {
                requested: size,
                reserved,
            },
        );
        self.used += reserved;
        Some(start)
    }

    /// Return a reservation made by [`try_reserve`](Self::try_reserve).
    ///
    /// `size` must be the size originally requested. On mismatch nothing
    /// changes.
    pub fn release(&mut self, offset: u64, size: usize) -> Result<(), PoolError> {
        let chunk = match self.allocated.get(&offset) {
            Some(chunk) if chunk.requested == size => *chunk,
            _ => return Err(PoolError::NotReserved { offset, size }),
        };
        self.allocated.remove(&offset);
        self.used -= chunk.reserved;

        let mut start = offset;
        let mut len = chunk.reserved;

        // Merge with the free range ending at `start`.
        if let Some((&prev_off, &prev_len)) = self.free.range(..start).next_back() {
            if prev_off + prev_len == start {
                self.free.remove(&prev_off);
                start = prev_off;
                len += prev_len;
            }
        }
        // Merge with the free range starting at the end.
        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        self.free.insert(start, len);
        Ok(())
    }

    /// True iff the free list covers the whole pool.
    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
            && self.free.len() == 1
            && self.free.get(&0) == Some(&(self.total_size() as u64))
    }

    /// `base <= ptr < base + total_size`.
    pub fn is_in_pool(&self, ptr: UsmPtr) -> bool {
        let base = self.base().addr();
        ptr.addr() >= base && ptr.addr() < base + self.total_size() as u64
    }

    /// Offset of `ptr` from the pool base, if inside the pool.
    pub fn offset_in_pool(&self, ptr: UsmPtr) -> Option<u64> {
        self.is_in_pool(ptr).then(|| ptr.distance_from(self.base()))
    }

    /// The live reservation containing `ptr` as `(offset, requested size)`.
    ///
    /// Padding between the requested size and the chunk boundary does not
    /// count as inside the reservation.
    pub fn chunk_containing(&self, ptr: UsmPtr) -> Option<(u64, usize)> {
        let off = self.offset_in_pool(ptr)?;
        let (&start, chunk) = self.allocated.range(..=off).next_back()?;
        (off < start + chunk.requested as u64).then_some((start, chunk.requested))
    }

    /// Give the backing back; the caller releases it.
    pub fn into_backing(self) -> BackingHandle {
        self.backing
    }
}
