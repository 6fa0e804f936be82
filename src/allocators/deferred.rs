//! Deferred free queue.
//!
//! Frees whose GPU work is still outstanding are queued by base pointer and
//! retried on the next reclaim. Pushing is lock-free; draining happens under
//! the manager's write lock.

use crossbeam_queue::SegQueue;

use crate::api::types::UsmPtr;

/// Lock-free queue of pending frees.
#[derive(Debug)]
pub struct DeferredFreeQueue {
    queue: SegQueue<UsmPtr>,
}

impl DeferredFreeQueue {
    /// Create a new deferred free queue.
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Queue the allocation at `base` for a later release.
    pub fn push(&self, base: UsmPtr) {
        self.queue.push(base);
    }

    /// Offer every queued entry to `release` once.
    ///
    /// Entries for which `release` returns `false` stay queued. Returns the
    /// number of entries removed.
    pub fn drain(&self, mut release: impl FnMut(UsmPtr) -> bool) -> usize {
        let mut requeue = Vec::new();
        let mut removed = 0;
        // Bounded by the current length so requeued entries are not revisited.
        for _ in 0..self.queue.len() {
            let Some(base) = self.queue.pop() else { break };
            if release(base) {
                removed += 1;
            } else {
                requeue.push(base);
            }
        }
        for base in requeue {
            self.queue.push(base);
        }
        removed
    }

    /// Drop every queued entry.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    /// Check if there are pending frees.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get approximate number of pending frees.
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Default for DeferredFreeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deferred_queue() {
        let queue = DeferredFreeQueue::new();
        assert!(queue.is_empty());

        queue.push(UsmPtr::new(0x1000));
        queue.push(UsmPtr::new(0x2000));
        assert_eq!(queue.len(), 2);

        // Only the first entry is ready.
        let removed = queue.drain(|base| base == UsmPtr::new(0x1000));
        assert_eq!(removed, 1);
        assert_eq!(queue.len(), 1);

        let removed = queue.drain(|_| true);
        assert_eq!(removed, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let queue = DeferredFreeQueue::new();
        queue.push(UsmPtr::new(0x1000));
        queue.clear();
        assert!(queue.is_empty());
    }
}
