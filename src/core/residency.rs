//! Per-context bookkeeping for indirect-access residency.
//!
//! Each submission context that asked for the internal allocation set to be
//! made resident gets a [`RegisteredCsrEntry`]. Comparing its
//! `latest_resident_object_id` with the global allocation counter tells
//! whether anything was created since the last submission.

use std::collections::HashMap;

use crate::api::types::{ContextId, TaskCount};

/// Residency progress of one submission context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisteredCsrEntry {
    /// Task count of the last call that asserted the internal set resident
    pub latest_sent_task_count: TaskCount,
    /// Allocation counter value covered by the last parse
    pub latest_resident_object_id: u64,
}

/// Registered contexts and their residency progress.
#[derive(Debug, Default)]
pub struct ResidencyTracker {
    entries: HashMap<ContextId, RegisteredCsrEntry>,
}

impl ResidencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `context` if it is not tracked yet.
    pub fn register(&mut self, context: ContextId) {
        self.entries.entry(context).or_default();
    }

    pub fn unregister(&mut self, context: ContextId) -> Option<RegisteredCsrEntry> {
        self.entries.remove(&context)
    }

    pub fn get(&self, context: ContextId) -> Option<RegisteredCsrEntry> {
        self.entries.get(&context).copied()
    }

    pub fn is_registered(&self, context: ContextId) -> bool {
        self.entries.contains_key(&context)
    }

    /// Whether allocations were created since `context` last parsed the
    /// internal set. An untracked context always needs a parse.
    pub fn needs_parse(&self, context: ContextId, allocations_counter: u64) -> bool {
        self.entries
            .get(&context)
            .map_or(true, |entry| allocations_counter > entry.latest_resident_object_id)
    }

    /// Record a call for `context` at `task_count`. `parsed_up_to` is the
    /// allocation counter covered when the set was parsed.
    pub fn record_submission(&mut self, context: ContextId, task_count: TaskCount, parsed_up_to: Option<u64>) {
        let entry = self.entries.entry(context).or_default();
        entry.latest_sent_task_count = entry.latest_sent_task_count.max(task_count);
        if let Some(counter) = parsed_up_to {
            entry.latest_resident_object_id = counter;
        }
    }

    /// `(context, latest_sent_task_count)` for every tracked context.
    pub fn sent_task_counts(&self) -> impl Iterator<Item = (ContextId, TaskCount)> + '_ {
        self.entries
            .iter()
            .map(|(&context, entry)| (context, entry.latest_sent_task_count))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_only_when_new_allocations() {
        let mut tracker = ResidencyTracker::new();
        let ctx = ContextId(1);

        assert!(tracker.needs_parse(ctx, 3));
        tracker.record_submission(ctx, 10, Some(3));
        assert!(!tracker.needs_parse(ctx, 3));

        // Task count still advances without a parse.
        tracker.record_submission(ctx, 11, None);
        assert_eq!(
            tracker.get(ctx),
            Some(RegisteredCsrEntry {
                latest_sent_task_count: 11,
                latest_resident_object_id: 3,
            })
        );

        assert!(tracker.needs_parse(ctx, 4));
    }

    #[test]
    fn test_register_and_unregister() {
        let mut tracker = ResidencyTracker::new();
        tracker.register(ContextId(2));
        assert!(tracker.is_registered(ContextId(2)));
        assert!(tracker.needs_parse(ContextId(2), 1));
        assert!(!tracker.needs_parse(ContextId(2), 0));

        assert!(tracker.unregister(ContextId(2)).is_some());
        assert!(!tracker.is_registered(ContextId(2)));
        assert_eq!(tracker.sent_task_counts().count(), 0);
    }
}
