//! Allocation statistics.

use crate::util::size::format_bytes;

/// Snapshot of allocation manager statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsmStats {
    /// Live allocations (including ones waiting for a deferred free).
    pub live_allocations: usize,

    /// Live allocations served from a pool.
    pub pooled_allocations: usize,

    /// Live allocations with dedicated backings.
    pub dedicated_allocations: usize,

    /// Requested bytes of live allocations.
    pub requested_bytes: usize,

    /// Peak requested bytes (high water mark).
    pub peak_requested_bytes: usize,

    /// Total number of allocations performed.
    pub allocation_count: u64,

    /// Total number of allocations released.
    pub release_count: u64,

    /// Pools across all pool sets.
    pub pool_count: usize,

    /// Combined size of all pools.
    pub pool_bytes: usize,

    /// Frees waiting for GPU completion.
    pub pending_frees: usize,

    /// Dedicated backings turned into pools.
    pub recycled_count: u64,

    /// Calls made to a context's residency set.
    pub residency_submissions: u64,

    /// Migration requests issued to the page-fault handler.
    pub migrations: u64,
}

impl UsmStats {
    /// Create empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of live allocations served from pools.
    pub fn pooled_ratio(&self) -> f64 {
        if self.live_allocations == 0 {
            return 0.0;
        }
        self.pooled_allocations as f64 / self.live_allocations as f64
    }
}

impl std::fmt::Display for UsmStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "USM Statistics:")?;
        writeln!(
            f,
            "  Live:           {} ({} pooled, {} dedicated)",
            self.live_allocations, self.pooled_allocations, self.dedicated_allocations
        )?;
        writeln!(f, "  Requested:      {}", format_bytes(self.requested_bytes))?;
        writeln!(f, "  Peak requested: {}", format_bytes(self.peak_requested_bytes))?;
        writeln!(f, "  Allocations:    {}", self.allocation_count)?;
        writeln!(f, "  Releases:       {}", self.release_count)?;
        writeln!(
            f,
            "  Pools:          {} ({})",
            self.pool_count,
            format_bytes(self.pool_bytes)
        )?;
        writeln!(f, "  Pending frees:  {}", self.pending_frees)?;
        writeln!(f, "  Recycled:       {}", self.recycled_count)?;
        writeln!(f, "  Residency:      {} submissions", self.residency_submissions)?;
        writeln!(f, "  Migrations:     {}", self.migrations)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_ratio() {
        let mut stats = UsmStats::new();
        assert_eq!(stats.pooled_ratio(), 0.0);

        stats.live_allocations = 4;
        stats.pooled_allocations = 3;
        assert_eq!(stats.pooled_ratio(), 0.75);
    }

    #[test]
    fn test_display() {
        let stats = UsmStats {
            live_allocations: 2,
            pooled_allocations: 1,
            dedicated_allocations: 1,
            pool_count: 3,
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.contains("2 (1 pooled, 1 dedicated)"));
        assert!(text.contains("Pools:          3"));
    }
}
