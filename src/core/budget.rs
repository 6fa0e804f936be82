//! Free-memory budget gate for pool creation.
//!
//! A pool set may only grow while its projected footprint stays within a
//! fraction of the free memory reported for its budget device.

/// Budget status for a potential pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// The pool fits.
    Ok,
    /// The pool would push the footprint over the limit.
    Exceeded,
}

/// Budget of one pool set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolBudget {
    /// Fraction of free device memory available to pools (0.0 - 1.0)
    fraction: f64,
}

impl PoolBudget {
    /// Create a budget with the given fraction, clamped to [0, 1].
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction: fraction.clamp(0.0, 1.0),
        }
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    /// Bytes pools may occupy given `free_memory`.
    pub fn limit(&self, free_memory: u64) -> u64 {
        (free_memory as f64 * self.fraction) as u64
    }

    /// Check whether a pool of `additional` bytes may be created next to
    /// `existing` bytes of pools.
    pub fn check(&self, existing: usize, additional: usize, free_memory: u64) -> BudgetStatus {
        let projected = existing as u64 + additional as u64;
        if projected <= self.limit(free_memory) {
            BudgetStatus::Ok
        } else {
            BudgetStatus::Exceeded
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::size::mb;

    #[test]
    fn test_budget_gate() {
        let budget = PoolBudget::new(0.08);
        let free = mb(100) as u64;

        assert_eq!(budget.check(0, mb(7), free), BudgetStatus::Ok);
        assert_eq!(budget.check(0, mb(9), free), BudgetStatus::Exceeded);
        assert_eq!(budget.check(mb(2), mb(7), free), BudgetStatus::Exceeded);
    }

    #[test]
    fn test_zero_fraction_refuses_everything() {
        let budget = PoolBudget::new(0.0);
        assert_eq!(budget.check(0, 1, u64::MAX), BudgetStatus::Exceeded);
        assert_eq!(budget.limit(1 << 30), 0);
    }

    #[test]
    fn test_fraction_is_clamped() {
        assert_eq!(PoolBudget::new(3.0).fraction(), 1.0);
        assert_eq!(PoolBudget::new(-1.0).fraction(), 0.0);
    }
}
