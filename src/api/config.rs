//! Allocation manager configuration.

use crate::api::error::{Result, UsmError};
use crate::api::kind::MemoryKind;
use crate::util::size::{kb, mb};

/// Configuration for the allocation manager.
#[derive(Debug, Clone, PartialEq)]
pub struct UsmConfig {
    /// Pooling enabled per memory kind, indexed by [`MemoryKind::index`]
    pub pooling_enabled: [bool; 3],

    /// Fraction of free device memory pools of each kind may occupy
    /// (default: host 0.02, device 0.08, shared 0.0)
    pub recycling_fraction: [f64; 3],

    /// Capacity of every small-class pool (default: 2 MB)
    pub small_pool_size: usize,

    /// Inclusive upper bounds of the eagerly created small classes
    /// (default: 4 KB, 64 KB, 2 MB)
    pub small_class_limits: Vec<usize>,

    /// Inclusive upper bounds of the lazily created large classes
    /// (default: 16 MB, 64 MB, 256 MB)
    pub large_class_limits: Vec<usize>,

    /// Largest request that may be pooled (default: 256 MB)
    pub max_poolable_size: usize,

    /// Placement granule inside a pool (default: 512 bytes)
    pub chunk_alignment: usize,

    /// Largest requested alignment a pool can honour (default: 2 MB)
    pub max_pool_alignment: usize,

    /// Submit the indirect-access set in one residency call
    pub submit_as_pack: bool,

    /// Give shared allocations a separate CPU backing
    pub independent_shared_storage: bool,

    /// Kernel-mode migration of shared allocations is available
    pub recoverable_page_faults: bool,

    /// How many freed base pointers are remembered for double-free detection
    pub freed_history_depth: usize,
}

impl Default for UsmConfig {
    fn default() -> Self {
        Self {
            pooling_enabled: [true, true, false],
            recycling_fraction: [0.02, 0.08, 0.0],
            small_pool_size: mb(2),
            small_class_limits: vec![kb(4), kb(64), mb(2)],
            large_class_limits: vec![mb(16), mb(64), mb(256)],
            max_poolable_size: mb(256),
            chunk_alignment: 512,
            max_pool_alignment: mb(2),
            submit_as_pack: true,
            independent_shared_storage: false,
            recoverable_page_faults: false,
            freed_history_depth: 1024,
        }
    }
}

impl UsmConfig {
    /// Every allocation gets a dedicated backing.
    pub fn no_pooling() -> Self {
        Self {
            pooling_enabled: [false; 3],
            ..Self::default()
        }
    }

    /// Small pools and a single small large class, for tests and
    /// constrained environments.
    pub fn minimal() -> Self {
        Self {
            small_pool_size: kb(256),
            small_class_limits: vec![kb(4), kb(64)],
            large_class_limits: vec![mb(4)],
            max_poolable_size: mb(4),
            freed_history_depth: 64,
            ..Self::default()
        }
    }

    /// Whether `kind` participates in pooling.
    pub fn pooling_enabled(&self, kind: MemoryKind) -> bool {
        self.pooling_enabled[kind.index()]
    }

    /// Budget fraction applied to pools of `kind`.
    pub fn recycling_fraction(&self, kind: MemoryKind) -> f64 {
        self.recycling_fraction[kind.index()]
    }

    /// Builder pattern: enable or disable pooling for one kind.
    pub fn with_pooling(mut self, kind: MemoryKind, enable: bool) -> Self {
        self.pooling_enabled[kind.index()] = enable;
        self
    }

    /// Builder pattern: set the recycling fraction of one kind.
    pub fn with_recycling_fraction(mut self, kind: MemoryKind, fraction: f64) -> Self {
        self.recycling_fraction[kind.index()] = fraction;
        self
    }

    /// Builder pattern: set the small pool size.
    pub fn with_small_pool_size(mut self, size: usize) -> Self {
        self.small_pool_size = size;
        self
    }

    /// Builder pattern: set the size class boundaries.
    pub fn with_size_classes(mut self, small: Vec<usize>, large: Vec<usize>) -> Self {
        self.small_class_limits = small;
        self.large_class_limits = large;
        self
    }

    /// Builder pattern: set the largest poolable size.
    pub fn with_max_poolable_size(mut self, size: usize) -> Self {
        self.max_poolable_size = size;
        self
    }

    /// Builder pattern: toggle pack submission of indirect allocations.
    pub fn with_submit_as_pack(mut self, enable: bool) -> Self {
        self.submit_as_pack = enable;
        self
    }

    /// Builder pattern: toggle separate CPU storage for shared allocations.
    pub fn with_independent_shared_storage(mut self, enable: bool) -> Self {
        self.independent_shared_storage = enable;
        self
    }

    /// Builder pattern: toggle recoverable page faults.
    pub fn with_recoverable_page_faults(mut self, enable: bool) -> Self {
        self.recoverable_page_faults = enable;
        self
    }

    /// Builder pattern: set the freed-pointer history depth.
    pub fn with_freed_history_depth(mut self, depth: usize) -> Self {
        self.freed_history_depth = depth;
        self
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.chunk_alignment.is_power_of_two() {
            return Err(UsmError::InvalidArgument("chunk alignment must be a power of two"));
        }
        if !self.max_pool_alignment.is_power_of_two() || self.max_pool_alignment < self.chunk_alignment {
            return Err(UsmError::InvalidArgument(
                "max pool alignment must be a power of two no smaller than the chunk alignment",
            ));
        }
        if self.recycling_fraction.iter().any(|f| !(0.0..=1.0).contains(f)) {
            return Err(UsmError::InvalidArgument("recycling fractions must lie in [0, 1]"));
        }

        let limits: Vec<usize> = self
            .small_class_limits
            .iter()
            .chain(self.large_class_limits.iter())
            .copied()
            .collect();
        if limits.is_empty() || limits[0] == 0 || limits.windows(2).any(|w| w[0] >= w[1]) {
            return Err(UsmError::InvalidArgument("size class limits must be strictly increasing"));
        }
        if let Some(&largest_small) = self.small_class_limits.last() {
            if largest_small > self.small_pool_size {
                return Err(UsmError::InvalidArgument(
                    "small pools must hold at least one allocation of their class",
                ));
            }
        }
        Ok(())
    }
}
