//! Synchronization primitives.
//!
//! Thin wrappers over std or parking_lot locks, plus relaxed counters.

pub(crate) mod counters;
pub(crate) mod lock;
