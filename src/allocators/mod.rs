//! Pool allocation and deferred release.
//!
//! Pools carve fixed backings into chunks, pool sets route requests by size
//! class, and the deferred queue holds frees still waiting on the GPU.

pub mod deferred;
pub mod pool;
pub mod pool_set;
