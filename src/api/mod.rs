//! Public API for usmalloc.
//!
//! This module contains all user-facing types and functions.
//! Most users should only interact with [`manager::AllocationManager`] and
//! the types it takes and returns.

pub mod config;
pub mod error;
pub mod kind;
pub mod manager;
pub mod stats;
pub mod types;
