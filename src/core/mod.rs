//! Core bookkeeping: allocation records, the range registry, residency
//! tracking and the pool budget gate.

pub mod budget;
pub mod record;
pub mod registry;
pub mod residency;
