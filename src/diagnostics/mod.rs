//! Coded diagnostics.
//!
//! Operational events and misuse are reported as [`Diagnostic`] values with a
//! stable code, written to stderr in debug builds, forwarded to the `log`
//! facade when the `log` feature is on, and optionally captured by a
//! [`DiagnosticSink`] attached to an allocation manager.
//!
//! ## Diagnostic Codes
//!
//! | Code   | Meaning                          |
//! |--------|----------------------------------|
//! | USM0xx | Allocation and free              |
//! | USM1xx | Pooling                          |
//! | USM2xx | Deferred free and residency      |
//! | USM9xx | Internal errors                  |

pub mod emit;
pub mod kind;

pub use emit::{emit, emit_with_context, set_verbose, suppress_diagnostics, CollectingSink, DiagnosticSink, Reporter};
pub use kind::{Diagnostic, DiagnosticKind};

pub use kind::{
    USM001, USM002, USM003, USM004, USM101, USM102, USM103, USM104, USM105, USM201, USM202,
    USM203, USM901, USM902,
};
