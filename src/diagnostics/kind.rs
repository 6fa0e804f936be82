//! Diagnostic kinds and predefined diagnostics.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error: the caller did something wrong or state is inconsistent.
    Error,
    /// Something is probably wrong or suboptimal.
    Warning,
    /// An operational event worth recording.
    Note,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `USM0xx` - Allocation and free
/// - `USM1xx` - Pooling
/// - `USM2xx` - Deferred free and residency
/// - `USM9xx` - Internal errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "USM001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self::new(DiagnosticKind::Error, code, message)
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self::new(DiagnosticKind::Warning, code, message)
    }

    /// Create a new note diagnostic.
    pub const fn note(code: &'static str, message: &'static str) -> Self {
        Self::new(DiagnosticKind::Note, code, message)
    }

    const fn new(kind: DiagnosticKind, code: &'static str, message: &'static str) -> Self {
        Self {
            kind,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// USM0xx - Allocation and free
// =============================================================================

/// USM001: Zero-size allocation request.
pub const USM001: Diagnostic = Diagnostic::warning(
    "USM001",
    "zero-size allocation requested"
).with_note("no memory was allocated and a null result was returned");

/// USM002: Backing allocator failed.
pub const USM002: Diagnostic = Diagnostic::error(
    "USM002",
    "backing allocation failed"
).with_note("every backing created for this request has been released")
 .with_help("free unused allocations or lower the pool recycling fractions in UsmConfig");

/// USM003: Free or lookup of an unknown pointer.
pub const USM003: Diagnostic = Diagnostic::error(
    "USM003",
    "pointer does not belong to any live allocation"
).with_help("pass a pointer returned by create_allocation that has not been freed");

/// USM004: Double free.
pub const USM004: Diagnostic = Diagnostic::error(
    "USM004",
    "allocation freed twice"
).with_note("the base pointer was already released or is waiting for GPU completion");

// =============================================================================
// USM1xx - Pooling
// =============================================================================

/// USM101: A new pool was created.
pub const USM101: Diagnostic = Diagnostic::note(
    "USM101",
    "pool created"
);

/// USM102: Large pool refused by the free-memory budget.
pub const USM102: Diagnostic = Diagnostic::note(
    "USM102",
    "pool creation refused by free-memory budget"
).with_note("the request falls back to a dedicated allocation")
 .with_help("raise the recycling fraction for this memory kind to pool more aggressively");

/// USM103: Empty pools were trimmed.
pub const USM103: Diagnostic = Diagnostic::note(
    "USM103",
    "empty pools trimmed"
);

/// USM104: A dedicated allocation was recycled as pool storage.
pub const USM104: Diagnostic = Diagnostic::note(
    "USM104",
    "dedicated allocation recycled into a pool"
);

/// USM105: Pool release did not match a reservation.
pub const USM105: Diagnostic = Diagnostic::error(
    "USM105",
    "pool release does not match any reserved range"
).with_note("the pool was left unchanged");

// =============================================================================
// USM2xx - Deferred free and residency
// =============================================================================

/// USM201: Blocking free timed out.
pub const USM201: Diagnostic = Diagnostic::warning(
    "USM201",
    "blocking free timed out waiting for GPU completion"
).with_note("the allocation stays pending and the free can be retried")
 .with_help("use a longer timeout or free with FreeMode::Deferred");

/// USM202: Deferred frees were reclaimed.
pub const USM202: Diagnostic = Diagnostic::note(
    "USM202",
    "deferred frees reclaimed"
);

/// USM203: Residency requested for a device without a backing.
pub const USM203: Diagnostic = Diagnostic::warning(
    "USM203",
    "allocation has no backing on the context's device"
).with_note("the residency request was ignored");

// =============================================================================
// USM9xx - Internal
// =============================================================================

/// USM901: Registry refused an overlapping range.
pub const USM901: Diagnostic = Diagnostic::error(
    "USM901",
    "new allocation overlaps a live allocation"
).with_note("this indicates a backing allocator returned memory that is still in use")
 .with_help("check the BackingAllocator implementation");

/// USM902: Cleanup released allocations that were still pending.
pub const USM902: Diagnostic = Diagnostic::warning(
    "USM902",
    "cleanup released allocations with outstanding GPU work"
);
