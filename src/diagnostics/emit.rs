//! Diagnostic emission backend.
//!
//! Handles outputting diagnostics to stderr, the `log` facade, or custom sinks.

#[cfg(any(debug_assertions, feature = "diagnostics"))]
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::kind::{Diagnostic, DiagnosticKind};
use crate::sync::lock::Mutex;

/// Global flag to suppress diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Global flag to print notes as well as errors and warnings.
static VERBOSE_DIAGNOSTICS: AtomicBool = AtomicBool::new(false);

/// Suppress all diagnostic output.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Print notes to stderr too.
pub fn set_verbose(verbose: bool) {
    VERBOSE_DIAGNOSTICS.store(verbose, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Emit a diagnostic.
///
/// Errors and warnings go to stderr in debug builds or with the
/// `diagnostics` feature; notes only when verbose. With the `log` feature
/// every diagnostic is also forwarded to the `log` facade.
pub fn emit(diag: &Diagnostic) {
    emit_with_context(diag, "");
}

/// Emit a diagnostic with additional runtime context.
pub fn emit_with_context(diag: &Diagnostic, context: &str) {
    if is_suppressed() {
        return;
    }

    #[cfg(any(debug_assertions, feature = "diagnostics"))]
    {
        if diag.kind != DiagnosticKind::Note || VERBOSE_DIAGNOSTICS.load(Ordering::Relaxed) {
            emit_to_stderr(diag, context);
        }
    }

    #[cfg(feature = "log")]
    emit_to_log(diag, context);
}

#[cfg(any(debug_assertions, feature = "diagnostics"))]
fn emit_to_stderr(diag: &Diagnostic, context: &str) {
    let mut stderr = std::io::stderr().lock();

    let _ = writeln!(
        stderr,
        "[usmalloc][{}] {}: {}",
        diag.code,
        diag.kind.prefix(),
        diag.message
    );
    if !context.is_empty() {
        let _ = writeln!(stderr, "  context: {}", context);
    }
    if let Some(note) = diag.note {
        let _ = writeln!(stderr, "  note: {}", note);
    }
    if let Some(help) = diag.help {
        let _ = writeln!(stderr, "  help: {}", help);
    }
}

/// Emit a diagnostic using the log crate.
#[cfg(feature = "log")]
pub fn emit_to_log(diag: &Diagnostic, context: &str) {
    match diag.kind {
        DiagnosticKind::Error => log::error!("[{}] {} {}", diag.code, diag.message, context),
        DiagnosticKind::Warning => log::warn!("[{}] {} {}", diag.code, diag.message, context),
        DiagnosticKind::Note => log::info!("[{}] {} {}", diag.code, diag.message, context),
    }

    if let Some(note) = diag.note {
        log::debug!("  note: {}", note);
    }
    if let Some(help) = diag.help {
        log::debug!("  help: {}", help);
    }
}

/// A diagnostic sink for custom output.
///
/// Attach one to an [`AllocationManager`](crate::AllocationManager) to
/// observe its diagnostics without going through stderr.
pub trait DiagnosticSink: Send + Sync {
    /// Handle a diagnostic.
    fn emit(&self, diag: &Diagnostic, context: &str);
}

/// A simple sink that collects diagnostics.
#[derive(Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<(Diagnostic, String)>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected diagnostics.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().iter().map(|(d, _)| d.clone()).collect()
    }

    /// Codes of all collected diagnostics, in emission order.
    pub fn codes(&self) -> Vec<&'static str> {
        self.diagnostics.lock().iter().map(|(d, _)| d.code).collect()
    }

    /// Context strings recorded for `code`.
    pub fn contexts(&self, code: &str) -> Vec<String> {
        self.diagnostics
            .lock()
            .iter()
            .filter(|(d, _)| d.code == code)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Clear collected diagnostics.
    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }

    /// Check if any errors were collected.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .lock()
            .iter()
            .any(|(d, _)| d.kind == DiagnosticKind::Error)
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diag: &Diagnostic, context: &str) {
        self.diagnostics.lock().push((diag.clone(), context.to_owned()));
    }
}

/// Emits diagnostics globally and to an optional per-owner sink.
#[derive(Clone, Default)]
pub struct Reporter {
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl Reporter {
    /// A reporter that also forwards to `sink`.
    pub fn with_sink(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Emit `diag` with runtime context.
    pub fn report(&self, diag: &Diagnostic, context: &str) {
        emit_with_context(diag, context);
        if let Some(sink) = &self.sink {
            sink.emit(diag, context);
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
