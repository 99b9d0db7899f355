//! Engine Diagnostics
//!
//! The engine keeps running through two kinds of non-fatal faults: an
//! observer callback failing during a notification, and a propagation pass
//! that cannot find a ready node. Both are reported as structured
//! [`Diagnostic`] events through an injectable [`DiagnosticSink`] rather
//! than raised, so fault isolation stays observable and testable.
//!
//! The default sink forwards to `tracing`. Tests typically install a
//! [`MemorySink`] and assert on the recorded events.

use parking_lot::Mutex;
use tracing::warn;

/// A non-fatal condition reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// An observer callback failed during `notify`; the remaining
    /// observers were still invoked.
    CallbackFailed { node: String, error: String },

    /// A propagation pass found no pending node with all dependencies
    /// resolved and forced progress by picking one arbitrarily.
    PropagationStalled { forced: String },
}

/// Sink for engine diagnostics.
pub trait DiagnosticSink: Send + Sync {
    /// Report a non-fatal condition.
    fn emit(&self, diagnostic: Diagnostic);
}

/// Default sink forwarding diagnostics to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::CallbackFailed { node, error } => {
                warn!(node = %node, error = %error, "node failed to notify");
            }
            Diagnostic::PropagationStalled { forced } => {
                warn!(forced = %forced, "propagation deadlocked");
            }
        }
    }
}

/// Recording sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    /// Create an empty recording sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of the recorded events, in emission order.
    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().clone()
    }

    /// Drop all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, diagnostic: Diagnostic) {
        self.events.lock().push(diagnostic);
    }
}
