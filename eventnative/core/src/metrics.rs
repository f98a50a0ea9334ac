//! Error classification counter.
//!
//! Every failure path in the executors reports its [`Error::kind`] label
//! here. The host decides what a report turns into: a log line, an in-memory
//! counter, or nothing.
//!
//! [`Error::kind`]: crate::error::Error::kind

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub const NAMESPACE: &str = "eventnative";
pub const SUBSYSTEM: &str = "templates";

/// Receives one call per observed error.
pub trait ErrorReporter: Send + Sync + std::fmt::Debug {
    fn report(&self, error_type: &str);
}

/// Shared reporter handle.
pub type SharedReporter = Arc<dyn ErrorReporter>;

/// Logs every report at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, error_type: &str) {
        warn!(
            namespace = NAMESPACE,
            subsystem = SUBSYSTEM,
            error_type,
            "template error"
        );
    }
}

/// Discards every report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn report(&self, _error_type: &str) {}
}

/// Counts reports per error type.
#[derive(Debug, Default)]
pub struct CounterReporter {
    counts: Mutex<BTreeMap<String, u64>>,
}

impl CounterReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports seen for `error_type` so far.
    pub fn count(&self, error_type: &str) -> u64 {
        self.counts.lock().get(error_type).copied().unwrap_or(0)
    }

    /// All counts, keyed by error type.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts.lock().clone()
    }

    /// Fully qualified counter name, `eventnative_templates_errors`.
    pub fn metric_name(&self) -> String {
        format!("{}_{}_errors", NAMESPACE, SUBSYSTEM)
    }
}

impl ErrorReporter for CounterReporter {
    fn report(&self, error_type: &str) {
        *self.counts.lock().entry(error_type.to_string()).or_insert(0) += 1;
    }
}

pub(crate) fn default_reporter() -> SharedReporter {
    Arc::new(LogReporter)
}
