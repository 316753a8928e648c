/// Minimal test-reporting capability: a line sink plus a failure-state query.
///
/// The harness components never talk to a particular test framework; they
/// write human-readable diagnostic lines to a `Reporter` and ask it whether
/// the current test has failed (to decide on post-mortem output).
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub trait Reporter: Send + Sync {
    /// Record one diagnostic line for the current test.
    fn log(&self, line: &str);

    /// Whether the current test is already in a failed state.
    fn failed(&self) -> bool;
}

/// Forwards lines to `tracing`, tagged with the test name.
#[derive(Debug)]
pub struct TracingReporter {
    test: String,
    failed: AtomicBool,
}

impl TracingReporter {
    pub fn new(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            failed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.test
    }

    /// Flag the test as failed; later teardown will dump captured output.
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

impl Reporter for TracingReporter {
    fn log(&self, line: &str) {
        tracing::info!(test = %self.test, "{line}");
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Discards every line and never reports failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn log(&self, _line: &str) {}

    fn failed(&self) -> bool {
        false
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    lines: Mutex<Vec<String>>,
    failed: AtomicBool,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Snapshot of the lines logged so far.
    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// True if any logged line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl Reporter for MemoryReporter {
    fn log(&self, line: &str) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push(line.to_string());
    }

    fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}
