//! Operator-visible reporting of failures that never reach a caller.

pub trait ErrorReporter: Send + Sync {
    fn capture_exception(&self, category: &str, error: &anyhow::Error);
}

/// Reports through the tracing pipeline at error level.
#[derive(Debug, Default, Clone)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn capture_exception(&self, category: &str, error: &anyhow::Error) {
        tracing::error!(category = %category, error = ?error, "Captured exception");
    }
}

/// Keeps every captured error for inspection.
pub struct MockErrorReporter {
    pub captured: std::sync::Mutex<Vec<(String, String)>>,
}

impl Default for MockErrorReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockErrorReporter {
    pub fn new() -> Self {
        Self {
            captured: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn captured(&self) -> Vec<(String, String)> {
        self.captured
            .lock()
            .map(|captured| captured.clone())
            .unwrap_or_default()
    }
}

impl ErrorReporter for MockErrorReporter {
    fn capture_exception(&self, category: &str, error: &anyhow::Error) {
        match self.captured.lock() {
            Ok(mut captured) => captured.push((category.to_string(), format!("{:#}", error))),
            Err(e) => tracing::error!("Mock error reporter mutex poisoned: {}", e),
        }
    }
}
