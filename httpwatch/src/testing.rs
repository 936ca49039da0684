//! In-memory collaborators for testing code that uses the control plane.
use crate::config::{ConfigOverrides, RecursionMode};
use crate::sink::{CaptureSink, CapturedCall, Diagnostic, DiagnosticLogger};
use crate::{Error, Library, Result};
use std::sync::{Arc, Mutex};

/// A capture sink that keeps every captured call in memory.
///
/// # Example
///
/// ```
/// use httpwatch::config::{self, ConfigOverrides};
/// use httpwatch::registry::Registry;
/// use httpwatch::sink::{RequestSummary, ResponseSummary};
/// use httpwatch::testing::InMemoryCaptureSink;
/// use httpwatch::{Error, Interceptor, Library};
/// use std::sync::Arc;
///
/// let sink = InMemoryCaptureSink::new();
/// let registry = Arc::new(Registry::with_probe(|_| true));
/// registry.install(Library::Reqwest, || Ok(())).unwrap();
/// let interceptor = Interceptor::new(Library::Reqwest, registry);
///
/// let overrides = ConfigOverrides::new().with_sink(Arc::new(sink.clone()));
/// config::with_configuration(overrides, || {
///     interceptor.intercept(
///         RequestSummary::new("GET", "https://api.example.com/health"),
///         || Ok::<_, Error>(200u16),
///         |_| ResponseSummary::new(200),
///     )
/// })
/// .unwrap()
/// .unwrap();
///
/// let calls = sink.get_captured_calls().unwrap();
/// assert_eq!(calls.len(), 1);
/// assert_eq!(calls[0].url, "https://api.example.com/health");
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCaptureSink {
    calls: Arc<Mutex<Vec<CapturedCall>>>,
    failure: Option<String>,
}

impl InMemoryCaptureSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink whose every `record` fails with a storage error
    /// carrying `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        InMemoryCaptureSink {
            failure: Some(message.into()),
            ..Default::default()
        }
    }

    /// Returns the captured calls, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn get_captured_calls(&self) -> Result<Vec<CapturedCall>> {
        self.calls
            .lock()
            .map(|calls| calls.iter().cloned().collect())
            .map_err(Error::from)
    }

    /// Clears the captured calls.
    pub fn reset(&self) {
        let _ = self.calls.lock().map(|mut calls| calls.clear());
    }
}

impl CaptureSink for InMemoryCaptureSink {
    fn record(&self, call: &CapturedCall) -> Result<()> {
        if let Some(message) = &self.failure {
            return Err(Error::Storage(message.clone().into()));
        }
        self.calls
            .lock()
            .map(|mut calls| calls.push(call.clone()))
            .map_err(Error::from)
    }
}

/// A diagnostic logger that keeps every diagnostic in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDiagnosticLogger {
    diagnostics: Arc<Mutex<Vec<Diagnostic>>>,
}

impl InMemoryDiagnosticLogger {
    /// Creates an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the logged diagnostics, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn get_diagnostics(&self) -> Result<Vec<Diagnostic>> {
        self.diagnostics
            .lock()
            .map(|diagnostics| diagnostics.clone())
            .map_err(Error::from)
    }

    /// Clears the logged diagnostics.
    pub fn reset(&self) {
        let _ = self
            .diagnostics
            .lock()
            .map(|mut diagnostics| diagnostics.clear());
    }
}

impl DiagnosticLogger for InMemoryDiagnosticLogger {
    fn log(&self, diagnostic: &Diagnostic) {
        let _ = self
            .diagnostics
            .lock()
            .map(|mut diagnostics| diagnostics.push(diagnostic.clone()));
    }
}

/// Overrides pinning every behavior-relevant setting to its default, so a
/// test sees the same configuration whatever the global configuration or the
/// `HTTPWATCH_*` environment variables say.
///
/// Sink and logger are left to the caller.
pub fn baseline_overrides() -> ConfigOverrides {
    let overrides = ConfigOverrides::new()
        .with_enabled(true)
        .with_excluded_urls(Vec::new())
        .with_excluded_content_types(["image/", "video/", "audio/", "font/"])
        .with_max_body_size(10_000)
        .with_recursion_mode(RecursionMode::Lenient)
        .with_max_recursion_depth(3)
        .with_strict_errors(false);
    Library::ALL
        .into_iter()
        .fold(overrides, |overrides, library| overrides.with_library(library, true))
}
