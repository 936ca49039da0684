//! Collaborator interfaces: where captured calls and diagnostics go.
//!
//! The control plane does not persist or format anything itself. A
//! [`CaptureSink`] receives every captured call, and a [`DiagnosticLogger`]
//! receives one [`Diagnostic`] per instrumentation error contained by the
//! failsafe boundary. Both are configured through
//! [`Config`](crate::config::Config).
use crate::config::Config;
use crate::scope::{Loggable, Metadata};
use crate::{httpwatch_error, ErrorClass, Library, Result};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

/// Receives captured calls.
///
/// Implementations may do I/O; errors they return are contained by the
/// failsafe boundary and never reach the instrumented call.
pub trait CaptureSink: Debug + Send + Sync {
    /// Records one captured call.
    fn record(&self, call: &CapturedCall) -> Result<()>;
}

/// Receives diagnostics about contained instrumentation errors.
pub trait DiagnosticLogger: Debug + Send + Sync {
    /// Logs one diagnostic.
    fn log(&self, diagnostic: &Diagnostic);
}

/// A contained instrumentation error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// The guarded operation that failed.
    pub operation: &'static str,
    /// Classification of the error.
    pub class: ErrorClass,
    /// The error message.
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.operation, self.class, self.message)
    }
}

/// The default [`DiagnosticLogger`], forwarding to the internal logging
/// macros (and so to `tracing` with the `internal-logs` feature).
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl DiagnosticLogger for TracingLogger {
    fn log(&self, diagnostic: &Diagnostic) {
        httpwatch_error!(
            name: "Failsafe.Contained",
            operation = diagnostic.operation,
            error_class = diagnostic.class.as_str(),
            message = diagnostic.message.as_str()
        );
    }
}

/// A request or response body, possibly cut down to the configured size.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BodyPreview {
    /// The kept bytes.
    pub bytes: Vec<u8>,
    /// Size of the body before truncation.
    pub original_len: usize,
}

impl BodyPreview {
    /// Keeps at most `max_len` bytes of `body`.
    pub fn new(body: &[u8], max_len: usize) -> Self {
        BodyPreview {
            bytes: body[..body.len().min(max_len)].to_vec(),
            original_len: body.len(),
        }
    }

    /// Whether bytes were dropped.
    pub fn is_truncated(&self) -> bool {
        self.bytes.len() < self.original_len
    }

    /// The kept bytes as UTF-8, if they are valid.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

/// What a hook knows about an outgoing request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestSummary {
    /// HTTP method.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Header name/value pairs, in request order.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
}

impl RequestSummary {
    /// Summarizes a request without headers or body.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        RequestSummary {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// The `content-type` header, if present.
    pub fn content_type(&self) -> Option<&str> {
        find_header(&self.headers, "content-type")
    }
}

/// What a hook knows about the outcome of a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseSummary {
    /// HTTP status code, absent when no response was received.
    pub status: Option<u16>,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
    /// Error message when the call failed.
    pub error: Option<String>,
}

impl ResponseSummary {
    /// Summarizes a received response.
    pub fn new(status: u16) -> Self {
        ResponseSummary {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Summarizes a call that failed before a response was received.
    pub fn failed(error: &dyn fmt::Display) -> Self {
        ResponseSummary {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// The `content-type` header, if present.
    pub fn content_type(&self) -> Option<&str> {
        find_header(&self.headers, "content-type")
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// One captured call, as handed to a [`CaptureSink`].
#[derive(Clone, Debug)]
pub struct CapturedCall {
    /// The library the call went through.
    pub library: Library,
    /// HTTP method.
    pub method: String,
    /// Full request URL.
    pub url: String,
    /// Request headers.
    pub request_headers: Vec<(String, String)>,
    /// Request body, truncated to `options.max_body_size`.
    pub request_body: BodyPreview,
    /// Response status, absent if the call failed.
    pub status: Option<u16>,
    /// Response headers.
    pub response_headers: Vec<(String, String)>,
    /// Response body, truncated to `options.max_body_size`.
    pub response_body: BodyPreview,
    /// Error message of a failed call.
    pub error: Option<String>,
    /// Wall time of the protected call.
    pub duration: Duration,
    /// Caller metadata in scope when the call was made.
    pub metadata: Option<Metadata>,
    /// Caller association in scope when the call was made.
    pub loggable: Option<Loggable>,
    /// The effective configuration the call was captured under.
    pub options: Arc<Config>,
}

impl CapturedCall {
    /// Assembles a captured call, truncating bodies per `options`.
    pub fn new(
        library: Library,
        request: RequestSummary,
        response: ResponseSummary,
        duration: Duration,
        options: Arc<Config>,
    ) -> Self {
        let max = options.max_body_size;
        CapturedCall {
            library,
            request_body: BodyPreview::new(&request.body, max),
            method: request.method,
            url: request.url,
            request_headers: request.headers,
            response_body: BodyPreview::new(&response.body, max),
            status: response.status,
            response_headers: response.headers,
            error: response.error,
            duration,
            metadata: crate::scope::metadata(),
            loggable: crate::scope::loggable(),
            options,
        }
    }

    /// Whether the call completed with a 2xx status.
    pub fn is_success(&self) -> bool {
        matches!(self.status, Some(200..=299))
    }

    /// Request headers with sensitive values replaced by `[FILTERED]`.
    pub fn redacted_request_headers(&self) -> Vec<(String, String)> {
        self.request_headers
            .iter()
            .map(|(name, value)| {
                if self.options.is_sensitive_header(name) {
                    (name.clone(), "[FILTERED]".to_owned())
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect()
    }
}
