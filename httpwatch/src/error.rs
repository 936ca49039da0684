//! Error type shared by every part of the control plane.
use crate::Library;
use std::fmt;
use std::sync::PoisonError;

/// Boxed error produced by a collaborator such as a capture sink.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized `Result` type for control plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised inside the instrumentation path.
///
/// Which of these reach the caller is decided by the
/// [failsafe boundary](crate::failsafe::guard) according to
/// [`Error::class`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A storage backend behind a capture sink failed.
    #[error("storage failure: {0}")]
    Storage(#[source] BoxError),

    /// A collaborator could not be reached.
    #[error("connection failure: {0}")]
    Connection(#[source] BoxError),

    /// Captured request or response data could not be processed.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// A control plane API was called with an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A scoped context attribute name that is not part of the attribute set.
    #[error("unknown context attribute `{0}`")]
    UnknownAttribute(String),

    /// A target library name that is not supported.
    #[error("unknown target library `{0}`")]
    UnknownLibrary(String),

    /// Instrumentation re-entered the same library past the configured depth.
    #[error(
        "self-referential instrumentation: {library} hook re-entered at depth {depth}; \
         a capture sink or logger is probably issuing requests through the instrumented client"
    )]
    SelfReferentialInstrumentation {
        /// The library whose hook was re-entered.
        library: Library,
        /// The recursion depth observed when the check ran.
        depth: usize,
    },

    /// Thread-local storage for the scoped context has already been torn down.
    #[error("scoped context storage is unavailable on this thread")]
    ContextUnavailable,

    /// Instrumentation code panicked.
    #[error("instrumentation panicked: {0}")]
    Panicked(String),

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classifies this error for the failsafe boundary.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Storage(_) | Error::Connection(_) | Error::ContextUnavailable => {
                ErrorClass::Environment
            }
            Error::MalformedData(_) => ErrorClass::MalformedData,
            Error::InvalidArgument(_) | Error::UnknownAttribute(_) | Error::UnknownLibrary(_) => {
                ErrorClass::Programmer
            }
            Error::SelfReferentialInstrumentation { .. } => ErrorClass::Recursion,
            Error::Panicked(_) | Error::Other(_) => ErrorClass::Generic,
        }
    }

    /// Whether this error indicates a defect in the calling code.
    pub fn is_programmer_error(&self) -> bool {
        self.class() == ErrorClass::Programmer
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(err: PoisonError<T>) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedData(err.to_string())
    }
}

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection, storage or resource failures in the environment.
    Environment,
    /// Data that could not be parsed or serialized.
    MalformedData,
    /// Invalid arguments, unknown names and other caller defects.
    Programmer,
    /// Self-referential instrumentation in strict recursion mode.
    Recursion,
    /// Anything else, including panics.
    Generic,
}

impl ErrorClass {
    /// Stable name used in diagnostics.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Environment => "environment",
            ErrorClass::MalformedData => "malformed_data",
            ErrorClass::Programmer => "programmer",
            ErrorClass::Recursion => "recursion",
            ErrorClass::Generic => "generic",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
