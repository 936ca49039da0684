//! Detection of self-referential instrumentation.
//!
//! Interception hooks run caller and sink code (loggers, serializers,
//! persistence) that may itself issue HTTP requests through the instrumented
//! library. Every hook entry bumps a per-library depth counter in the scoped
//! context; [`check`] compares it with the configured threshold before a call
//! is captured.
use crate::config::{Config, RecursionMode};
use crate::scope::{self, Attribute, ScopeGuard};
use crate::{httpwatch_debug, Error, Library, Result};

/// Current hook nesting depth for `library` on this thread.
pub fn depth(library: Library) -> usize {
    scope::depth(library).unwrap_or(0)
}

/// Bumps the depth for `library`, returning the new depth.
pub fn increment(library: Library) -> Result<usize> {
    scope::update_depth(library, |depth| depth.saturating_add(1))
}

/// Lowers the depth for `library`, returning the new depth.
///
/// The depth never goes below zero: an unmatched decrement is ignored.
pub fn decrement(library: Library) -> Result<usize> {
    scope::update_depth(library, |depth| depth.saturating_sub(1))
}

/// Whether a hook for `library` is already running on this thread.
pub fn in_recursion(library: Library) -> bool {
    depth(library) > 0
}

/// Decides whether a call through `library` at the current depth may be
/// captured.
///
/// Below `config.max_recursion_depth` this returns `Ok(true)`. At or past it,
/// lenient mode returns `Ok(false)` and strict mode fails with
/// [`Error::SelfReferentialInstrumentation`]. Either way the call itself is
/// not affected by the outcome.
pub fn check(library: Library, config: &Config) -> Result<bool> {
    let depth = depth(library);
    if depth < config.max_recursion_depth {
        return Ok(true);
    }
    match config.recursion {
        RecursionMode::Strict => Err(Error::SelfReferentialInstrumentation { library, depth }),
        RecursionMode::Lenient => {
            httpwatch_debug!(
                name: "Recursion.CaptureSkipped",
                library = library.name(),
                depth = depth
            );
            Ok(false)
        }
    }
}

/// Holds one level of hook nesting for a library.
///
/// Dropping the guard puts the depth back to its value before [`enter`],
/// on every exit path.
#[derive(Debug)]
#[must_use = "dropping the guard leaves the hook immediately"]
pub struct DepthGuard {
    library: Library,
    _scope: ScopeGuard,
}

impl DepthGuard {
    /// The library this guard counts for.
    pub fn library(&self) -> Library {
        self.library
    }
}

/// Enters one level of hook nesting for `library`.
pub fn enter(library: Library) -> Result<DepthGuard> {
    let scope = scope::enter([], [Attribute::RecursionDepth(library)])?;
    increment(library)?;
    Ok(DepthGuard {
        library,
        _scope: scope,
    })
}
