//! Control plane for instrumenting outgoing HTTP calls.
//!
//! `httpwatch` decides, for every request sent through an instrumented HTTP
//! client, whether the call is captured, under which configuration, and what
//! happens when the instrumentation itself fails. It does not talk HTTP and it
//! does not persist anything: adapters (see the `httpwatch-http` crate) wrap
//! the clients, and a [`CaptureSink`](sink::CaptureSink) receives the captured
//! calls.
//!
//! The pieces are:
//!
//! * [`scope`]: per-thread state (caller metadata, configuration overrides,
//!   recursion counters) with scoped, panic-safe overrides.
//! * [`config`]: the process-wide [`Config`](config::Config) and thread-scoped
//!   overrides of it.
//! * [`recursion`]: detection of instrumentation that re-enters the library
//!   it instruments.
//! * [`registry`]: idempotent hook installation and runtime enablement per
//!   [`Library`].
//! * [`failsafe`]: containment of instrumentation errors, so the protected
//!   call always proceeds.
//! * [`Interceptor`]: the hook call site tying the above together.
//!
//! # Getting started
//!
//! ```
//! use httpwatch::config::{self, ConfigOverrides};
//! use httpwatch::registry::Registry;
//! use httpwatch::sink::{CaptureSink, CapturedCall, RequestSummary, ResponseSummary};
//! use httpwatch::{Error, Interceptor, Library};
//! use std::sync::{Arc, Mutex};
//!
//! #[derive(Debug, Default)]
//! struct PrintSink(Mutex<Vec<String>>);
//!
//! impl CaptureSink for PrintSink {
//!     fn record(&self, call: &CapturedCall) -> httpwatch::Result<()> {
//!         self.0.lock()?.push(call.url.clone());
//!         Ok(())
//!     }
//! }
//!
//! // Adapters install their hook once, typically at startup.
//! let registry = Arc::new(Registry::with_probe(|_| true));
//! registry.install(Library::Reqwest, || Ok(())).unwrap();
//! let hook = Interceptor::new(Library::Reqwest, registry);
//!
//! let sink = Arc::new(PrintSink::default());
//! let overrides = ConfigOverrides::new().with_sink(sink.clone());
//! let status = config::with_configuration(overrides, || {
//!     hook.intercept(
//!         RequestSummary::new("GET", "https://api.example.com/users"),
//!         || Ok::<_, Error>(200u16),
//!         |outcome| match outcome {
//!             Ok(status) => ResponseSummary::new(*status),
//!             Err(err) => ResponseSummary::failed(err),
//!         },
//!     )
//! })
//! .unwrap()
//! .unwrap();
//!
//! assert_eq!(status, 200);
//! assert_eq!(sink.0.lock().unwrap().len(), 1);
//! ```
//!
//! # Crate Feature Flags
//!
//! * `internal-logs`: forward the crate's own diagnostics to `tracing`.
//!   Enabled by default.
//! * `testing`: in-memory sinks and loggers, and test-only registry resets.
//! * `reqwest`, `hyper`: mark the corresponding target library as linked into
//!   the process. Set by the `httpwatch-http` adapter features.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(
    docsrs,
    feature(doc_cfg, doc_auto_cfg),
    deny(rustdoc::broken_intra_doc_links)
)]

pub mod config;
mod error;
pub mod failsafe;
pub mod global;
mod interceptor;
mod internal_logging;
mod library;
pub mod recursion;
pub mod registry;
pub mod scope;
pub mod sink;

#[cfg(any(feature = "testing", test))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "testing", test))))]
pub mod testing;

pub use error::{BoxError, Error, ErrorClass, Result};
pub use interceptor::Interceptor;
pub use library::Library;

#[doc(hidden)]
#[cfg(feature = "internal-logs")]
pub mod _private {
    pub use tracing::{debug, error, info, warn}; // re-export
}
