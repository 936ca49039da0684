//! The interception hook call site.
//!
//! An [`Interceptor`] wraps one call through a target library. It consults the
//! [`Registry`] on every call, so enabling or disabling a library takes effect
//! immediately. When the hook is active it:
//!
//! 1. resolves the [effective configuration](crate::config::effective) and
//!    asks the recursion guard whether this call may be captured;
//! 2. enters one level of hook nesting for the library and marks the call as
//!    in flight, both undone on every exit path;
//! 3. runs the protected call;
//! 4. hands a [`CapturedCall`] to the configured sink.
//!
//! Steps 1, 2 and 4 run inside the [failsafe boundary](crate::failsafe): the
//! protected call runs exactly once and its outcome is returned unchanged
//! unless the boundary surfaces an error, which is converted into the call's
//! error type.
use crate::config::{self, Config};
use crate::recursion::{self, DepthGuard};
use crate::registry::Registry;
use crate::scope::{
    self, Attribute, AttributeValue, InFlight, ScopeFutureExt, ScopeGuard, Snapshot,
};
use crate::sink::{CaptureSink, CapturedCall, RequestSummary, ResponseSummary};
use crate::{failsafe, global, Error, Library, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wraps calls through one target library.
#[derive(Clone, Debug)]
pub struct Interceptor {
    library: Library,
    registry: Arc<Registry>,
}

/// A call that passed admission, with what is needed to record it.
struct Admitted {
    config: Arc<Config>,
    sink: Arc<dyn CaptureSink>,
}

/// Scope held for the duration of one hooked call. Fields drop in reverse
/// order of entry.
struct HookGuard {
    _in_flight: ScopeGuard,
    _depth: DepthGuard,
}

impl Interceptor {
    /// Creates an interceptor for `library` consulting `registry`.
    pub fn new(library: Library, registry: Arc<Registry>) -> Self {
        Interceptor { library, registry }
    }

    /// Creates an interceptor for `library` consulting the global registry.
    pub fn global(library: Library) -> Self {
        Interceptor::new(library, global::registry())
    }

    /// The library this interceptor wraps.
    pub fn library(&self) -> Library {
        self.library
    }

    /// The registry consulted on every call.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Whether the next call on this thread will go through the hook.
    pub fn is_active(&self) -> bool {
        self.registry.is_active(self.library) && !scope::patches_disabled()
    }

    /// Runs the blocking `call`, capturing it if the hook is active.
    ///
    /// `summarize` turns the outcome into a [`ResponseSummary`]; it is only
    /// invoked when the call is captured.
    pub fn intercept<T, E, C, S>(
        &self,
        request: RequestSummary,
        call: C,
        summarize: S,
    ) -> std::result::Result<T, E>
    where
        C: FnOnce() -> std::result::Result<T, E>,
        S: FnOnce(&std::result::Result<T, E>) -> ResponseSummary,
        E: From<Error>,
    {
        if !self.is_active() {
            return call();
        }
        let admitted = self.admit(&request)?;
        let started_at = Instant::now();
        let _hook = self.enter_hook(started_at)?;

        let outcome = call();
        if let Some(admitted) = admitted {
            self.record(admitted, request, || summarize(&outcome), started_at.elapsed())?;
        }
        outcome
    }

    /// Awaits `call`, capturing it if the hook is active.
    ///
    /// The scope the call runs in (hook nesting and in-flight marker included)
    /// travels with the future, so it stays correct when the future is polled
    /// on different threads.
    pub async fn intercept_async<T, E, F, S>(
        &self,
        request: RequestSummary,
        call: F,
        summarize: S,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        S: FnOnce(&std::result::Result<T, E>) -> ResponseSummary,
        E: From<Error>,
    {
        if !self.is_active() {
            return call.await;
        }
        let admitted = self.admit(&request)?;
        let started_at = Instant::now();
        let snapshot = self.hook_snapshot(started_at)?;

        let outcome = match &snapshot {
            Some(snapshot) => call.in_scope(snapshot.clone()).await,
            None => call.await,
        };
        if let Some(admitted) = admitted {
            self.record_in(
                snapshot.as_ref(),
                admitted,
                request,
                || summarize(&outcome),
                started_at.elapsed(),
            )?;
        }
        outcome
    }

    /// Decides whether the call is captured, and by which sink.
    fn admit(&self, request: &RequestSummary) -> Result<Option<Admitted>> {
        failsafe::guard("Interceptor.Admit", None, || {
            let config = config::effective();
            if !recursion::check(self.library, &config)? {
                return Ok(None);
            }
            if !config.should_capture(self.library, &request.url, request.content_type()) {
                return Ok(None);
            }
            Ok(config.sink.clone().map(|sink| Admitted { config, sink }))
        })
    }

    fn enter_hook(&self, started_at: Instant) -> Result<Option<HookGuard>> {
        failsafe::guard("Interceptor.Enter", None, || {
            let depth = recursion::enter(self.library)?;
            let in_flight = scope::enter(
                [(
                    Attribute::InFlight,
                    AttributeValue::InFlight(InFlight {
                        library: self.library,
                        started_at,
                    }),
                )],
                [],
            )?;
            Ok(Some(HookGuard {
                _in_flight: in_flight,
                _depth: depth,
            }))
        })
    }

    // The hook scope is captured as a snapshot and left again right away: the
    // guards are tied to this thread and must not be held across an await.
    fn hook_snapshot(&self, started_at: Instant) -> Result<Option<Snapshot>> {
        let Some(hook) = self.enter_hook(started_at)? else {
            return Ok(None);
        };
        let snapshot =
            failsafe::guard("Interceptor.Enter", None, || scope::snapshot_all().map(Some));
        drop(hook);
        snapshot
    }

    fn record_in(
        &self,
        snapshot: Option<&Snapshot>,
        admitted: Admitted,
        request: RequestSummary,
        response: impl FnOnce() -> ResponseSummary,
        duration: Duration,
    ) -> Result<()> {
        let _scope = snapshot.and_then(|snapshot| snapshot.attach().ok());
        self.record(admitted, request, response, duration)
    }

    fn record(
        &self,
        admitted: Admitted,
        request: RequestSummary,
        response: impl FnOnce() -> ResponseSummary,
        duration: Duration,
    ) -> Result<()> {
        failsafe::guard("Interceptor.Record", (), || {
            let response = response();
            if response
                .content_type()
                .is_some_and(|content_type| admitted.config.is_content_type_excluded(content_type))
            {
                return Ok(());
            }
            let call =
                CapturedCall::new(self.library, request, response, duration, admitted.config);
            admitted.sink.record(&call)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{with_configuration, ConfigOverrides, RecursionMode};
    use crate::scope::{Loggable, Metadata};
    use crate::testing::{baseline_overrides, InMemoryCaptureSink, InMemoryDiagnosticLogger};
    use std::fmt;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq)]
    enum CallError {
        Transport(String),
        Instrumentation(String),
    }

    impl From<Error> for CallError {
        fn from(err: Error) -> Self {
            CallError::Instrumentation(err.to_string())
        }
    }

    impl fmt::Display for CallError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn installed(library: Library) -> Interceptor {
        let registry = Arc::new(Registry::with_probe(|_| true));
        registry.install(library, || Ok(())).unwrap();
        Interceptor::new(library, registry)
    }

    fn get(url: &str) -> RequestSummary {
        RequestSummary::new("GET", url)
    }

    fn summarize(outcome: &std::result::Result<u16, CallError>) -> ResponseSummary {
        match outcome {
            Ok(status) => ResponseSummary::new(*status).with_body("ok"),
            Err(err) => ResponseSummary::failed(err),
        }
    }

    fn with_sink<R>(sink: &InMemoryCaptureSink, body: impl FnOnce() -> R) -> R {
        with_configuration(baseline_overrides().with_sink(Arc::new(sink.clone())), body).unwrap()
    }

    #[test]
    fn captures_active_calls() {
        let interceptor = installed(Library::Reqwest);
        let sink = InMemoryCaptureSink::new();

        let mut metadata = Metadata::new();
        metadata.insert("job".into(), "nightly-sync".into());
        let outcome = with_sink(&sink, || {
            scope::with_metadata(metadata, || {
                interceptor.intercept(get("https://api.example.com/users"), || Ok(200), summarize)
            })
            .unwrap()
        });

        assert_eq!(outcome, Ok(200));
        let calls = sink.get_captured_calls().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].library, Library::Reqwest);
        assert_eq!(calls[0].status, Some(200));
        assert_eq!(calls[0].metadata.as_ref().unwrap()["job"], "nightly-sync");
        assert_eq!(recursion::depth(Library::Reqwest), 0);
        assert!(scope::in_flight().is_none());
    }

    #[test]
    fn failed_calls_are_captured_and_returned_unchanged() {
        let interceptor = installed(Library::Reqwest);
        let sink = InMemoryCaptureSink::new();

        let outcome = with_sink(&sink, || {
            interceptor.intercept(
                get("https://api.example.com/users"),
                || Err(CallError::Transport("connection refused".into())),
                summarize,
            )
        });

        assert_eq!(outcome, Err(CallError::Transport("connection refused".into())));
        let calls = sink.get_captured_calls().unwrap();
        assert_eq!(calls[0].status, None);
        assert!(calls[0].error.as_deref().unwrap().contains("connection refused"));
    }

    #[test]
    fn toggling_takes_effect_without_reinstall() {
        let interceptor = installed(Library::Hyper);
        let sink = InMemoryCaptureSink::new();

        with_sink(&sink, || {
            interceptor.registry().disable(Library::Hyper);
            assert!(!interceptor.is_active());
            interceptor
                .intercept(get("https://api.example.com/a"), || Ok(200), summarize)
                .unwrap();

            interceptor.registry().enable(Library::Hyper);
            interceptor
                .intercept(get("https://api.example.com/b"), || Ok(200), summarize)
                .unwrap();
        });

        let calls = sink.get_captured_calls().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://api.example.com/b");
    }

    #[test]
    fn uninstalled_hook_passes_through() {
        let registry = Arc::new(Registry::with_probe(|_| true));
        let interceptor = Interceptor::new(Library::Reqwest, registry);
        let sink = InMemoryCaptureSink::new();

        with_sink(&sink, || {
            interceptor
                .intercept(get("https://api.example.com"), || Ok(200), summarize)
                .unwrap();
        });
        assert!(sink.get_captured_calls().unwrap().is_empty());
    }

    #[test]
    fn patches_disabled_bypasses_the_hook() {
        let interceptor = installed(Library::Reqwest);
        let sink = InMemoryCaptureSink::new();

        with_sink(&sink, || {
            scope::without_patches(|| {
                interceptor
                    .intercept(get("https://api.example.com"), || Ok(200), summarize)
                    .unwrap();
            })
            .unwrap();
        });
        assert!(sink.get_captured_calls().unwrap().is_empty());
    }

    #[test]
    fn exclusions_skip_capture_but_not_the_call() {
        let interceptor = installed(Library::Reqwest);
        let sink = InMemoryCaptureSink::new();
        let overrides = ConfigOverrides::new()
            .with_excluded_urls(vec![regex::Regex::new("/health$").unwrap()]);

        let executed = Mutex::new(0);
        with_sink(&sink, || {
            with_configuration(overrides, || {
                let call = || {
                    *executed.lock().unwrap() += 1;
                    Ok(200)
                };
                interceptor
                    .intercept(get("https://api.example.com/health"), call, summarize)
                    .unwrap();
                let image = |_: &std::result::Result<u16, CallError>| {
                    ResponseSummary::new(200).with_header("Content-Type", "image/png")
                };
                interceptor
                    .intercept(get("https://cdn.example.com/logo"), || Ok(200), image)
                    .unwrap();
            })
            .unwrap();
        });

        assert_eq!(*executed.lock().unwrap(), 1);
        assert!(sink.get_captured_calls().unwrap().is_empty());
    }

    #[test]
    fn sink_failure_is_contained() {
        let interceptor = installed(Library::Reqwest);
        let logger = InMemoryDiagnosticLogger::new();
        let overrides = baseline_overrides()
            .with_sink(Arc::new(InMemoryCaptureSink::failing("database is locked")))
            .with_logger(Arc::new(logger.clone()));

        let outcome = with_configuration(overrides, || {
            interceptor.intercept(get("https://api.example.com"), || Ok(201), summarize)
        })
        .unwrap();

        assert_eq!(outcome, Ok(201));
        let diagnostics = logger.get_diagnostics().unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].operation, "Interceptor.Record");
    }

    #[test]
    fn sink_failure_surfaces_in_strict_mode() {
        let interceptor = installed(Library::Reqwest);
        let overrides = baseline_overrides()
            .with_sink(Arc::new(InMemoryCaptureSink::failing("database is locked")))
            .with_strict_errors(true);

        let outcome = with_configuration(overrides, || {
            interceptor.intercept(get("https://api.example.com"), || Ok(201), summarize)
        })
        .unwrap();

        match outcome {
            Err(CallError::Instrumentation(message)) => {
                assert!(message.contains("database is locked"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn failed_call_with_failing_sink_keeps_its_error() {
        let interceptor = installed(Library::Reqwest);
        let logger = InMemoryDiagnosticLogger::new();
        let overrides = baseline_overrides()
            .with_sink(Arc::new(InMemoryCaptureSink::failing("database is locked")))
            .with_logger(Arc::new(logger.clone()));

        let outcome = with_configuration(overrides, || {
            interceptor.intercept(
                get("https://api.example.com"),
                || Err(CallError::Transport("connection reset".into())),
                summarize,
            )
        })
        .unwrap();

        assert_eq!(outcome, Err(CallError::Transport("connection reset".into())));
        let diagnostics = logger.get_diagnostics().unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].operation, "Interceptor.Record");
    }

    #[test]
    fn panicking_summarizer_is_contained() {
        let interceptor = installed(Library::ReqwestBlocking);
        let sink = InMemoryCaptureSink::new();

        let summarize = |_: &std::result::Result<u16, CallError>| -> ResponseSummary {
            panic!("summarizer bug")
        };
        let outcome = with_sink(&sink, || {
            interceptor.intercept(get("https://api.example.com"), || Ok(200), summarize)
        });

        assert_eq!(outcome, Ok(200));
        assert!(sink.get_captured_calls().unwrap().is_empty());
        assert_eq!(recursion::depth(Library::ReqwestBlocking), 0);
    }

    /// A sink that issues a request through the same library while
    /// recording, like a log shipper posting over HTTP.
    #[derive(Debug)]
    struct ReentrantSink {
        interceptor: Interceptor,
        inner: InMemoryCaptureSink,
        nested: Mutex<Vec<std::result::Result<u16, CallError>>>,
    }

    impl CaptureSink for ReentrantSink {
        fn record(&self, call: &CapturedCall) -> Result<()> {
            self.inner.record(call)?;
            let outcome = self
                .interceptor
                .intercept(get("https://logs.example.com/ingest"), || Ok(202), summarize);
            self.nested.lock()?.push(outcome);
            Ok(())
        }
    }

    fn reentrant(library: Library) -> Arc<ReentrantSink> {
        Arc::new(ReentrantSink {
            interceptor: installed(library),
            inner: InMemoryCaptureSink::new(),
            nested: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn nested_calls_from_the_sink_are_not_captured_past_the_threshold() {
        let sink = reentrant(Library::Reqwest);
        let overrides = baseline_overrides()
            .with_max_recursion_depth(1)
            .with_sink(sink.clone());

        let outcome = with_configuration(overrides, || {
            sink.interceptor
                .intercept(get("https://api.example.com/orders"), || Ok(200), summarize)
        })
        .unwrap();

        assert_eq!(outcome, Ok(200));
        let captured = sink.inner.get_captured_calls().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].url, "https://api.example.com/orders");
        assert_eq!(*sink.nested.lock().unwrap(), vec![Ok(202)]);
        assert_eq!(recursion::depth(Library::Reqwest), 0);
    }

    #[test]
    fn strict_recursion_reports_the_nested_call() {
        let sink = reentrant(Library::Hyper);
        let overrides = baseline_overrides()
            .with_max_recursion_depth(1)
            .with_recursion_mode(RecursionMode::Strict)
            .with_sink(sink.clone());

        let outcome = with_configuration(overrides, || {
            sink.interceptor
                .intercept(get("https://api.example.com/orders"), || Ok(200), summarize)
        })
        .unwrap();

        assert_eq!(outcome, Ok(200));
        let nested = sink.nested.lock().unwrap();
        match &nested[0] {
            Err(CallError::Instrumentation(message)) => {
                assert!(message.contains("hyper"));
                assert!(message.contains("depth 1"));
            }
            other => panic!("unexpected nested outcome: {other:?}"),
        }
    }

    #[test]
    fn loggable_is_attached() {
        #[derive(Debug, PartialEq)]
        struct Order(u64);

        let interceptor = installed(Library::Reqwest);
        let sink = InMemoryCaptureSink::new();
        with_sink(&sink, || {
            scope::with_loggable(Loggable::new(Order(42)), || {
                interceptor
                    .intercept(get("https://api.example.com/orders/42"), || Ok(200), summarize)
                    .unwrap();
            })
            .unwrap();
        });

        let calls = sink.get_captured_calls().unwrap();
        let loggable = calls[0].loggable.as_ref().unwrap();
        assert_eq!(loggable.downcast_ref::<Order>(), Some(&Order(42)));
    }

    #[tokio::test]
    async fn async_calls_keep_their_scope_across_threads() {
        let interceptor = installed(Library::Reqwest);
        let sink = InMemoryCaptureSink::new();
        let snapshot = with_sink(&sink, || {
            let mut metadata = Metadata::new();
            metadata.insert("tenant".into(), "acme".into());
            scope::with_metadata(metadata, || scope::snapshot_all().unwrap()).unwrap()
        });

        let task = {
            let interceptor = interceptor.clone();
            async move {
                interceptor
                    .intercept_async(
                        get("https://api.example.com/async"),
                        async {
                            assert_eq!(recursion::depth(Library::Reqwest), 1);
                            assert!(scope::in_flight().is_some());
                            tokio::task::yield_now().await;
                            Ok::<_, CallError>(200)
                        },
                        summarize,
                    )
                    .await
            }
            .in_scope(snapshot)
        };
        let outcome = tokio::spawn(task).await.unwrap();

        assert_eq!(outcome, Ok(200));
        let calls = sink.get_captured_calls().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].metadata.as_ref().unwrap()["tenant"], "acme");
        assert_eq!(recursion::depth(Library::Reqwest), 0);
    }

    #[tokio::test]
    async fn async_sink_failure_is_contained() {
        let interceptor = installed(Library::Reqwest);
        let logger = InMemoryDiagnosticLogger::new();
        let overrides = baseline_overrides()
            .with_sink(Arc::new(InMemoryCaptureSink::failing("database is locked")))
            .with_logger(Arc::new(logger.clone()));

        let task = with_configuration(overrides, || {
            interceptor
                .intercept_async(
                    get("https://api.example.com"),
                    async { Err(CallError::Transport("timed out".into())) },
                    summarize,
                )
                .in_current_scope()
        })
        .unwrap();

        assert_eq!(task.await, Err(CallError::Transport("timed out".into())));
        let diagnostics = logger.get_diagnostics().unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].operation, "Interceptor.Record");
    }

    #[tokio::test]
    async fn async_sink_failure_surfaces_in_strict_mode() {
        let interceptor = installed(Library::Reqwest);
        let overrides = baseline_overrides()
            .with_sink(Arc::new(InMemoryCaptureSink::failing("database is locked")))
            .with_strict_errors(true);

        let task = with_configuration(overrides, || {
            interceptor
                .intercept_async(get("https://api.example.com"), async { Ok(200) }, summarize)
                .in_current_scope()
        })
        .unwrap();

        match task.await {
            Err(CallError::Instrumentation(message)) => {
                assert!(message.contains("database is locked"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn async_strict_recursion_reports_the_nested_call() {
        let sink = reentrant(Library::Hyper);
        let overrides = baseline_overrides()
            .with_max_recursion_depth(1)
            .with_recursion_mode(RecursionMode::Strict)
            .with_sink(sink.clone());

        let task = with_configuration(overrides, || {
            let call = async { Ok(200) };
            sink.interceptor
                .intercept_async(get("https://api.example.com/orders"), call, summarize)
                .in_current_scope()
        })
        .unwrap();

        assert_eq!(task.await, Ok(200));
        assert_eq!(sink.inner.get_captured_calls().unwrap().len(), 1);
        let nested = sink.nested.lock().unwrap();
        match &nested[0] {
            Err(CallError::Instrumentation(message)) => assert!(message.contains("depth 1")),
            other => panic!("unexpected nested outcome: {other:?}"),
        }
        assert_eq!(recursion::depth(Library::Hyper), 0);
    }
}
