//! Configuration
//!
//! [`Config`] is the process-wide configuration. It is immutable once
//! published: [`global()`] hands out `Arc<Config>` snapshots, and changes go
//! through [`set_global`] or [`configure`], which swap in a new value.
//!
//! A thread can temporarily replace it with [`with_configuration`]. The
//! configuration that governs a call is the [`effective()`] one: the thread's
//! override if present, otherwise the global value.
use crate::scope::{self, Attribute, AttributeValue};
use crate::sink::{CaptureSink, DiagnosticLogger, TracingLogger};
use crate::{global, httpwatch_warn, Error, Library, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;
use std::sync::Arc;

/// Environment variable switching capture on or off.
pub const HTTPWATCH_ENABLED: &str = "HTTPWATCH_ENABLED";
/// Environment variable enabling strict error surfacing.
pub const HTTPWATCH_STRICT_ERRORS: &str = "HTTPWATCH_STRICT_ERRORS";
/// Environment variable enabling strict recursion detection.
pub const HTTPWATCH_STRICT_RECURSION: &str = "HTTPWATCH_STRICT_RECURSION";
/// Environment variable overriding the recursion threshold.
pub const HTTPWATCH_MAX_RECURSION_DEPTH: &str = "HTTPWATCH_MAX_RECURSION_DEPTH";
/// Environment variable overriding the body preview size.
pub const HTTPWATCH_MAX_BODY_SIZE: &str = "HTTPWATCH_MAX_BODY_SIZE";

const DEFAULT_MAX_BODY_SIZE: usize = 10_000;
const DEFAULT_MAX_RECURSION_DEPTH: usize = 3;

const DEFAULT_EXCLUDED_CONTENT_TYPES: [&str; 6] = [
    "image/",
    "video/",
    "audio/",
    "font/",
    "application/octet-stream",
    "application/zip",
];

const DEFAULT_SENSITIVE_HEADERS: [&str; 5] = [
    "authorization",
    "cookie",
    "proxy-authorization",
    "set-cookie",
    "x-api-key",
];

const DEFAULT_SENSITIVE_BODY_KEYS: [&str; 6] = [
    "access_token",
    "api_key",
    "password",
    "refresh_token",
    "secret",
    "token",
];

/// How the recursion guard reacts once the depth threshold is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecursionMode {
    /// Skip capturing the nested call; the call itself proceeds.
    #[default]
    Lenient,
    /// Fail with [`Error::SelfReferentialInstrumentation`].
    Strict,
}

/// Per-library capture switches. Every library is enabled by default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LibraryFlags([bool; Library::COUNT]);

impl LibraryFlags {
    /// Whether capture is enabled for `library`.
    pub fn is_enabled(&self, library: Library) -> bool {
        self.0[library.index()]
    }

    /// Switches capture for `library`.
    pub fn set(&mut self, library: Library, enabled: bool) {
        self.0[library.index()] = enabled;
    }
}

impl Default for LibraryFlags {
    fn default() -> Self {
        LibraryFlags([true; Library::COUNT])
    }
}

/// Control plane configuration.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Master switch for capture.
    pub enabled: bool,

    /// Per-library capture switches.
    pub libraries: LibraryFlags,

    /// Requests whose URL matches any of these are not captured.
    pub exclude_url_patterns: Vec<Regex>,

    /// Content types (prefix match, case-insensitive) that are not captured.
    pub exclude_content_types: Vec<String>,

    /// Header names sinks should redact, lower-case.
    pub sensitive_headers: BTreeSet<String>,

    /// Body field names sinks should redact.
    pub sensitive_body_keys: BTreeSet<String>,

    /// Request and response bodies are truncated to this many bytes before
    /// they reach the sink.
    pub max_body_size: usize,

    /// Reaction to re-entrant instrumentation.
    pub recursion: RecursionMode,

    /// Depth at which the recursion guard trips.
    pub max_recursion_depth: usize,

    /// Surface contained instrumentation errors instead of logging them.
    /// Meant for test and CI environments.
    pub strict_errors: bool,

    /// Receives diagnostics for contained errors.
    pub logger: Arc<dyn DiagnosticLogger>,

    /// Receives captured calls. Nothing is captured without a sink.
    pub sink: Option<Arc<dyn CaptureSink>>,
}

impl Default for Config {
    /// Creates the default configuration, honouring the `HTTPWATCH_*`
    /// environment variables.
    fn default() -> Self {
        let mut config = Config {
            enabled: true,
            libraries: LibraryFlags::default(),
            exclude_url_patterns: Vec::new(),
            exclude_content_types: DEFAULT_EXCLUDED_CONTENT_TYPES
                .iter()
                .map(|prefix| prefix.to_string())
                .collect(),
            sensitive_headers: DEFAULT_SENSITIVE_HEADERS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            sensitive_body_keys: DEFAULT_SENSITIVE_BODY_KEYS
                .iter()
                .map(|name| name.to_string())
                .collect(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            recursion: RecursionMode::Lenient,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            strict_errors: false,
            logger: Arc::new(TracingLogger),
            sink: None,
        };

        if let Some(enabled) = env_flag(HTTPWATCH_ENABLED) {
            config.enabled = enabled;
        }

        if let Some(strict) = env_flag(HTTPWATCH_STRICT_ERRORS) {
            config.strict_errors = strict;
        }

        if let Some(true) = env_flag(HTTPWATCH_STRICT_RECURSION) {
            config.recursion = RecursionMode::Strict;
        }

        if let Some(depth) = env_number(HTTPWATCH_MAX_RECURSION_DEPTH) {
            config.max_recursion_depth = depth;
        }

        if let Some(size) = env_number(HTTPWATCH_MAX_BODY_SIZE) {
            config.max_body_size = size;
        }

        config
    }
}

impl Config {
    /// Adds a URL exclusion pattern.
    ///
    /// An invalid pattern is a caller defect and fails with
    /// [`Error::InvalidArgument`].
    pub fn with_excluded_url(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|err| Error::InvalidArgument(format!("url pattern `{pattern}`: {err}")))?;
        self.exclude_url_patterns.push(regex);
        Ok(self)
    }

    /// Whether `url` matches an exclusion pattern.
    pub fn is_url_excluded(&self, url: &str) -> bool {
        self.exclude_url_patterns
            .iter()
            .any(|pattern| pattern.is_match(url))
    }

    /// Whether `content_type` starts with an excluded prefix.
    pub fn is_content_type_excluded(&self, content_type: &str) -> bool {
        let content_type = content_type.trim().to_ascii_lowercase();
        self.exclude_content_types
            .iter()
            .any(|prefix| content_type.starts_with(&prefix.to_ascii_lowercase()))
    }

    /// Whether a call through `library` to `url` should be captured.
    pub fn should_capture(&self, library: Library, url: &str, content_type: Option<&str>) -> bool {
        self.enabled
            && self.libraries.is_enabled(library)
            && !self.is_url_excluded(url)
            && !content_type.is_some_and(|content_type| self.is_content_type_excluded(content_type))
    }

    /// Whether `header` should be redacted by sinks.
    pub fn is_sensitive_header(&self, header: &str) -> bool {
        self.sensitive_headers
            .contains(header.to_ascii_lowercase().as_str())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            httpwatch_warn!(
                name: "Config.InvalidFlag",
                variable = name,
                message = "expected true/false, 1/0, yes/no or on/off; using the default"
            );
            None
        }
    }
}

fn env_number(name: &str) -> Option<usize> {
    let value = env::var(name).ok()?;
    match usize::from_str(value.trim()) {
        Ok(number) => Some(number),
        Err(_) => {
            httpwatch_warn!(
                name: "Config.InvalidNumber",
                variable = name,
                message = format!("{name} must be a non-negative integer. Using the default.")
            );
            None
        }
    }
}

/// A partial [`Config`]: only the fields that are set replace the base
/// configuration in [`ConfigOverrides::apply`].
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    enabled: Option<bool>,
    libraries: Vec<(Library, bool)>,
    exclude_url_patterns: Option<Vec<Regex>>,
    exclude_content_types: Option<Vec<String>>,
    sensitive_headers: Option<BTreeSet<String>>,
    sensitive_body_keys: Option<BTreeSet<String>>,
    max_body_size: Option<usize>,
    recursion: Option<RecursionMode>,
    max_recursion_depth: Option<usize>,
    strict_errors: Option<bool>,
    logger: Option<Arc<dyn DiagnosticLogger>>,
    sink: Option<Option<Arc<dyn CaptureSink>>>,
}

impl ConfigOverrides {
    /// An empty set of overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides [`Config::enabled`].
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Overrides the capture switch of one library.
    pub fn with_library(mut self, library: Library, enabled: bool) -> Self {
        self.libraries.push((library, enabled));
        self
    }

    /// Replaces [`Config::exclude_url_patterns`].
    pub fn with_excluded_urls(mut self, patterns: Vec<Regex>) -> Self {
        self.exclude_url_patterns = Some(patterns);
        self
    }

    /// Replaces [`Config::exclude_content_types`].
    pub fn with_excluded_content_types<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_content_types = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    /// Replaces [`Config::sensitive_headers`].
    pub fn with_sensitive_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive_headers = Some(
            headers
                .into_iter()
                .map(|header| header.into().to_ascii_lowercase())
                .collect(),
        );
        self
    }

    /// Replaces [`Config::sensitive_body_keys`].
    pub fn with_sensitive_body_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sensitive_body_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    /// Overrides [`Config::max_body_size`].
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = Some(size);
        self
    }

    /// Overrides [`Config::recursion`].
    pub fn with_recursion_mode(mut self, mode: RecursionMode) -> Self {
        self.recursion = Some(mode);
        self
    }

    /// Overrides [`Config::max_recursion_depth`].
    pub fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = Some(depth);
        self
    }

    /// Overrides [`Config::strict_errors`].
    pub fn with_strict_errors(mut self, strict: bool) -> Self {
        self.strict_errors = Some(strict);
        self
    }

    /// Overrides [`Config::logger`].
    pub fn with_logger(mut self, logger: Arc<dyn DiagnosticLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Overrides [`Config::sink`].
    pub fn with_sink(mut self, sink: Arc<dyn CaptureSink>) -> Self {
        self.sink = Some(Some(sink));
        self
    }

    /// Removes the sink, turning capture into a no-op.
    pub fn without_sink(mut self) -> Self {
        self.sink = Some(None);
        self
    }

    /// Whether no field is overridden.
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.libraries.is_empty()
            && self.exclude_url_patterns.is_none()
            && self.exclude_content_types.is_none()
            && self.sensitive_headers.is_none()
            && self.sensitive_body_keys.is_none()
            && self.max_body_size.is_none()
            && self.recursion.is_none()
            && self.max_recursion_depth.is_none()
            && self.strict_errors.is_none()
            && self.logger.is_none()
            && self.sink.is_none()
    }

    /// Returns a copy of `base` with these overrides applied.
    pub fn apply(&self, base: &Config) -> Config {
        let mut config = base.clone();
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        for (library, enabled) in &self.libraries {
            config.libraries.set(*library, *enabled);
        }
        if let Some(patterns) = &self.exclude_url_patterns {
            config.exclude_url_patterns = patterns.clone();
        }
        if let Some(prefixes) = &self.exclude_content_types {
            config.exclude_content_types = prefixes.clone();
        }
        if let Some(headers) = &self.sensitive_headers {
            config.sensitive_headers = headers.clone();
        }
        if let Some(keys) = &self.sensitive_body_keys {
            config.sensitive_body_keys = keys.clone();
        }
        if let Some(size) = self.max_body_size {
            config.max_body_size = size;
        }
        if let Some(mode) = self.recursion {
            config.recursion = mode;
        }
        if let Some(depth) = self.max_recursion_depth {
            config.max_recursion_depth = depth;
        }
        if let Some(strict) = self.strict_errors {
            config.strict_errors = strict;
        }
        if let Some(logger) = &self.logger {
            config.logger = Arc::clone(logger);
        }
        if let Some(sink) = &self.sink {
            config.sink = sink.clone();
        }
        config
    }
}

/// Returns the process-wide configuration.
pub fn global() -> Arc<Config> {
    global::config()
}

/// Replaces the process-wide configuration, returning the previous one.
pub fn set_global(config: Config) -> Arc<Config> {
    global::set_config(config)
}

/// Updates the process-wide configuration in place.
///
/// `f` receives a copy of the current value; the copy is published once `f`
/// returns. `f` may run more than once when another thread publishes
/// concurrently. Configurations already handed out are unaffected.
pub fn configure(f: impl FnMut(&mut Config)) {
    global::update_config(f)
}

/// Returns the configuration governing the current thread.
pub fn effective() -> Arc<Config> {
    scope::config_override().unwrap_or_else(global)
}

/// Runs `body` with `overrides` applied on top of the [`effective()`]
/// configuration for the current thread only.
///
/// Nested calls compose: inner overrides apply on top of outer ones, and
/// leaving the inner block restores the outer override. Empty overrides run
/// `body` directly, leaving the effective configuration untouched.
///
/// # Examples
///
/// ```
/// use httpwatch::config::{self, ConfigOverrides};
///
/// config::with_configuration(ConfigOverrides::new().with_max_body_size(10), || {
///     assert_eq!(config::effective().max_body_size, 10);
/// })
/// .unwrap();
/// ```
pub fn with_configuration<R>(overrides: ConfigOverrides, body: impl FnOnce() -> R) -> Result<R> {
    if overrides.is_empty() {
        return Ok(body());
    }
    let config = Arc::new(overrides.apply(&effective()));
    scope::with_scope(
        [(Attribute::ConfigOverride, AttributeValue::ConfigOverride(config))],
        [Attribute::ConfigOverride],
        body,
    )
}

/// A copy of the global configuration taken by [`backup`].
#[derive(Clone, Debug)]
pub struct ConfigBackup {
    config: Config,
}

impl ConfigBackup {
    /// The saved configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Copies the global configuration, collections included.
pub fn backup() -> ConfigBackup {
    ConfigBackup {
        config: Config::clone(&global()),
    }
}

/// Reinstates a configuration saved by [`backup`] as the global one.
pub fn restore(backup: ConfigBackup) {
    set_global(backup.config);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryCaptureSink;
    use std::sync::{Barrier, Mutex};
    use std::thread;

    // Tests that touch the global configuration run one at a time.
    static GLOBAL_LOCK: Mutex<()> = Mutex::new(());

    fn env_vars_unset() -> [(&'static str, Option<&'static str>); 5] {
        [
            (HTTPWATCH_ENABLED, None),
            (HTTPWATCH_STRICT_ERRORS, None),
            (HTTPWATCH_STRICT_RECURSION, None),
            (HTTPWATCH_MAX_RECURSION_DEPTH, None),
            (HTTPWATCH_MAX_BODY_SIZE, None),
        ]
    }

    fn config_without_env() -> Config {
        temp_env::with_vars(env_vars_unset(), Config::default)
    }

    #[test]
    fn default_config() {
        let config = config_without_env();
        assert!(config.enabled);
        assert!(!config.strict_errors);
        assert_eq!(config.recursion, RecursionMode::Lenient);
        assert_eq!(config.max_recursion_depth, 3);
        assert_eq!(config.max_body_size, 10_000);
        assert!(config.sink.is_none());
        assert!(config.is_sensitive_header("Authorization"));
        for library in Library::ALL {
            assert!(config.libraries.is_enabled(library));
        }
    }

    #[test]
    fn config_from_env() {
        let config = temp_env::with_vars(
            [
                (HTTPWATCH_ENABLED, Some("false")),
                (HTTPWATCH_STRICT_ERRORS, Some("1")),
                (HTTPWATCH_STRICT_RECURSION, Some("yes")),
                (HTTPWATCH_MAX_RECURSION_DEPTH, Some("5")),
                (HTTPWATCH_MAX_BODY_SIZE, Some("128")),
            ],
            Config::default,
        );
        assert!(!config.enabled);
        assert!(config.strict_errors);
        assert_eq!(config.recursion, RecursionMode::Strict);
        assert_eq!(config.max_recursion_depth, 5);
        assert_eq!(config.max_body_size, 128);
    }

    #[test]
    fn invalid_env_values_fall_back_to_defaults() {
        let config = temp_env::with_vars(
            [
                (HTTPWATCH_ENABLED, Some("maybe")),
                (HTTPWATCH_MAX_RECURSION_DEPTH, Some("-1")),
                (HTTPWATCH_MAX_BODY_SIZE, Some("lots")),
            ],
            Config::default,
        );
        assert!(config.enabled);
        assert_eq!(config.max_recursion_depth, 3);
        assert_eq!(config.max_body_size, 10_000);
    }

    #[test]
    fn exclusion_rules() {
        let config = config_without_env()
            .with_excluded_url(r"/health$")
            .unwrap();
        assert!(config.is_url_excluded("https://api.example.com/health"));
        assert!(!config.is_url_excluded("https://api.example.com/orders"));
        assert!(config.is_content_type_excluded("IMAGE/png"));
        assert!(!config.is_content_type_excluded("application/json; charset=utf-8"));

        assert!(config.should_capture(Library::Reqwest, "https://api.example.com/orders", None));
        assert!(!config.should_capture(Library::Reqwest, "https://api.example.com/health", None));
        assert!(!config.should_capture(
            Library::Reqwest,
            "https://cdn.example.com/logo",
            Some("image/svg+xml")
        ));
    }

    #[test]
    fn invalid_url_pattern_is_a_programmer_error() {
        let err = Config::default().with_excluded_url("(").unwrap_err();
        assert!(err.is_programmer_error());
    }

    #[test]
    fn library_switch_blocks_capture() {
        let config = ConfigOverrides::new()
            .with_library(Library::Hyper, false)
            .apply(&config_without_env());
        assert!(!config.should_capture(Library::Hyper, "http://localhost/", None));
        assert!(config.should_capture(Library::Reqwest, "http://localhost/", None));
    }

    #[test]
    fn empty_overrides_keep_identity() {
        let _lock = GLOBAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before = effective();
        with_configuration(ConfigOverrides::new(), || {
            assert!(Arc::ptr_eq(&before, &effective()));
            assert!(scope::get(Attribute::ConfigOverride).unwrap().is_none());
        })
        .unwrap();
    }

    #[test]
    fn nested_configuration_composes() {
        let _lock = GLOBAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved = backup();
        configure(|config| config.enabled = false);

        with_configuration(ConfigOverrides::new().with_enabled(true), || {
            assert!(effective().enabled);
            let outer = effective();

            with_configuration(ConfigOverrides::new().with_max_body_size(10), || {
                assert!(effective().enabled);
                assert_eq!(effective().max_body_size, 10);
            })
            .unwrap();

            // Leaving the inner block restores the outer override.
            assert!(Arc::ptr_eq(&outer, &effective()));
        })
        .unwrap();

        assert!(Arc::ptr_eq(&effective(), &global()));
        assert!(!effective().enabled);
        restore(saved);
    }

    #[test]
    fn configure_can_read_the_current_configuration() {
        let _lock = GLOBAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved = backup();
        let before = global().enabled;

        let (done, finished) = std::sync::mpsc::channel();
        thread::spawn(move || {
            configure(|config| config.enabled = !effective().enabled);
            let _ = done.send(());
        });
        finished
            .recv_timeout(std::time::Duration::from_secs(3))
            .expect("configure returns");
        assert_eq!(global().enabled, !before);
        restore(saved);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let _lock = GLOBAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved = backup();
        configure(|config| config.max_body_size = 0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    for _ in 0..50 {
                        configure(|config| config.max_body_size += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(global().max_body_size, 400);
        restore(saved);
    }

    #[test]
    fn configuration_restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            with_configuration(ConfigOverrides::new().with_strict_errors(true), || {
                assert!(effective().strict_errors);
                panic!("body failed");
            })
        });
        assert!(result.is_err());
        assert!(scope::get(Attribute::ConfigOverride).unwrap().is_none());
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let _lock = GLOBAL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved = backup();
        let sink = Arc::new(InMemoryCaptureSink::new());

        configure(|config| {
            config.max_body_size = 1;
            config.exclude_content_types.clear();
            config.sink = Some(sink.clone() as Arc<dyn CaptureSink>);
        });
        assert_eq!(global().max_body_size, 1);
        assert!(global().sink.is_some());

        restore(saved.clone());
        let restored = global();
        assert_eq!(restored.max_body_size, saved.config().max_body_size);
        assert_eq!(
            restored.exclude_content_types,
            saved.config().exclude_content_types
        );
        assert!(restored.sink.is_none());
    }

    #[test]
    fn overrides_are_thread_isolated() {
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [true, false]
            .into_iter()
            .map(|enabled| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    with_configuration(ConfigOverrides::new().with_enabled(enabled), || {
                        barrier.wait();
                        for _ in 0..1_000 {
                            assert_eq!(effective().enabled, enabled);
                        }
                        barrier.wait();
                        assert_eq!(effective().enabled, enabled);
                    })
                    .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
