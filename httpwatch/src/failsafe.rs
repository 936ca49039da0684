//! Failsafe boundary around instrumentation code.
//!
//! [`guard`] runs a piece of instrumentation and decides what happens when it
//! fails:
//!
//! - programmer errors ([`ErrorClass::Programmer`]) and strict-mode recursion
//!   errors ([`ErrorClass::Recursion`]) are returned to the caller;
//! - with [`Config::strict_errors`](crate::config::Config::strict_errors) set,
//!   every error is returned and panics are resumed;
//! - anything else is reported once to the effective
//!   [`DiagnosticLogger`](crate::sink::DiagnosticLogger) and replaced by the
//!   default value.
use crate::config::{self, Config};
use crate::sink::Diagnostic;
use crate::{Error, ErrorClass, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Runs `body`, containing its errors according to the boundary's policy.
///
/// Returns `Ok(default)` when an error was contained, and `Err` only for
/// errors that must surface.
///
/// # Examples
///
/// ```
/// use httpwatch::{failsafe, Error};
///
/// let stored = failsafe::guard("Example.Store", false, || {
///     Err(Error::Storage("database is locked".into()))
/// });
/// assert!(matches!(stored, Ok(false)));
///
/// let invalid = failsafe::guard("Example.Store", false, || {
///     Err(Error::InvalidArgument("empty url".into()))
/// });
/// assert!(invalid.is_err());
/// ```
pub fn guard<T, F>(operation: &'static str, default: T, body: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    let config = config::effective();
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            if must_surface(&err, &config) {
                return Err(err);
            }
            report(&config, operation, err.class(), err.to_string());
            Ok(default)
        }
        Err(payload) => {
            if config.strict_errors {
                panic::resume_unwind(payload);
            }
            let message = Error::Panicked(panic_message(payload.as_ref())).to_string();
            report(&config, operation, ErrorClass::Generic, message);
            Ok(default)
        }
    }
}

fn must_surface(err: &Error, config: &Config) -> bool {
    config.strict_errors || matches!(err.class(), ErrorClass::Programmer | ErrorClass::Recursion)
}

fn report(config: &Config, operation: &'static str, class: ErrorClass, message: String) {
    let diagnostic = Diagnostic {
        operation,
        class,
        message,
    };
    // A panicking logger must not take the protected call down with it.
    let _ = panic::catch_unwind(AssertUnwindSafe(|| config.logger.log(&diagnostic)));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "opaque panic payload".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{with_configuration, ConfigOverrides};
    use crate::testing::{baseline_overrides, InMemoryDiagnosticLogger};
    use crate::Library;
    use std::sync::Arc;

    fn with_logger<R>(
        strict: bool,
        body: impl FnOnce(&InMemoryDiagnosticLogger) -> R,
    ) -> R {
        let logger = InMemoryDiagnosticLogger::new();
        let overrides = baseline_overrides()
            .with_strict_errors(strict)
            .with_logger(Arc::new(logger.clone()));
        with_configuration(overrides, || body(&logger)).unwrap()
    }

    #[test]
    fn success_passes_through() {
        with_logger(false, |logger| {
            assert_eq!(guard("Test.Ok", 0, || Ok(7)).unwrap(), 7);
            assert!(logger.get_diagnostics().unwrap().is_empty());
        });
    }

    #[test]
    fn environment_error_is_contained_and_logged_once() {
        with_logger(false, |logger| {
            let value = guard("Test.Store", "fallback", || {
                Err(Error::Storage("connection reset".into()))
            })
            .unwrap();
            assert_eq!(value, "fallback");

            let diagnostics = logger.get_diagnostics().unwrap();
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].operation, "Test.Store");
            assert_eq!(diagnostics[0].class, ErrorClass::Environment);
            assert!(diagnostics[0].message.contains("connection reset"));
        });
    }

    #[test]
    fn strict_mode_surfaces_errors() {
        with_logger(true, |logger| {
            let err = guard("Test.Store", (), || {
                Err(Error::MalformedData("truncated json".into()))
            })
            .unwrap_err();
            assert!(matches!(err, Error::MalformedData(_)));
            assert!(logger.get_diagnostics().unwrap().is_empty());
        });
    }

    #[test]
    fn programmer_errors_always_surface() {
        with_logger(false, |logger| {
            let unknown = "metdata".parse::<crate::scope::Attribute>().unwrap_err();
            let err = guard("Test.Lookup", (), || Err(unknown)).unwrap_err();
            assert!(matches!(err, Error::UnknownAttribute(_)));
            assert!(logger.get_diagnostics().unwrap().is_empty());
        });
    }

    #[test]
    fn recursion_errors_surface() {
        with_logger(false, |_| {
            let result = guard("Test.Admit", (), || {
                Err(Error::SelfReferentialInstrumentation {
                    library: Library::Reqwest,
                    depth: 3,
                })
            });
            assert!(result.is_err());
        });
    }

    #[test]
    fn panics_are_contained() {
        with_logger(false, |logger| {
            let value = guard("Test.Serialize", 1, || -> Result<i32> { panic!("sink bug") });
            let value = value.unwrap();
            assert_eq!(value, 1);
            let diagnostics = logger.get_diagnostics().unwrap();
            assert_eq!(diagnostics.len(), 1);
            assert_eq!(diagnostics[0].class, ErrorClass::Generic);
            assert!(diagnostics[0].message.contains("sink bug"));
        });
    }

    #[test]
    fn panics_resume_in_strict_mode() {
        let result = std::panic::catch_unwind(|| {
            with_logger(true, |_| {
                guard("Test.Serialize", (), || -> Result<()> { panic!("sink bug") })
            })
        });
        assert!(result.is_err());
    }

    #[test]
    fn panicking_logger_is_ignored() {
        #[derive(Debug)]
        struct PanickingLogger;

        impl crate::sink::DiagnosticLogger for PanickingLogger {
            fn log(&self, _diagnostic: &Diagnostic) {
                panic!("logger bug");
            }
        }

        let overrides = baseline_overrides().with_logger(Arc::new(PanickingLogger));
        let value = with_configuration(overrides, || {
            guard("Test.Store", 5, || Err(Error::Other("boom".into())))
        })
        .unwrap()
        .unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn strictness_follows_the_effective_configuration() {
        let logger = InMemoryDiagnosticLogger::new();
        let overrides = baseline_overrides().with_logger(Arc::new(logger.clone()));
        with_configuration(overrides, || {
            with_configuration(ConfigOverrides::new().with_strict_errors(true), || {
                assert!(guard("Test.Inner", (), || Err(Error::Other("x".into()))).is_err());
            })
            .unwrap();
            assert!(guard("Test.Outer", (), || Err(Error::Other("x".into()))).is_ok());
        })
        .unwrap();
        assert_eq!(logger.get_diagnostics().unwrap().len(), 1);
    }
}
