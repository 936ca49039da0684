#![allow(unused_macros)]
//! Diagnostics about the control plane itself and the adapters built on it,
//! not application logging.
//!
//! Each macro takes an event `name` followed by optional `key = value`
//! fields. With the `internal-logs` feature of the expanding crate the event
//! goes to `tracing`, targeted at that crate. Unit tests also print it to
//! stdout. Otherwise the arguments are evaluated and discarded.

#[doc(hidden)]
#[macro_export]
macro_rules! __httpwatch_log {
    ($level:ident, name: $name:expr $(, $key:ident = $value:expr)* $(,)?) => {{
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::$level!(
                name: $name,
                target: env!("CARGO_PKG_NAME"),
                name = $name
                $(, $key = $value)*
            );
        }

        #[cfg(test)]
        {
            print!("httpwatch_{}: name={}", stringify!($level), $name);
            $(print!(", {}={}", stringify!($key), $value);)*
            println!();
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $($value),*);
        }
    }};
}

/// Logs an informational event.
///
/// ```rust
/// use httpwatch::httpwatch_info;
/// httpwatch_info!(name: "Registry.Installed", library = "reqwest");
/// ```
#[macro_export]
macro_rules! httpwatch_info {
    ($($args:tt)*) => {
        $crate::__httpwatch_log!(info, $($args)*)
    };
}

/// Logs a warning, typically a rejected setting that fell back to its default.
///
/// ```rust
/// use httpwatch::httpwatch_warn;
/// httpwatch_warn!(name: "Config.InvalidValue", variable = "HTTPWATCH_MAX_BODY_SIZE");
/// ```
#[macro_export]
macro_rules! httpwatch_warn {
    ($($args:tt)*) => {
        $crate::__httpwatch_log!(warn, $($args)*)
    };
}

/// Logs a debug event.
///
/// ```rust
/// use httpwatch::httpwatch_debug;
/// httpwatch_debug!(name: "Interceptor.Skipped", library = "hyper", depth = 3);
/// ```
#[macro_export]
macro_rules! httpwatch_debug {
    ($($args:tt)*) => {
        $crate::__httpwatch_log!(debug, $($args)*)
    };
}

/// Logs an error the control plane contained.
///
/// ```rust
/// use httpwatch::httpwatch_error;
/// httpwatch_error!(
///     name: "Failsafe.Contained",
///     operation = "Interceptor.Record",
///     error_class = "environment",
/// );
/// ```
#[macro_export]
macro_rules! httpwatch_error {
    ($($args:tt)*) => {
        $crate::__httpwatch_log!(error, $($args)*)
    };
}
