//! Interception hook registry.
//!
//! The registry records, per supported [`Library`], whether the interception
//! hook has been installed and whether it is currently enabled. Installation
//! happens at most once per library; enablement can be toggled at any time
//! and is consulted by the hook on every call.
//!
//! # Examples
//!
//! ```
//! use httpwatch::registry::{InstallOutcome, Registry};
//! use httpwatch::Library;
//!
//! let registry = Registry::with_probe(|_| true);
//!
//! let outcome = registry.install(Library::Hyper, || Ok(())).unwrap();
//! assert_eq!(outcome, InstallOutcome::Installed);
//! assert!(registry.is_active(Library::Hyper));
//!
//! // Runtime toggle, no re-installation involved.
//! registry.disable(Library::Hyper);
//! assert!(!registry.is_active(Library::Hyper));
//! registry.enable(Library::Hyper);
//! assert!(registry.is_active(Library::Hyper));
//!
//! // Further installs are no-ops.
//! let outcome = registry.install(Library::Hyper, || unreachable!()).unwrap();
//! assert_eq!(outcome, InstallOutcome::AlreadyInstalled);
//! ```
use crate::{httpwatch_debug, httpwatch_info, httpwatch_warn, Library, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

const NOT_INSTALLED: u8 = 0;
const INSTALLING: u8 = 1;
const INSTALLED: u8 = 2;

/// Installation progress of a library's hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallState {
    /// No hook has been installed.
    NotInstalled,
    /// A thread is running the installer.
    Installing,
    /// The hook is installed. Terminal outside of tests.
    Installed,
}

impl InstallState {
    fn from_u8(state: u8) -> Self {
        match state {
            INSTALLED => InstallState::Installed,
            INSTALLING => InstallState::Installing,
            _ => InstallState::NotInstalled,
        }
    }
}

/// Result of a successful [`Registry::install`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    /// This call ran the installer.
    Installed,
    /// The hook was already installed; the installer was not run.
    AlreadyInstalled,
    /// The library is not present in this process; nothing was installed.
    LibraryAbsent,
}

/// Point-in-time view of one library's registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistrationStatus {
    /// The library described.
    pub library: Library,
    /// Installation progress.
    pub install_state: InstallState,
    /// Whether the hook is switched on.
    pub enabled: bool,
    /// Whether the hook is installed.
    pub installed: bool,
    /// Whether the library is present in this process.
    pub library_present: bool,
    /// `enabled && installed && library_present`.
    pub active: bool,
}

#[derive(Debug, Default)]
struct Registration {
    state: AtomicU8,
    enabled: AtomicBool,
    install_lock: Mutex<()>,
}

impl Registration {
    #[inline]
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }
}

/// Puts a registration back to `not_installed` unless the install committed,
/// covering both a failing and a panicking installer.
struct InstallAttempt<'a> {
    registration: &'a Registration,
    committed: bool,
}

impl Drop for InstallAttempt<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registration
                .state
                .store(NOT_INSTALLED, Ordering::Release);
        }
    }
}

/// Tracks installation and enablement of interception hooks, one entry per
/// supported [`Library`].
pub struct Registry {
    entries: [Registration; Library::COUNT],
    probe: Box<dyn Fn(Library) -> bool + Send + Sync>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// Creates a registry that probes presence with [`Library::is_linked`].
    pub fn new() -> Self {
        Registry::with_probe(Library::is_linked)
    }

    /// Creates a registry with a custom library presence probe.
    pub fn with_probe<P>(probe: P) -> Self
    where
        P: Fn(Library) -> bool + Send + Sync + 'static,
    {
        Registry {
            entries: std::array::from_fn(|_| Registration::default()),
            probe: Box::new(probe),
        }
    }

    #[inline]
    fn entry(&self, library: Library) -> &Registration {
        &self.entries[library.index()]
    }

    /// Installs the hook for `library` by running `installer`, at most once.
    ///
    /// Concurrent callers serialize on a per-library lock and re-check the
    /// state under it, so `installer` runs exactly once per library even when
    /// many threads race. A successful install also enables the hook.
    ///
    /// If `installer` fails, the registration stays `not_installed`, the
    /// failure is logged and returned, and a later call may try again.
    pub fn install<F>(&self, library: Library, installer: F) -> Result<InstallOutcome>
    where
        F: FnOnce() -> Result<()>,
    {
        let registration = self.entry(library);
        if registration.state() == INSTALLED {
            return Ok(InstallOutcome::AlreadyInstalled);
        }
        if !self.is_present(library) {
            httpwatch_debug!(name: "Registry.LibraryAbsent", library = library.name());
            return Ok(InstallOutcome::LibraryAbsent);
        }

        // The lock only serializes installers; the guarded state lives in the
        // atomics, so a poisoned lock is still usable.
        let _lock = registration
            .install_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registration.state() == INSTALLED {
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        registration.state.store(INSTALLING, Ordering::Release);
        let mut attempt = InstallAttempt {
            registration,
            committed: false,
        };
        match installer() {
            Ok(()) => {
                registration.enabled.store(true, Ordering::Release);
                registration.state.store(INSTALLED, Ordering::Release);
                attempt.committed = true;
                httpwatch_info!(name: "Registry.Installed", library = library.name());
                Ok(InstallOutcome::Installed)
            }
            Err(err) => {
                httpwatch_warn!(
                    name: "Registry.InstallFailed",
                    library = library.name(),
                    message = err.to_string()
                );
                Err(err)
            }
        }
    }

    /// Switches the hook for `library` on. Takes effect on the next call.
    pub fn enable(&self, library: Library) {
        self.entry(library).enabled.store(true, Ordering::Release);
        httpwatch_debug!(name: "Registry.Enabled", library = library.name());
    }

    /// Switches the hook for `library` off. Takes effect on the next call.
    pub fn disable(&self, library: Library) {
        self.entry(library).enabled.store(false, Ordering::Release);
        httpwatch_debug!(name: "Registry.Disabled", library = library.name());
    }

    /// Whether the hook for `library` is switched on.
    pub fn is_enabled(&self, library: Library) -> bool {
        self.entry(library).enabled.load(Ordering::Acquire)
    }

    /// Installation progress for `library`.
    pub fn install_state(&self, library: Library) -> InstallState {
        InstallState::from_u8(self.entry(library).state())
    }

    /// Whether the hook for `library` is installed.
    pub fn is_installed(&self, library: Library) -> bool {
        self.entry(library).state() == INSTALLED
    }

    /// Whether `library` is present in this process.
    pub fn is_present(&self, library: Library) -> bool {
        (self.probe)(library)
    }

    /// Whether calls through `library` are currently intercepted.
    #[inline]
    pub fn is_active(&self, library: Library) -> bool {
        self.is_enabled(library) && self.is_installed(library) && self.is_present(library)
    }

    /// Describes the registration of `library`.
    pub fn status(&self, library: Library) -> RegistrationStatus {
        let install_state = self.install_state(library);
        let enabled = self.is_enabled(library);
        let installed = install_state == InstallState::Installed;
        let library_present = self.is_present(library);
        RegistrationStatus {
            library,
            install_state,
            enabled,
            installed,
            library_present,
            active: enabled && installed && library_present,
        }
    }

    /// Libraries whose calls are currently intercepted.
    pub fn active_libraries(&self) -> Vec<Library> {
        Library::ALL
            .into_iter()
            .filter(|library| self.is_active(*library))
            .collect()
    }

    /// Forgets the installation of `library` and disables it, as if the
    /// process had restarted.
    #[cfg(any(test, feature = "testing"))]
    pub fn reset(&self, library: Library) {
        let registration = self.entry(library);
        let _lock = registration
            .install_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registration.state.store(NOT_INSTALLED, Ordering::Release);
        registration.enabled.store(false, Ordering::Release);
    }

    /// [`Registry::reset`] for every library.
    #[cfg(any(test, feature = "testing"))]
    pub fn reset_all(&self) {
        for library in Library::ALL {
            self.reset(library);
        }
    }
}
