use crate::Error;
use std::fmt;
use std::str::FromStr;

/// An HTTP client library whose request path can be intercepted.
///
/// The set is closed: every supported library has an adapter in
/// `httpwatch-http`, and per-library state (recursion depth counters,
/// registry entries) is sized from [`Library::COUNT`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Library {
    /// The async `reqwest::Client`.
    Reqwest,
    /// `reqwest::blocking::Client`.
    ReqwestBlocking,
    /// The `hyper-util` legacy client.
    Hyper,
}

impl Library {
    /// Every supported library, in index order.
    pub const ALL: [Library; 3] = [Library::Reqwest, Library::ReqwestBlocking, Library::Hyper];

    /// Number of supported libraries.
    pub const COUNT: usize = Library::ALL.len();

    /// Dense index of this library, `0..Library::COUNT`.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Stable lower-case name, as accepted by [`Library::from_str`].
    pub const fn name(self) -> &'static str {
        match self {
            Library::Reqwest => "reqwest",
            Library::ReqwestBlocking => "reqwest-blocking",
            Library::Hyper => "hyper",
        }
    }

    /// Whether the adapter for this library was compiled into the process.
    ///
    /// This is the default presence probe used by
    /// [`Registry::new`](crate::registry::Registry::new).
    pub fn is_linked(self) -> bool {
        match self {
            Library::Reqwest | Library::ReqwestBlocking => cfg!(feature = "reqwest"),
            Library::Hyper => cfg!(feature = "hyper"),
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Library {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Library::ALL
            .into_iter()
            .find(|library| library.name() == s)
            .ok_or_else(|| Error::UnknownLibrary(s.to_owned()))
    }
}
