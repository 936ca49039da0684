//! Execution-scoped state for the interception control plane.
//!
//! Every thread carries its own [`ScopeState`]: caller-facing attributes
//! (request [`Metadata`], a [`Loggable`] association and a configuration
//! override) next to internal bookkeeping (per-library recursion depth, the
//! `patches_disabled` flag and the [`InFlight`] marker). State is never shared
//! between threads, so none of the operations here take a lock.
//!
//! Attributes are addressed through the closed [`Attribute`] set. Temporary
//! changes go through [`with_scope`] or [`enter`], both of which restore the
//! previous values on every exit path, including unwinding.
//!
//! # Examples
//!
//! ```
//! use httpwatch::scope::{self, Attribute, AttributeValue, Metadata};
//!
//! let mut metadata = Metadata::new();
//! metadata.insert("request_id".into(), "abc-123".into());
//!
//! scope::with_scope(
//!     [(Attribute::Metadata, AttributeValue::Metadata(metadata))],
//!     [],
//!     || {
//!         let current = scope::metadata().unwrap();
//!         assert_eq!(current["request_id"], "abc-123");
//!     },
//! )
//! .unwrap();
//!
//! // Restored once the scope exits.
//! assert!(scope::metadata().is_none());
//! ```

use crate::config::Config;
use crate::{httpwatch_warn, Error, Library, Result};
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;


mod future_ext;

pub use future_ext::{ScopeFutureExt, WithScope};

thread_local! {
    static CURRENT_SCOPE: RefCell<ScopeState> = RefCell::new(ScopeState::default());
}

/// Arbitrary caller data attached to captured calls.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// An opaque reference to a caller-owned entity that captured calls should be
/// associated with.
///
/// # Examples
///
/// ```
/// use httpwatch::scope::Loggable;
///
/// #[derive(Debug, PartialEq)]
/// struct Order(u64);
///
/// let loggable = Loggable::new(Order(42));
/// assert_eq!(loggable.downcast_ref::<Order>(), Some(&Order(42)));
/// assert_eq!(loggable.downcast_ref::<String>(), None);
/// ```
#[derive(Clone)]
pub struct Loggable(Arc<dyn Any + Send + Sync>);

impl Loggable {
    /// Wraps a caller-owned value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Loggable(Arc::new(value))
    }

    /// Wraps a value that is already shared.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Loggable(value)
    }

    /// Returns the wrapped value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    /// Whether both handles point at the same entity.
    pub fn ptr_eq(&self, other: &Loggable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Loggable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Loggable(..)")
    }
}

/// Marks the call currently being captured on this thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InFlight {
    /// The library whose hook is capturing.
    pub library: Library,
    /// When the protected call started.
    pub started_at: Instant,
}

/// The closed set of attributes held by the scoped context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Caller metadata, see [`Metadata`].
    Metadata,
    /// Caller association, see [`Loggable`].
    Loggable,
    /// Thread-scoped configuration override.
    ConfigOverride,
    /// Hook nesting depth for one library.
    RecursionDepth(Library),
    /// Bypass every hook on this thread.
    PatchesDisabled,
    /// The call currently being captured.
    InFlight,
}

impl Attribute {
    /// Attributes callers are expected to manage.
    pub const USER: [Attribute; 3] = [
        Attribute::Metadata,
        Attribute::Loggable,
        Attribute::ConfigOverride,
    ];

    /// Every attribute, user-facing and internal.
    pub fn all() -> impl Iterator<Item = Attribute> {
        Attribute::USER
            .into_iter()
            .chain(Library::ALL.into_iter().map(Attribute::RecursionDepth))
            .chain([Attribute::PatchesDisabled, Attribute::InFlight])
    }

    /// Whether this attribute is control plane bookkeeping.
    pub fn is_internal(self) -> bool {
        !Attribute::USER.contains(&self)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Metadata => f.write_str("metadata"),
            Attribute::Loggable => f.write_str("loggable"),
            Attribute::ConfigOverride => f.write_str("config_override"),
            Attribute::RecursionDepth(library) => write!(f, "recursion_depth.{library}"),
            Attribute::PatchesDisabled => f.write_str("patches_disabled"),
            Attribute::InFlight => f.write_str("in_flight"),
        }
    }
}

impl FromStr for Attribute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "metadata" => Ok(Attribute::Metadata),
            "loggable" => Ok(Attribute::Loggable),
            "config_override" => Ok(Attribute::ConfigOverride),
            "patches_disabled" => Ok(Attribute::PatchesDisabled),
            "in_flight" => Ok(Attribute::InFlight),
            other => other
                .strip_prefix("recursion_depth.")
                .and_then(|library| library.parse().ok())
                .map(Attribute::RecursionDepth)
                .ok_or_else(|| Error::UnknownAttribute(s.to_owned())),
        }
    }
}

/// A value stored under an [`Attribute`].
#[derive(Clone, Debug)]
pub enum AttributeValue {
    /// Value of [`Attribute::Metadata`].
    Metadata(Metadata),
    /// Value of [`Attribute::Loggable`].
    Loggable(Loggable),
    /// Value of [`Attribute::ConfigOverride`].
    ConfigOverride(Arc<Config>),
    /// Value of [`Attribute::RecursionDepth`].
    Depth(usize),
    /// Value of [`Attribute::PatchesDisabled`].
    Flag(bool),
    /// Value of [`Attribute::InFlight`].
    InFlight(InFlight),
}

/// Per-thread storage behind the scoped context.
///
/// Counters and flags use zero/false as their absent value, so reading them
/// back after a restore of "absent" yields the default.
#[derive(Clone, Debug, Default)]
struct ScopeState {
    metadata: Option<Metadata>,
    loggable: Option<Loggable>,
    config_override: Option<Arc<Config>>,
    recursion_depth: [usize; Library::COUNT],
    patches_disabled: bool,
    in_flight: Option<InFlight>,
}

impl ScopeState {
    fn get(&self, attr: Attribute) -> Option<AttributeValue> {
        match attr {
            Attribute::Metadata => self.metadata.clone().map(AttributeValue::Metadata),
            Attribute::Loggable => self.loggable.clone().map(AttributeValue::Loggable),
            Attribute::ConfigOverride => self
                .config_override
                .clone()
                .map(AttributeValue::ConfigOverride),
            Attribute::RecursionDepth(library) => match self.recursion_depth[library.index()] {
                0 => None,
                depth => Some(AttributeValue::Depth(depth)),
            },
            Attribute::PatchesDisabled => {
                self.patches_disabled.then_some(AttributeValue::Flag(true))
            }
            Attribute::InFlight => self.in_flight.map(AttributeValue::InFlight),
        }
    }

    /// Stores `value` under `attr`, handing back the value it displaced.
    fn set(&mut self, attr: Attribute, value: AttributeValue) -> Result<Option<AttributeValue>> {
        let displaced = match (attr, value) {
            (Attribute::Metadata, AttributeValue::Metadata(metadata)) => {
                self.metadata.replace(metadata).map(AttributeValue::Metadata)
            }
            (Attribute::Loggable, AttributeValue::Loggable(loggable)) => {
                self.loggable.replace(loggable).map(AttributeValue::Loggable)
            }
            (Attribute::ConfigOverride, AttributeValue::ConfigOverride(config)) => self
                .config_override
                .replace(config)
                .map(AttributeValue::ConfigOverride),
            (Attribute::RecursionDepth(library), AttributeValue::Depth(depth)) => {
                self.recursion_depth[library.index()] = depth;
                None
            }
            (Attribute::PatchesDisabled, AttributeValue::Flag(flag)) => {
                self.patches_disabled = flag;
                None
            }
            (Attribute::InFlight, AttributeValue::InFlight(in_flight)) => {
                self.in_flight = Some(in_flight);
                None
            }
            (attr, value) => {
                return Err(Error::InvalidArgument(format!(
                    "cannot store {value:?} under attribute `{attr}`"
                )))
            }
        };
        Ok(displaced)
    }

    /// Removes `attr`, handing back the value it held.
    fn take(&mut self, attr: Attribute) -> Option<AttributeValue> {
        match attr {
            Attribute::Metadata => self.metadata.take().map(AttributeValue::Metadata),
            Attribute::Loggable => self.loggable.take().map(AttributeValue::Loggable),
            Attribute::ConfigOverride => self
                .config_override
                .take()
                .map(AttributeValue::ConfigOverride),
            Attribute::RecursionDepth(library) => {
                self.recursion_depth[library.index()] = 0;
                None
            }
            Attribute::PatchesDisabled => {
                self.patches_disabled = false;
                None
            }
            Attribute::InFlight => {
                self.in_flight = None;
                None
            }
        }
    }

    fn put(
        &mut self,
        attr: Attribute,
        value: Option<AttributeValue>,
    ) -> Result<Option<AttributeValue>> {
        match value {
            Some(value) => self.set(attr, value),
            None => Ok(self.take(attr)),
        }
    }
}

// Values moved out of the state are returned by `f` and dropped by the
// caller once the borrow has ended, so their destructors may use the scope.
#[inline]
fn with_state<T>(f: impl FnOnce(&mut ScopeState) -> T) -> Result<T> {
    CURRENT_SCOPE
        .try_with(|state| {
            state
                .try_borrow_mut()
                .map(|mut state| f(&mut state))
                .map_err(|_| Error::ContextUnavailable)
        })
        .map_err(|_| Error::ContextUnavailable)?
}

/// Returns the current thread's value for `attr`.
pub fn get(attr: Attribute) -> Result<Option<AttributeValue>> {
    with_state(|state| state.get(attr))
}

/// Sets `attr` on the current thread.
///
/// Fails with [`Error::InvalidArgument`] if `value` does not belong to
/// `attr`. Prefer [`with_scope`], which undoes the change on exit.
pub fn set(attr: Attribute, value: AttributeValue) -> Result<()> {
    with_state(|state| state.set(attr, value))?.map(drop)
}

/// Clears `attr` on the current thread.
pub fn clear(attr: Attribute) -> Result<()> {
    with_state(|state| state.take(attr)).map(drop)
}

/// Resets every attribute on the current thread.
///
/// Intended for the end of a logical unit of work, such as a request or a
/// test case.
pub fn clear_all() -> Result<()> {
    with_state(std::mem::take).map(drop)
}

/// The values of a set of attributes at one point in time, absence included.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    entries: Vec<(Attribute, Option<AttributeValue>)>,
}

impl Snapshot {
    /// The attributes covered by this snapshot.
    pub fn attributes(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.entries.iter().map(|(attr, _)| *attr)
    }

    /// The captured value of `attr`, `None` if it was absent or not captured.
    pub fn get(&self, attr: Attribute) -> Option<&AttributeValue> {
        self.entries
            .iter()
            .find(|(captured, _)| *captured == attr)
            .and_then(|(_, value)| value.as_ref())
    }

    /// Number of attributes covered.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this snapshot covers no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Makes this snapshot current until the returned guard is dropped.
    ///
    /// The guard puts back whatever the thread held for the same attributes
    /// before the call.
    pub fn attach(&self) -> Result<ScopeGuard> {
        let previous = snapshot(self.attributes())?;
        restore(self)?;
        Ok(ScopeGuard::new(previous))
    }

    fn push(&mut self, attr: Attribute, value: Option<AttributeValue>) {
        if !self.entries.iter().any(|(captured, _)| *captured == attr) {
            self.entries.push((attr, value));
        }
    }
}

/// Captures the current values of exactly `attrs`.
pub fn snapshot(attrs: impl IntoIterator<Item = Attribute>) -> Result<Snapshot> {
    with_state(|state| {
        let mut snapshot = Snapshot::default();
        for attr in attrs {
            snapshot.push(attr, state.get(attr));
        }
        snapshot
    })
}

/// Captures every attribute.
pub fn snapshot_all() -> Result<Snapshot> {
    snapshot(Attribute::all())
}

/// Writes back every value captured in `snapshot`, re-establishing absence
/// where absence was captured. Attributes the snapshot does not cover are left
/// alone, so the last restore wins for each attribute.
pub fn restore(snapshot: &Snapshot) -> Result<()> {
    let mut displaced = Vec::with_capacity(snapshot.len());
    let restored = with_state(|state| {
        snapshot.entries.iter().try_for_each(|(attr, value)| {
            displaced.extend(state.put(*attr, value.clone())?);
            Ok(())
        })
    });
    drop(displaced);
    restored?
}

/// Restores a [`Snapshot`] when dropped.
///
/// Returned by [`enter`] and [`Snapshot::attach`]. The guard is `!Send`: it
/// refers to the state of the thread that created it.
#[derive(Debug)]
#[must_use = "dropping the guard restores the previous scope immediately"]
pub struct ScopeGuard {
    snapshot: Snapshot,
    // Ensure this type is !Send as it relies on thread locals
    _marker: PhantomData<*const ()>,
}

impl ScopeGuard {
    fn new(snapshot: Snapshot) -> Self {
        ScopeGuard {
            snapshot,
            _marker: PhantomData,
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Err(err) = restore(&self.snapshot) {
            httpwatch_warn!(
                name: "Scope.RestoreFailed",
                attributes = self.snapshot.len(),
                message = err.to_string()
            );
        }
    }
}

/// Snapshots `attrs` together with every overridden attribute, applies
/// `overrides`, and returns a guard that restores the snapshot.
///
/// If an override is rejected, the attributes already applied are rolled back
/// before the error is returned.
pub fn enter(
    overrides: impl IntoIterator<Item = (Attribute, AttributeValue)>,
    attrs: impl IntoIterator<Item = Attribute>,
) -> Result<ScopeGuard> {
    let overrides: Vec<_> = overrides.into_iter().collect();
    let covered = attrs
        .into_iter()
        .chain(overrides.iter().map(|(attr, _)| *attr));
    let guard = ScopeGuard::new(snapshot(covered)?);
    for (attr, value) in overrides {
        // `guard` restores the partial update on early return.
        set(attr, value)?;
    }
    Ok(guard)
}

/// Runs `body` with `overrides` applied, restoring `attrs` and every
/// overridden attribute afterwards, whether `body` returns or unwinds.
pub fn with_scope<R>(
    overrides: impl IntoIterator<Item = (Attribute, AttributeValue)>,
    attrs: impl IntoIterator<Item = Attribute>,
    body: impl FnOnce() -> R,
) -> Result<R> {
    let _guard = enter(overrides, attrs)?;
    Ok(body())
}

/// Returns the current caller metadata.
pub fn metadata() -> Option<Metadata> {
    with_state(|state| state.metadata.clone()).ok().flatten()
}

/// Runs `body` with `metadata` merged over the current metadata; keys in
/// `metadata` win.
pub fn with_metadata<R>(metadata: Metadata, body: impl FnOnce() -> R) -> Result<R> {
    let mut merged = self::metadata().unwrap_or_default();
    merged.extend(metadata);
    with_scope(
        [(Attribute::Metadata, AttributeValue::Metadata(merged))],
        [],
        body,
    )
}

/// Returns the current caller association.
pub fn loggable() -> Option<Loggable> {
    with_state(|state| state.loggable.clone()).ok().flatten()
}

/// Runs `body` with captured calls associated with `loggable`.
pub fn with_loggable<R>(loggable: Loggable, body: impl FnOnce() -> R) -> Result<R> {
    with_scope(
        [(Attribute::Loggable, AttributeValue::Loggable(loggable))],
        [],
        body,
    )
}

/// Whether hooks are bypassed on this thread.
pub fn patches_disabled() -> bool {
    with_state(|state| state.patches_disabled).unwrap_or(false)
}

/// Runs `body` with every hook bypassed on this thread.
pub fn without_patches<R>(body: impl FnOnce() -> R) -> Result<R> {
    with_scope(
        [(Attribute::PatchesDisabled, AttributeValue::Flag(true))],
        [],
        body,
    )
}

/// Returns the call currently being captured on this thread, if any.
pub fn in_flight() -> Option<InFlight> {
    with_state(|state| state.in_flight).ok().flatten()
}

pub(crate) fn config_override() -> Option<Arc<Config>> {
    with_state(|state| state.config_override.clone())
        .ok()
        .flatten()
}

pub(crate) fn depth(library: Library) -> Result<usize> {
    with_state(|state| state.recursion_depth[library.index()])
}

pub(crate) fn update_depth(library: Library, f: impl FnOnce(usize) -> usize) -> Result<usize> {
    with_state(|state| {
        let slot = &mut state.recursion_depth[library.index()];
        *slot = f(*slot);
        *slot
    })
}
