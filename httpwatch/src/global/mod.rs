//! Process-wide control plane state.
//!
//! Two things are shared between threads: the global [`Config`] and the
//! interception [`Registry`]. Both are created on first access, exactly once,
//! even when many threads race for it.
//!
//! ```
//! use httpwatch::{global, Library};
//!
//! let registry = global::registry();
//! let status = registry.status(Library::Reqwest);
//! assert!(!status.active || status.installed);
//! ```
//!
//! [`Registry`]: crate::registry::Registry

mod config;
mod registry;

pub use config::{config, set_config, update_config};
pub use registry::registry;

pub(crate) use crate::config::Config;
