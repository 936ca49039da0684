use crate::httpwatch_debug;
use crate::registry::Registry;
use std::sync::{Arc, OnceLock};

/// The global interception `Registry` singleton.
static GLOBAL_REGISTRY: OnceLock<Arc<Registry>> = OnceLock::new();

/// Returns the process-wide interception [`Registry`].
///
/// It probes library presence with [`Library::is_linked`](crate::Library::is_linked).
pub fn registry() -> Arc<Registry> {
    GLOBAL_REGISTRY
        .get_or_init(|| {
            httpwatch_debug!(name: "Registry.GlobalInitialized");
            Arc::new(Registry::new())
        })
        .clone()
}
