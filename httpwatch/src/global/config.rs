use super::Config;
use crate::{httpwatch_debug, httpwatch_error, httpwatch_info};
use std::sync::{Arc, OnceLock, RwLock};

/// The global `Config` singleton.
static GLOBAL_CONFIG: OnceLock<RwLock<Arc<Config>>> = OnceLock::new();

#[inline]
fn global_config() -> &'static RwLock<Arc<Config>> {
    init_config(&GLOBAL_CONFIG, Config::default)
}

fn init_config(
    slot: &OnceLock<RwLock<Arc<Config>>>,
    make: impl FnOnce() -> Config,
) -> &RwLock<Arc<Config>> {
    slot.get_or_init(|| {
        httpwatch_debug!(name: "Config.GlobalInitialized");
        RwLock::new(Arc::new(make()))
    })
}

/// Returns the process-wide [`Config`].
pub fn config() -> Arc<Config> {
    match global_config().read() {
        Ok(config) => config.clone(),
        Err(poisoned) => {
            // Writers only swap a whole `Arc`, so the value is never half-written.
            httpwatch_error!(name: "Config.GlobalLockPoisoned");
            poisoned.into_inner().clone()
        }
    }
}

/// Publishes `new_config` as the process-wide [`Config`], returning the
/// previous value.
pub fn set_config(new_config: Config) -> Arc<Config> {
    let mut global = global_config()
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let previous = std::mem::replace(&mut *global, Arc::new(new_config));
    httpwatch_info!(name: "Config.GlobalSet");
    previous
}

/// Applies `f` to a copy of the process-wide [`Config`] and publishes the
/// result.
///
/// `f` runs without any lock held, so it may read the configuration itself.
/// If another thread published in the meantime, `f` runs again on a copy of
/// the newer value.
pub fn update_config(mut f: impl FnMut(&mut Config)) {
    loop {
        let current = config();
        let mut updated = Config::clone(&current);
        f(&mut updated);

        let mut global = global_config()
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if Arc::ptr_eq(&global, &current) {
            *global = Arc::new(updated);
            break;
        }
        httpwatch_debug!(name: "Config.GlobalUpdateRetried");
    }
    httpwatch_info!(name: "Config.GlobalUpdated");
}
