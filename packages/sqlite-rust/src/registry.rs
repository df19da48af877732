//! Process-wide resolver.
//!
//! Host entry points are free functions with no context argument, so the
//! resolver they share lives here. It is created on first use from the
//! `NSSLITE_*` environment unless [`install`] was called first.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use nsslite_core::Resolver;

use crate::config::{ConfigError, StoreArgs, StoreConfig};
use crate::store::SqliteStore;

pub type SqliteResolver = Resolver<SqliteStore>;

static RESOLVER: RwLock<Option<Arc<SqliteResolver>>> = RwLock::new(None);

/// Installs a resolver built from `config`, replacing any existing one.
///
/// Scans open on the replaced resolver are ended.
///
/// # Errors
///
/// Returns [`ConfigError`] if `config` does not validate.
pub fn install(config: StoreConfig) -> Result<Arc<SqliteResolver>, ConfigError> {
    let resolver = Arc::new(Resolver::new(SqliteStore::new(config)?));
    let previous = RESOLVER.write().replace(Arc::clone(&resolver));
    if let Some(previous) = previous {
        close(&previous);
    }
    info!(
        database = %resolver.store().config().database.display(),
        "installed resolver"
    );
    Ok(resolver)
}

/// The shared resolver, created from the environment on first use.
///
/// # Errors
///
/// Returns [`ConfigError`] if no resolver is installed and the environment
/// does not describe a valid store.
pub fn resolver() -> Result<Arc<SqliteResolver>, ConfigError> {
    if let Some(resolver) = RESOLVER.read().as_ref() {
        return Ok(Arc::clone(resolver));
    }

    let mut slot = RESOLVER.write();
    if let Some(resolver) = slot.as_ref() {
        return Ok(Arc::clone(resolver));
    }
    let config = StoreArgs::from_env()?.into_config()?;
    debug!(database = %config.database.display(), "creating resolver from environment");
    let resolver = Arc::new(Resolver::new(SqliteStore::new(config)?));
    *slot = Some(Arc::clone(&resolver));
    Ok(resolver)
}

/// Removes the shared resolver and ends its scans.
pub fn teardown() {
    let previous = RESOLVER.write().take();
    if let Some(previous) = previous {
        close(&previous);
        debug!("resolver torn down");
    }
}

fn close(resolver: &SqliteResolver) {
    if let Err(e) = resolver.end_all_scans() {
        warn!(error = %e, "failed to end scans of replaced resolver");
    }
}
