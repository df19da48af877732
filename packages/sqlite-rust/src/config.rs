//! Store configuration.
//!
//! [`StoreConfig`] is the plain settings struct; [`StoreArgs`] is its
//! command-line form, with environment fallbacks for every flag so the
//! process-wide registry can configure itself without a command line.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};

/// Default database location.
pub const DEFAULT_DATABASE: &str = "/var/db/auth.sqlite";

/// Rows fetched per page while stepping a statement.
pub const DEFAULT_SCAN_BATCH: usize = 64;

/// Invalid store configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("scan batch size must be at least 1")]
    ZeroBatchSize,
    #[error("database path is empty")]
    EmptyDatabasePath,
    #[error("invalid store environment: {0}")]
    Environment(String),
}

/// Settings of a [`SqliteStore`](crate::store::SqliteStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Database file, opened read-only.
    pub database: PathBuf,
    /// How long `SQLite` waits on a locked database before reporting busy.
    /// Zero reports contention immediately.
    pub busy_timeout: Duration,
    /// Read query text from the `nss_queries` table.
    pub queries_from_table: bool,
    /// Rows fetched per page.
    pub scan_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            busy_timeout: Duration::ZERO,
            queries_from_table: false,
            scan_batch_size: DEFAULT_SCAN_BATCH,
        }
    }
}

impl StoreConfig {
    /// Default settings pointing at `database`.
    #[must_use]
    pub fn with_database(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError`] for an empty path or a zero batch size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if self.scan_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// Command-line form of [`StoreConfig`].
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Path to the `SQLite` database
    #[arg(long = "database", env = "NSSLITE_DATABASE", default_value = DEFAULT_DATABASE)]
    pub database: PathBuf,

    /// Busy timeout in milliseconds (0 reports contention immediately)
    #[arg(long = "busy-timeout-ms", env = "NSSLITE_BUSY_TIMEOUT_MS", default_value_t = 0)]
    pub busy_timeout_ms: u64,

    /// Read query text from the nss_queries table
    #[arg(long = "queries-from-table", env = "NSSLITE_QUERIES_FROM_TABLE")]
    pub queries_from_table: bool,

    /// Rows fetched per page
    #[arg(long = "scan-batch", env = "NSSLITE_SCAN_BATCH", default_value_t = DEFAULT_SCAN_BATCH)]
    pub scan_batch: usize,
}

#[derive(Parser, Debug)]
#[command(name = "nsslite")]
struct EnvOnly {
    #[command(flatten)]
    store: StoreArgs,
}

impl StoreArgs {
    /// Reads every setting from the `NSSLITE_*` environment, falling back to
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Environment`] when a variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        EnvOnly::try_parse_from(["nsslite"])
            .map(|parsed| parsed.store)
            .map_err(|e| ConfigError::Environment(e.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`ConfigError`] if the resulting config is invalid.
    pub fn into_config(self) -> Result<StoreConfig, ConfigError> {
        let config = StoreConfig {
            database: self.database,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            queries_from_table: self.queries_from_table,
            scan_batch_size: self.scan_batch,
        };
        config.validate()?;
        Ok(config)
    }
}
