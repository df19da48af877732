//! `nsslite` `SQLite` backend: the store adapter, its configuration and the
//! process-wide resolver.

pub mod config;
pub mod logging;
pub mod queries;
pub mod registry;
pub mod store;

pub use config::{ConfigError, StoreArgs, StoreConfig};
pub use store::SqliteStore;

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
