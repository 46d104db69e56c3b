//! # strata_core
//!
//! Catalog store for the Strata cluster federation: cache-coherent entity
//! repositories over a durable record store, the monitoring-credential
//! allocator, and the cluster consistency reconciler.

pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod ids;
pub mod models;
pub mod reconcile;
pub mod repo;
pub mod store;
pub mod teardown;

pub use repo::{CatalogError, RepositoryContext};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
