//! Catalog configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::store::schema::SchemaConfig;

/// Default TTL for single-record caches.
pub const DEFAULT_RECORD_TTL: Duration = Duration::from_secs(30);
/// Default TTL for category and whole-table listings.
pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(60);
/// Default prefix of per-tenant namespaces on member clusters.
pub const DEFAULT_TENANT_NAMESPACE_PREFIX: &str = "tenant-";

/// Cache lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub record: Duration,
    pub listing: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            record: DEFAULT_RECORD_TTL,
            listing: DEFAULT_LISTING_TTL,
        }
    }
}

/// Configuration for the catalog.
#[derive(Clone, Debug)]
pub struct CatalogConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Upper bound of the connection pool.
    pub max_connections: u32,
    /// File holding the secret encryption key material.
    pub encryption_key_file: PathBuf,
    /// Rows per store page; `None` keeps the store default.
    pub page_size: Option<usize>,
    pub cache: CacheTtls,
    pub schema: SchemaConfig,
    /// Bound on the credential allocation retry loop; `None` retries until
    /// cancelled.
    pub allocation_deadline: Option<Duration>,
    /// Namespaces on member clusters starting with this prefix belong to
    /// tenants.
    pub tenant_namespace_prefix: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/strata".into(),
            max_connections: 10,
            encryption_key_file: PathBuf::from("encryptionKey"),
            page_size: None,
            cache: CacheTtls::default(),
            schema: SchemaConfig::default(),
            allocation_deadline: None,
            tenant_namespace_prefix: DEFAULT_TENANT_NAMESPACE_PREFIX.into(),
        }
    }
}

impl CatalogConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                          | Default                             |
    /// |-----------------------------------|-------------------------------------|
    /// | `DATABASE_URL`                    | `postgres://localhost:5432/strata`  |
    /// | `STRATA_MAX_CONNECTIONS`          | `10`                                |
    /// | `STRATA_ENCRYPTION_KEY_FILE`      | `encryptionKey`                     |
    /// | `STRATA_CACHE_TTL_SECS`           | `30`                                |
    /// | `STRATA_LIST_TTL_SECS`            | `60`                                |
    /// | `STRATA_PAGE_SIZE`                | store default                       |
    /// | `STRATA_SCHEMA_POLL_MS`           | `500`                               |
    /// | `STRATA_SCHEMA_MAX_WAIT_SECS`     | `600`                               |
    /// | `STRATA_ALLOCATION_DEADLINE_SECS` | unbounded                           |
    /// | `STRATA_TENANT_NAMESPACE_PREFIX`  | `tenant-`                           |
    ///
    /// Unparseable numbers are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            parsed::<u64>(&get, name).map_or(default, Duration::from_secs)
        };
        Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parsed(&get, "STRATA_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            encryption_key_file: get("STRATA_ENCRYPTION_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.encryption_key_file),
            page_size: parsed::<usize>(&get, "STRATA_PAGE_SIZE").filter(|n| *n > 0),
            cache: CacheTtls {
                record: secs("STRATA_CACHE_TTL_SECS", defaults.cache.record),
                listing: secs("STRATA_LIST_TTL_SECS", defaults.cache.listing),
            },
            schema: SchemaConfig {
                poll_interval: parsed::<u64>(&get, "STRATA_SCHEMA_POLL_MS")
                    .map_or(defaults.schema.poll_interval, Duration::from_millis),
                max_wait: secs("STRATA_SCHEMA_MAX_WAIT_SECS", defaults.schema.max_wait),
            },
            allocation_deadline: parsed::<u64>(&get, "STRATA_ALLOCATION_DEADLINE_SECS")
                .map(Duration::from_secs),
            tenant_namespace_prefix: get("STRATA_TENANT_NAMESPACE_PREFIX")
                .unwrap_or(defaults.tenant_namespace_prefix),
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = get(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = CatalogConfig::from_lookup(lookup(&[]));
        assert_eq!(config.database_url, "postgres://localhost:5432/strata");
        assert_eq!(config.cache, CacheTtls::default());
        assert_eq!(config.schema, SchemaConfig::default());
        assert_eq!(config.allocation_deadline, None);
        assert_eq!(config.page_size, None);
        assert_eq!(config.tenant_namespace_prefix, "tenant-");
    }

    #[test]
    fn reads_overrides() {
        let config = CatalogConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/catalog"),
            ("STRATA_MAX_CONNECTIONS", "32"),
            ("STRATA_ENCRYPTION_KEY_FILE", "/etc/strata/key"),
            ("STRATA_CACHE_TTL_SECS", "5"),
            ("STRATA_LIST_TTL_SECS", "7"),
            ("STRATA_PAGE_SIZE", "25"),
            ("STRATA_SCHEMA_POLL_MS", "100"),
            ("STRATA_SCHEMA_MAX_WAIT_SECS", "9"),
            ("STRATA_ALLOCATION_DEADLINE_SECS", "15"),
            ("STRATA_TENANT_NAMESPACE_PREFIX", "slate-group-"),
        ]));
        assert_eq!(config.database_url, "postgres://db/catalog");
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.encryption_key_file, PathBuf::from("/etc/strata/key"));
        assert_eq!(config.cache.record, Duration::from_secs(5));
        assert_eq!(config.cache.listing, Duration::from_secs(7));
        assert_eq!(config.page_size, Some(25));
        assert_eq!(config.schema.poll_interval, Duration::from_millis(100));
        assert_eq!(config.schema.max_wait, Duration::from_secs(9));
        assert_eq!(config.allocation_deadline, Some(Duration::from_secs(15)));
        assert_eq!(config.tenant_namespace_prefix, "slate-group-");
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = CatalogConfig::from_lookup(lookup(&[
            ("STRATA_MAX_CONNECTIONS", "many"),
            ("STRATA_PAGE_SIZE", "0"),
        ]));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.page_size, None);
    }
}
