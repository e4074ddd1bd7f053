//! Environment configuration shared by the binaries

use crate::error::{ConfigError, StoreError};
use crate::store::{MemoryStore, PgRecordStore, RecordStore, DEFAULT_BATCH_SIZE};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { db_url: String, max_connections: u32 },
    /// Process-local, lost on exit
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub batch_size: usize,
}

impl StoreConfig {
    /// Read `STORE`, `DB_URL`, `DB_MAX_CONNECTIONS` and `INSERT_BATCH_SIZE`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let batch_size = parse_or(&lookup, "INSERT_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "INSERT_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        let backend = match lookup("STORE").as_deref().map(str::trim) {
            Some("memory") => StoreBackend::Memory,
            None | Some("") | Some("postgres") => StoreBackend::Postgres {
                db_url: lookup("DB_URL").ok_or(ConfigError::Missing("DB_URL"))?,
                max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STORE",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            backend,
            batch_size,
        })
    }

    /// Open the configured store, creating the Postgres schema if needed
    pub async fn connect(&self) -> Result<Arc<dyn RecordStore>, StoreError> {
        match &self.backend {
            StoreBackend::Postgres {
                db_url,
                max_connections,
            } => {
                let store = PgRecordStore::connect(db_url, *max_connections).await?;
                store.ensure_schema().await?;
                info!(max_connections, "connected to Postgres");
                Ok(Arc::new(store))
            }
            StoreBackend::Memory => {
                info!("using in-memory store");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<StoreConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StoreConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_postgres_defaults() {
        let cfg = config(&[("DB_URL", "postgres://localhost/sales")]).unwrap();
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(
            cfg.backend,
            StoreBackend::Postgres {
                db_url: "postgres://localhost/sales".to_string(),
                max_connections: 10,
            }
        );
    }

    #[test]
    fn test_missing_db_url() {
        assert!(matches!(config(&[]), Err(ConfigError::Missing("DB_URL"))));
    }

    #[test]
    fn test_memory_store_needs_no_db_url() {
        let cfg = config(&[("STORE", "memory"), ("INSERT_BATCH_SIZE", "250")]).unwrap();
        assert_eq!(cfg.backend, StoreBackend::Memory);
        assert_eq!(cfg.batch_size, 250);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config(&[("STORE", "memory"), ("INSERT_BATCH_SIZE", "lots")]),
            Err(ConfigError::Invalid { name: "INSERT_BATCH_SIZE", .. })
        ));
        assert!(matches!(
            config(&[("STORE", "memory"), ("INSERT_BATCH_SIZE", "0")]),
            Err(ConfigError::Invalid { name: "INSERT_BATCH_SIZE", .. })
        ));
        assert!(matches!(
            config(&[("STORE", "mongo")]),
            Err(ConfigError::Invalid { name: "STORE", .. })
        ));
    }
}
