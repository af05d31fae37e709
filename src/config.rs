use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::framework::entity::UnknownFieldPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub mapper: MapperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub capacity: usize,
    pub default_ttl_secs: u64,
    pub key_prefix: String,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl_secs: 300,
            key_prefix: "commerce".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperConfig {
    pub unknown_fields: UnknownFieldPolicy,
    pub default_page_limit: i64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            unknown_fields: UnknownFieldPolicy::Ignore,
            default_page_limit: 50,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let unknown_fields = match env::var("UNKNOWN_FIELD_POLICY") {
            Ok(value) => value
                .parse()
                .map_err(|e| anyhow::anyhow!("UNKNOWN_FIELD_POLICY: {}", e))?,
            Err(_) => UnknownFieldPolicy::Ignore,
        };

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            cache: CacheConfig {
                capacity: env::var("CACHE_CAPACITY")
                    .unwrap_or_else(|_| "1000".to_string())
                    .parse()
                    .unwrap_or(1000),
                default_ttl_secs: env::var("CACHE_DEFAULT_TTL_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300),
                key_prefix: env::var("CACHE_KEY_PREFIX")
                    .unwrap_or_else(|_| "commerce".to_string()),
            },
            mapper: MapperConfig {
                unknown_fields,
                default_page_limit: env::var("DEFAULT_PAGE_LIMIT")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
            },
        })
    }

    /// In-memory database, default cache and mapper settings.
    pub fn in_memory() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 1,
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            cache: CacheConfig::default(),
            mapper: MapperConfig::default(),
        }
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
