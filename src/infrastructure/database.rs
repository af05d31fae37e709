// Database - SQLite storage for the entity graph
// Two tables: `entities` holds every row of every entity type, `entity_links`
// holds association collections.

use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::QueryBuilder;
use std::str::FromStr;
use tracing::info;

use crate::error::{AppError, AppResult};

/// Current time in milliseconds since Unix epoch
pub fn current_time_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A bindable SQL parameter of any supported type
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
    Real(f64),
    Null,
}

impl SqlParam {
    pub fn push_to(self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            SqlParam::Text(v) => qb.push_bind(v),
            SqlParam::Integer(v) => qb.push_bind(v),
            SqlParam::Real(v) => qb.push_bind(v),
            SqlParam::Null => qb.push_bind(Option::<String>::None),
        };
    }
}

pub struct Database {
    pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("size", &self.pool.size())
            .field("idle", &self.pool.num_idle())
            .finish()
    }
}

impl Database {
    /// Connect to the database at `url`. In-memory databases are pinned to a
    /// single long-lived connection, since each SQLite connection would
    /// otherwise see its own empty database.
    pub async fn connect(url: &str, max_connections: u32) -> AppResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| AppError::ConfigurationError(format!("Invalid database url {}: {}", url, e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to connect to {}: {}", url, e)))?;

        info!("Connected to database {}", url);
        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> AppResult<Self> {
        let db = Self::connect("sqlite::memory:", 1).await?;
        db.initialize().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn initialize(&self) -> AppResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                channel INTEGER,
                platform_id TEXT,
                platform_created_at TEXT,
                data TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::PersistenceError(format!("Failed to create entities table: {}", e)))?;

        // NULL platform ids never collide, so non-channeled rows are unaffected.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_platform ON entities(entity_type, channel, platform_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::PersistenceError(format!("Failed to create platform index: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type, id)")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to create type index: {}", e)))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_links (
                owner_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                field TEXT NOT NULL,
                target_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
                PRIMARY KEY (owner_id, field, target_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::PersistenceError(format!("Failed to create links table: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entity_links_target ON entity_links(target_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::PersistenceError(format!("Failed to create links index: {}", e)))?;

        Ok(())
    }

    /// Health check to verify database connectivity
    pub async fn health_check(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::PersistenceError(format!("Database health check failed: {}", e)))?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
