//! Database connection pool, schema bootstrap, and health check.
//!
//! `Db` owns the Postgres pool for one queue table and implements
//! `RecordStore` over it (see `records`).

pub mod records;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::config::ConnectionConfig;
use crate::error::Result;

use records::Statements;

/// Database handle. Owns the connection pool and the table's statements.
pub struct Db {
    pool: PgPool,
    table: String,
    sql: Statements,
}

impl Db {
    /// Connect to Postgres by URL.
    pub async fn connect(url: &str, table: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Self::with_pool(pool, table)
    }

    /// Connect from discrete host/port/user/password/database fields.
    pub async fn connect_with(config: &ConnectionConfig, table: &str) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port);
        if let Some(ref user) = config.user {
            options = options.username(user);
        }
        if let Some(ref password) = config.password {
            options = options.password(password.expose_secret());
        }
        if let Some(ref database) = config.database {
            options = options.database(database);
        }

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, table)
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: PgPool, table: &str) -> Result<Self> {
        crate::config::validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            sql: Statements::for_table(&quote_table(table)),
        })
    }

    /// Create the queue table and its indexes if they don't exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        let quoted = quote_table(&self.table);
        let base = self.table.rsplit('.').next().unwrap_or(&self.table);

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {quoted} (
                hash            TEXT PRIMARY KEY,
                message         TEXT NOT NULL,
                topic           TEXT,
                is_processing   BOOLEAN NOT NULL DEFAULT FALSE,
                owner           TEXT,
                heartbeat_date  TIMESTAMPTZ NOT NULL DEFAULT now(),
                requeued        BOOLEAN NOT NULL DEFAULT FALSE
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"{base}_unclaimed\" ON {quoted} (topic)
             WHERE is_processing = FALSE"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS \"{base}_leases\" ON {quoted} (heartbeat_date)
             WHERE is_processing = TRUE"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Simple health check, run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// The table this handle operates on.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Underlying pool, for ad-hoc queries.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// `schema.table` -> `"schema"."table"`. Input is already validated.
fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(|part| format!("\"{part}\""))
        .collect::<Vec<_>>()
        .join(".")
}
