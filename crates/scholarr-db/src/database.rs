//! Database connection and schema management.

use scholarr_common::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

use crate::schema;

/// Main database handle. Cheap to clone; wraps the connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if necessary) the database at `url`, e.g.
    /// `sqlite://scholarr.db` or `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests. Single connection so the schema and the
    /// test queries see the same database.
    pub async fn connect_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Apply the schema. Every statement is idempotent.
    pub async fn initialize(&self) -> Result<()> {
        for statement in schema::DDL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!(statements = schema::DDL.len(), "schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_backed_database_persists_across_reconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("scholarr.db").display());

        let db = Database::connect(&url).await.expect("connect");
        db.initialize().await.expect("initialize");
        sqlx::query(
            "INSERT INTO users (email, settings, created_at)
             VALUES ('ada@example.com', '{}', '2026-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .expect("insert");
        drop(db);

        let db = Database::connect(&url).await.expect("reconnect");
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn schema_applies_cleanly_and_reapplies() {
        let db = Database::connect_memory().await.expect("connect");
        // Second pass must be a no-op thanks to IF NOT EXISTS.
        db.initialize().await.expect("reinitialize");

        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )
        .fetch_one(db.pool())
        .await
        .expect("count tables");
        assert_eq!(n, 9);
    }
}
