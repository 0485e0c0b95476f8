//! SQLite connection pool.
//!
//! One database file holds everything: relational rows and the embedding
//! BLOBs. WAL mode keeps readers (chat history, vector scans) unblocked
//! while a turn writes messages and cache entries.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::DbConfig;

pub async fn connect(config: &DbConfig) -> Result<SqlitePool> {
    if let Some(parent) = config.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_creates_file_and_parent_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = DbConfig {
            path: tmp.path().join("nested").join("ragdock.sqlite"),
            max_connections: 1,
        };

        let pool = connect(&config).await.unwrap();
        assert!(config.path.exists());

        // Pool is usable for a trivial query
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }
}
