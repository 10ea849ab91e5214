//! Connection to the results database.
//!
//! The database holds `tickets`, their retrieved evidence (`rag_docs`) and
//! the human `escalations` queue; see [`crate::migrate`] for the schema.
//! `hdx ticket` and a running `hdx serve` may write to it at the same time,
//! so connections use WAL with a busy timeout instead of failing on a
//! locked file. Evidence and escalation rows reference their ticket, and
//! foreign keys are enforced on every connection.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 5;

fn connect_options(config: &Config) -> Result<SqliteConnectOptions> {
    let db_path = &config.db.path;
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .with_context(|| format!("Invalid results database path: {}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);
    Ok(options)
}

/// Open the results database, creating the file and its parent directory
/// on first use.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(connect_options(config)?)
        .await
        .with_context(|| format!("Failed to open results database {}", db_path.display()))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_enforces_foreign_keys_and_wal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::minimal(&tmp.path().join("nested"));
        let pool = connect(&config).await.unwrap();
        assert!(config.db.path.exists());

        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(fk, 1);
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_evidence_requires_ticket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        let pool = connect(&config).await.unwrap();
        crate::migrate::apply_schema(&pool).await.unwrap();

        let orphan = sqlx::query(
            "INSERT INTO rag_docs (ticket_id, source, chunk_index, score, rank, text_preview) VALUES ('missing', 'faq', 0, 0.5, 1, '')",
        )
        .execute(&pool)
        .await;
        assert!(orphan.is_err());
    }
}
