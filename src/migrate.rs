//! Idempotent schema setup for the results database.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tickets (
        ticket_id TEXT PRIMARY KEY,
        trace_id TEXT NOT NULL,
        question TEXT NOT NULL,
        received_at TEXT NOT NULL,
        status TEXT NOT NULL,
        coherent INTEGER NOT NULL,
        question_type TEXT NOT NULL,
        flags TEXT NOT NULL DEFAULT '[]',
        category TEXT,
        reformulation TEXT,
        keywords TEXT NOT NULL DEFAULT '[]',
        mean_score REAL,
        source_count INTEGER,
        chunk_count INTEGER,
        verdict TEXT,
        final_confidence REAL,
        reason TEXT,
        timings TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS rag_docs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ticket_id TEXT NOT NULL,
        source TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        score REAL NOT NULL,
        rank INTEGER NOT NULL,
        text_preview TEXT NOT NULL,
        FOREIGN KEY (ticket_id) REFERENCES tickets(ticket_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS escalations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ticket_id TEXT NOT NULL,
        reason TEXT NOT NULL,
        priority TEXT NOT NULL,
        escalated_at TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at TEXT,
        FOREIGN KEY (ticket_id) REFERENCES tickets(ticket_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tickets_received_at ON tickets(received_at)",
    "CREATE INDEX IF NOT EXISTS idx_rag_docs_ticket ON rag_docs(ticket_id)",
    "CREATE INDEX IF NOT EXISTS idx_escalations_resolved ON escalations(resolved, priority)",
];

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
