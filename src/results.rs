//! Ticket outcomes, retrieved evidence, and the human escalation queue,
//! persisted in the SQLite results database.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::pipeline::TicketOutcome;

const PREVIEW_CHARS: usize = 200;

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// Store a processed ticket. Re-recording the same ticket id replaces its
/// row and evidence, and reopens its escalation if the new outcome has one.
pub async fn record_outcome(pool: &SqlitePool, outcome: &TicketOutcome) -> Result<()> {
    let mut tx = pool.begin().await?;

    let query = outcome.query.as_ref();
    let retrieval = outcome.retrieval.as_ref();
    let decision = outcome.decision.as_ref();

    sqlx::query(
        r#"
        INSERT INTO tickets (
            ticket_id, trace_id, question, received_at, status, coherent,
            question_type, flags, category, reformulation, keywords,
            mean_score, source_count, chunk_count, verdict, final_confidence,
            reason, timings
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(ticket_id) DO UPDATE SET
            trace_id = excluded.trace_id,
            question = excluded.question,
            received_at = excluded.received_at,
            status = excluded.status,
            coherent = excluded.coherent,
            question_type = excluded.question_type,
            flags = excluded.flags,
            category = excluded.category,
            reformulation = excluded.reformulation,
            keywords = excluded.keywords,
            mean_score = excluded.mean_score,
            source_count = excluded.source_count,
            chunk_count = excluded.chunk_count,
            verdict = excluded.verdict,
            final_confidence = excluded.final_confidence,
            reason = excluded.reason,
            timings = excluded.timings
        "#,
    )
    .bind(&outcome.ticket_id)
    .bind(&outcome.trace_id)
    .bind(&outcome.question)
    .bind(&outcome.received_at)
    .bind(outcome.status.as_str())
    .bind(outcome.triage.coherent)
    .bind(outcome.triage.question_type.as_str())
    .bind(serde_json::to_string(&outcome.triage.flags)?)
    .bind(query.map(|q| q.category.clone()))
    .bind(query.map(|q| q.reformulation.clone()))
    .bind(serde_json::to_string(&query.map(|q| q.keywords.as_slice()).unwrap_or_default())?)
    .bind(retrieval.map(|r| r.mean_score))
    .bind(retrieval.map(|r| r.source_count() as i64))
    .bind(retrieval.map(|r| r.chunk_count as i64))
    .bind(decision.map(|d| d.verdict.as_str()))
    .bind(decision.map(|d| d.final_confidence))
    .bind(
        outcome
            .escalation
            .as_ref()
            .map(|e| e.reason.clone())
            .or_else(|| decision.map(|d| d.reason.clone())),
    )
    .bind(serde_json::to_string(&outcome.timings)?)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM rag_docs WHERE ticket_id = ?")
        .bind(&outcome.ticket_id)
        .execute(&mut *tx)
        .await?;
    if let Some(result) = retrieval {
        for (rank, chunk) in result.chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO rag_docs (ticket_id, source, chunk_index, score, rank, text_preview) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&outcome.ticket_id)
            .bind(&chunk.source)
            .bind(chunk.chunk_index as i64)
            .bind(chunk.final_score() as f64)
            .bind(rank as i64 + 1)
            .bind(preview(&chunk.text))
            .execute(&mut *tx)
            .await?;
        }
    }

    sqlx::query("DELETE FROM escalations WHERE ticket_id = ? AND resolved = 0")
        .bind(&outcome.ticket_id)
        .execute(&mut *tx)
        .await?;
    if let Some(escalation) = &outcome.escalation {
        sqlx::query(
            "INSERT INTO escalations (ticket_id, reason, priority, escalated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&outcome.ticket_id)
        .bind(&escalation.reason)
        .bind(escalation.priority.as_str())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct EscalationRecord {
    pub id: i64,
    pub ticket_id: String,
    pub question: String,
    pub reason: String,
    pub priority: String,
    pub escalated_at: String,
    pub resolved: bool,
    pub resolved_at: Option<String>,
}

/// Escalations ordered most urgent first, then oldest first.
pub async fn list_escalations(
    pool: &SqlitePool,
    unresolved_only: bool,
) -> Result<Vec<EscalationRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT e.id, e.ticket_id, COALESCE(t.question, '') AS question, e.reason,
               e.priority, e.escalated_at, e.resolved, e.resolved_at
        FROM escalations e
        LEFT JOIN tickets t ON t.ticket_id = e.ticket_id
        WHERE (? = 0 OR e.resolved = 0)
        ORDER BY
            CASE e.priority
                WHEN 'critical' THEN 0
                WHEN 'high' THEN 1
                WHEN 'medium' THEN 2
                ELSE 3
            END,
            e.escalated_at ASC,
            e.id ASC
        "#,
    )
    .bind(unresolved_only)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| EscalationRecord {
            id: row.get("id"),
            ticket_id: row.get("ticket_id"),
            question: row.get("question"),
            reason: row.get("reason"),
            priority: row.get("priority"),
            escalated_at: row.get("escalated_at"),
            resolved: row.get::<i64, _>("resolved") != 0,
            resolved_at: row.get("resolved_at"),
        })
        .collect())
}

/// Mark every open escalation of `ticket_id` resolved. Returns how many
/// were closed.
pub async fn resolve_escalation(pool: &SqlitePool, ticket_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE escalations SET resolved = 1, resolved_at = ? WHERE ticket_id = ? AND resolved = 0",
    )
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(ticket_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentTicket {
    pub ticket_id: String,
    pub received_at: String,
    pub status: String,
    pub category: Option<String>,
    pub final_confidence: Option<f64>,
}

pub async fn recent_tickets(pool: &SqlitePool, limit: i64) -> Result<Vec<RecentTicket>> {
    let rows = sqlx::query(
        "SELECT ticket_id, received_at, status, category, final_confidence FROM tickets ORDER BY received_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RecentTicket {
            ticket_id: row.get("ticket_id"),
            received_at: row.get("received_at"),
            status: row.get("status"),
            category: row.get("category"),
            final_confidence: row.get("final_confidence"),
        })
        .collect())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultsStats {
    pub total_tickets: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_category: BTreeMap<String, i64>,
    pub mean_confidence: Option<f64>,
    pub open_escalations: i64,
    pub open_by_priority: BTreeMap<String, i64>,
    /// Sources most often cited as evidence, most frequent first.
    pub top_sources: Vec<(String, i64)>,
}

async fn grouped_counts(pool: &SqlitePool, sql: &str) -> Result<BTreeMap<String, i64>> {
    let rows = sqlx::query(sql).fetch_all(pool).await?;
    Ok(rows
        .iter()
        .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1)))
        .collect())
}

pub async fn fetch_stats(pool: &SqlitePool) -> Result<ResultsStats> {
    let total_tickets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tickets")
        .fetch_one(pool)
        .await?;
    let mean_confidence: Option<f64> =
        sqlx::query_scalar("SELECT AVG(final_confidence) FROM tickets WHERE final_confidence IS NOT NULL")
            .fetch_one(pool)
            .await?;
    let open_escalations: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM escalations WHERE resolved = 0")
            .fetch_one(pool)
            .await?;

    let top_sources = sqlx::query(
        "SELECT source, COUNT(*) AS n FROM rag_docs GROUP BY source ORDER BY n DESC, source ASC LIMIT 5",
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| (row.get::<String, _>("source"), row.get::<i64, _>("n")))
    .collect();

    Ok(ResultsStats {
        total_tickets,
        by_status: grouped_counts(pool, "SELECT status, COUNT(*) FROM tickets GROUP BY status").await?,
        by_category: grouped_counts(
            pool,
            "SELECT category, COUNT(*) FROM tickets WHERE category IS NOT NULL GROUP BY category",
        )
        .await?,
        mean_confidence,
        open_escalations,
        open_by_priority: grouped_counts(
            pool,
            "SELECT priority, COUNT(*) FROM escalations WHERE resolved = 0 GROUP BY priority",
        )
        .await?,
        top_sources,
    })
}

/// Run the stats command: query the results database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;

    let stats = fetch_stats(&pool).await?;
    let recent = recent_tickets(&pool, 5).await?;

    println!("Helpdesk Harness Results");
    println!("========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Tickets:     {}", stats.total_tickets);
    for (status, n) in &stats.by_status {
        println!("    {:<12} {:>6}", status, n);
    }
    match stats.mean_confidence {
        Some(c) => println!("  Confidence:  {:.3} (mean)", c),
        None => println!("  Confidence:  n/a"),
    }
    println!("  Open escalations: {}", stats.open_escalations);
    for (priority, n) in &stats.open_by_priority {
        println!("    {:<12} {:>6}", priority, n);
    }

    if !stats.by_category.is_empty() {
        println!();
        println!("  By category:");
        for (category, n) in &stats.by_category {
            println!("    {:<20} {:>6}", category, n);
        }
    }

    if !stats.top_sources.is_empty() {
        println!();
        println!("  Most cited sources:");
        for (source, n) in &stats.top_sources {
            println!("    {:<24} {:>6}", source, n);
        }
    }

    if !recent.is_empty() {
        println!();
        println!("  Recent tickets:");
        println!(
            "  {:<16} {:<12} {:<16} {:>10}   {}",
            "TICKET", "STATUS", "CATEGORY", "CONFIDENCE", "RECEIVED"
        );
        println!("  {}", "-".repeat(80));
        for t in &recent {
            println!(
                "  {:<16} {:<12} {:<16} {:>10}   {}",
                t.ticket_id,
                t.status,
                t.category.as_deref().unwrap_or("-"),
                t.final_confidence
                    .map(|c| format!("{:.3}", c))
                    .unwrap_or_else(|| "-".to_string()),
                format_received(&t.received_at),
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

fn format_received(ts: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Escalation, StageTimings, TicketOutcome, TicketStatus};
    use crate::triage::triage;
    use helpdesk_harness_core::confidence::decide;
    use helpdesk_harness_core::models::{Priority, QueryData, RetrievalCandidate, RetrievalResult};
    use std::collections::BTreeSet;

    async fn pool(tmp: &tempfile::TempDir) -> SqlitePool {
        let config = Config::minimal(tmp.path());
        let pool = db::connect(&config).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        pool
    }

    fn outcome(id: &str, mean: f64, escalation: Option<Priority>) -> TicketOutcome {
        let chunk = RetrievalCandidate {
            source: "faq".into(),
            chunk_index: 2,
            position: 2,
            text: "Invoices are in the billing page.".into(),
            score: mean as f32,
            rerank_score: None,
        };
        let retrieval = RetrievalResult {
            chunks: vec![chunk],
            evidence: String::new(),
            sources: BTreeSet::from(["faq".to_string()]),
            chunk_count: 1,
            mean_score: mean,
        };
        let decision = decide(mean, 1, 1);
        TicketOutcome {
            ticket_id: id.into(),
            trace_id: "abcd1234".into(),
            question: "Where are my invoices?".into(),
            received_at: chrono::Utc::now().to_rfc3339(),
            status: if escalation.is_some() {
                TicketStatus::Escalated
            } else {
                TicketStatus::Answerable
            },
            triage: triage("Where are my invoices?"),
            query: Some(QueryData {
                reformulation: "where are my invoices".into(),
                keywords: vec!["invoices".into()],
                category: "billing".into(),
                documents: vec![],
            }),
            retrieval: Some(retrieval),
            escalation: escalation.map(|priority| Escalation {
                priority,
                reason: decision.reason.clone(),
            }),
            decision: Some(decision),
            timings: StageTimings::default(),
        }
    }

    #[tokio::test]
    async fn test_record_and_stats() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        record_outcome(&pool, &outcome("T-1", 0.8, None)).await.unwrap();
        record_outcome(&pool, &outcome("T-2", 0.2, Some(Priority::High)))
            .await
            .unwrap();

        let stats = fetch_stats(&pool).await.unwrap();
        assert_eq!(stats.total_tickets, 2);
        assert_eq!(stats.by_status.get("answerable"), Some(&1));
        assert_eq!(stats.by_status.get("escalated"), Some(&1));
        assert_eq!(stats.by_category.get("billing"), Some(&2));
        assert_eq!(stats.open_escalations, 1);
        assert_eq!(stats.top_sources, vec![("faq".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_rerecord_replaces_evidence() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        record_outcome(&pool, &outcome("T-1", 0.2, Some(Priority::High)))
            .await
            .unwrap();
        record_outcome(&pool, &outcome("T-1", 0.2, Some(Priority::High)))
            .await
            .unwrap();

        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rag_docs WHERE ticket_id = 'T-1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(docs, 1);
        assert_eq!(list_escalations(&pool, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_escalations_ordered_and_resolved() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = pool(&tmp).await;

        record_outcome(&pool, &outcome("T-low", 0.55, Some(Priority::Low)))
            .await
            .unwrap();
        record_outcome(&pool, &outcome("T-crit", 0.1, Some(Priority::Critical)))
            .await
            .unwrap();

        let open = list_escalations(&pool, true).await.unwrap();
        let ids: Vec<&str> = open.iter().map(|e| e.ticket_id.as_str()).collect();
        assert_eq!(ids, vec!["T-crit", "T-low"]);
        assert_eq!(open[0].question, "Where are my invoices?");

        assert_eq!(resolve_escalation(&pool, "T-crit").await.unwrap(), 1);
        assert_eq!(resolve_escalation(&pool, "T-crit").await.unwrap(), 0);

        assert_eq!(list_escalations(&pool, true).await.unwrap().len(), 1);
        let all = list_escalations(&pool, false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|e| e.resolved && e.resolved_at.is_some()));
    }
}
