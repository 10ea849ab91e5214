//! Ticket pipeline: triage → analysis → retrieval → confidence.
//!
//! Produces a [`TicketOutcome`] that is either ready for response
//! generation (`answerable`), handed to a human (`escalated`), or discarded
//! as unreadable (`rejected`). Response generation itself happens outside
//! this crate; the outcome carries the evidence text it needs.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use helpdesk_harness_core::augment::QueryAugmenter;
use helpdesk_harness_core::confidence::{ConfidenceInput, FallbackPolicy};
use helpdesk_harness_core::embedding::Embedder;
use helpdesk_harness_core::error::RetrievalError;
use helpdesk_harness_core::index::SharedIndex;
use helpdesk_harness_core::models::{ConfidenceDecision, Priority, QueryData, RetrievalResult};
use helpdesk_harness_core::retrieve::Retriever;

use crate::analysis::QueryAnalyzer;
use crate::config::Config;
use crate::policy::build_policy;
use crate::triage::{triage, TriageReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Answerable,
    Escalated,
    Rejected,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Answerable => "answerable",
            TicketStatus::Escalated => "escalated",
            TicketStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Escalation {
    pub priority: Priority,
    pub reason: String,
}

/// Wall-clock time per stage, in milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub triage_ms: f64,
    pub analysis_ms: f64,
    pub retrieval_ms: f64,
    pub confidence_ms: f64,
    pub total_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketOutcome {
    pub ticket_id: String,
    pub trace_id: String,
    pub question: String,
    pub received_at: String,
    pub status: TicketStatus,
    pub triage: TriageReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ConfidenceDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    pub timings: StageTimings,
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

pub fn new_ticket_id() -> String {
    format!("TKT-{}", short_id().to_uppercase())
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct TicketPipeline {
    retriever: Retriever,
    analyzer: QueryAnalyzer,
    policy: FallbackPolicy,
    top_k: usize,
    use_augmentation: bool,
}

impl TicketPipeline {
    pub fn new(
        retriever: Retriever,
        analyzer: QueryAnalyzer,
        policy: FallbackPolicy,
        top_k: usize,
        use_augmentation: bool,
    ) -> Self {
        Self {
            retriever,
            analyzer,
            policy,
            top_k,
            use_augmentation,
        }
    }

    pub fn from_config(
        config: &Config,
        index: SharedIndex,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        Ok(Self::new(
            build_retriever(config, index, embedder),
            QueryAnalyzer::with_overrides(&config.analysis.category_documents),
            build_policy(&config.confidence)?,
            config.retrieval.top_k,
            config.retrieval.use_augmentation,
        ))
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub async fn process(
        &self,
        ticket_id: &str,
        question: &str,
    ) -> Result<TicketOutcome, RetrievalError> {
        let started = Instant::now();
        let mut outcome = TicketOutcome {
            ticket_id: ticket_id.to_string(),
            trace_id: short_id(),
            question: question.to_string(),
            received_at: chrono::Utc::now().to_rfc3339(),
            status: TicketStatus::Rejected,
            triage: triage(question),
            query: None,
            retrieval: None,
            decision: None,
            escalation: None,
            timings: StageTimings::default(),
        };
        outcome.timings.triage_ms = elapsed_ms(started);

        if !outcome.triage.coherent {
            return Ok(self.finish(outcome, started));
        }
        if let Some(priority) = outcome.triage.escalation_priority() {
            outcome.status = TicketStatus::Escalated;
            outcome.escalation = Some(Escalation {
                priority,
                reason: outcome.triage.reason(),
            });
            return Ok(self.finish(outcome, started));
        }

        let stage = Instant::now();
        let query = self.analyzer.analyze(question);
        outcome.timings.analysis_ms = elapsed_ms(stage);

        let stage = Instant::now();
        let result = self
            .retriever
            .retrieve(&query, self.top_k, self.use_augmentation)
            .await?;
        outcome.timings.retrieval_ms = elapsed_ms(stage);

        let stage = Instant::now();
        let decision = self
            .policy
            .decide(&ConfidenceInput::from_result(&result, &query.category))
            .await;
        outcome.timings.confidence_ms = elapsed_ms(stage);

        if decision.is_accept() {
            outcome.status = TicketStatus::Answerable;
        } else {
            outcome.status = TicketStatus::Escalated;
            outcome.escalation = Some(Escalation {
                priority: decision.priority.unwrap_or(Priority::Medium),
                reason: decision.reason.clone(),
            });
        }
        outcome.query = Some(query);
        outcome.retrieval = Some(result);
        outcome.decision = Some(decision);
        Ok(self.finish(outcome, started))
    }

    fn finish(&self, mut outcome: TicketOutcome, started: Instant) -> TicketOutcome {
        outcome.timings.total_ms = elapsed_ms(started);
        info!(
            ticket_id = %outcome.ticket_id,
            trace_id = %outcome.trace_id,
            status = outcome.status.as_str(),
            total_ms = outcome.timings.total_ms,
            "ticket processed"
        );
        outcome
    }
}

/// Retriever wired with the configured augmentation and rerank options.
pub fn build_retriever(
    config: &Config,
    index: SharedIndex,
    embedder: Arc<dyn Embedder>,
) -> Retriever {
    Retriever::new(index, embedder)
        .with_augmenter(QueryAugmenter::with_overrides(
            &config.augmentation.category_terms,
            config.augmentation.max_keywords,
        ))
        .with_options(config.retrieval.options())
}

#[cfg(test)]
mod tests {
    use super::*;
    use helpdesk_harness_core::embedding::HashingEmbedder;
    use helpdesk_harness_core::models::{Chunk, ChunkingParams};
    use std::path::Path;

    async fn pipeline() -> TicketPipeline {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let index = SharedIndex::new();
        let chunks = vec![
            Chunk::new("guide_securite", 0, "Enable two factor authentication from security settings"),
            Chunk::new("guide_securite", 1, "Scan the QR code with an authenticator app"),
            Chunk::new("faq", 0, "Invoices are available in the billing page"),
        ];
        index
            .rebuild(embedder.as_ref(), chunks, ChunkingParams::default(), 8)
            .await
            .unwrap();
        let config = Config::minimal(Path::new("/tmp/hdx-test"));
        TicketPipeline::from_config(&config, index, embedder).unwrap()
    }

    #[tokio::test]
    async fn test_incoherent_ticket_rejected() {
        let outcome = pipeline().await.process("T-1", "?!?! 42").await.unwrap();
        assert_eq!(outcome.status, TicketStatus::Rejected);
        assert!(outcome.retrieval.is_none());
    }

    #[tokio::test]
    async fn test_sensitive_ticket_escalated_before_retrieval() {
        let outcome = pipeline()
            .await
            .process("T-2", "Help, my password is hunter22")
            .await
            .unwrap();
        assert_eq!(outcome.status, TicketStatus::Escalated);
        assert!(outcome.retrieval.is_none());
        assert_eq!(
            outcome.escalation.unwrap().priority,
            Priority::Critical
        );
    }

    #[tokio::test]
    async fn test_question_runs_full_pipeline() {
        let outcome = pipeline()
            .await
            .process("T-3", "How to enable two-factor authentication?")
            .await
            .unwrap();
        let query = outcome.query.as_ref().unwrap();
        assert_eq!(query.category, "security");
        let retrieval = outcome.retrieval.as_ref().unwrap();
        assert!(retrieval.sources.contains("guide_securite"));
        let decision = outcome.decision.as_ref().unwrap();
        match outcome.status {
            TicketStatus::Answerable => assert!(decision.is_accept()),
            TicketStatus::Escalated => assert!(outcome.escalation.is_some()),
            TicketStatus::Rejected => panic!("coherent ticket rejected"),
        }
        assert_eq!(outcome.trace_id.len(), 8);
        assert!(outcome.timings.total_ms >= outcome.timings.retrieval_ms);
    }

    #[test]
    fn test_ticket_id_shape() {
        let id = new_ticket_id();
        assert!(id.starts_with("TKT-"));
        assert_eq!(id.len(), 12);
    }
}
