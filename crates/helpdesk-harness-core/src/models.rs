//! Core data types flowing through chunking, indexing, retrieval, and
//! confidence gating.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::QueryDataError;

/// Evidence text handed to response generation when nothing was retrieved.
pub const NO_EVIDENCE_PLACEHOLDER: &str = "No relevant context found.";

/// An immutable unit of retrievable document text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Document identifier (file stem of the source document).
    pub source: String,
    /// 0-based position within `source`.
    pub chunk_index: usize,
    pub text: String,
    /// Whitespace-token count of `text`.
    pub token_count: usize,
}

impl Chunk {
    pub fn new(source: impl Into<String>, chunk_index: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        let token_count = text.split_whitespace().count();
        Self {
            source: source.into(),
            chunk_index,
            text,
            token_count,
        }
    }
}

/// Parameters the chunker was run with. Persisted alongside the index so a
/// rebuild with different parameters is detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub max_tokens: usize,
    pub overlap_sentences: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            overlap_sentences: 2,
        }
    }
}

/// Query analysis handed over by the classification collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryData {
    /// Clean restatement of the customer's question.
    pub reformulation: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub category: String,
    /// Source allow-list. Empty means no restriction.
    #[serde(default)]
    pub documents: Vec<String>,
}

impl QueryData {
    pub fn new(reformulation: impl Into<String>) -> Self {
        Self {
            reformulation: reformulation.into(),
            ..Default::default()
        }
    }

    /// Reject malformed input at the collaborator boundary.
    pub fn validate(&self) -> Result<(), QueryDataError> {
        if self.reformulation.trim().is_empty() {
            return Err(QueryDataError::EmptyReformulation);
        }
        if let Some(i) = self.keywords.iter().position(|k| k.trim().is_empty()) {
            return Err(QueryDataError::BlankKeyword(i));
        }
        if let Some(i) = self.documents.iter().position(|d| d.trim().is_empty()) {
            return Err(QueryDataError::BlankDocument(i));
        }
        Ok(())
    }
}

/// One chunk surfaced by a retrieval call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub source: String,
    pub chunk_index: usize,
    /// Position of the chunk in the index (row of its vector).
    pub position: usize,
    pub text: String,
    /// Inner-product score against the query variant that surfaced it.
    pub score: f32,
    /// Score against the original reformulated query, set by rerank.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

impl RetrievalCandidate {
    pub fn final_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }
}

/// Ranked evidence returned by the retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Top-K candidates by final score, descending.
    pub chunks: Vec<RetrievalCandidate>,
    /// Labeled concatenation of the chunks, for prompting.
    pub evidence: String,
    pub sources: BTreeSet<String>,
    pub chunk_count: usize,
    /// Arithmetic mean of final scores; 0.0 when `chunks` is empty.
    pub mean_score: f64,
}

impl RetrievalResult {
    pub fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            evidence: NO_EVIDENCE_PLACEHOLDER.to_string(),
            sources: BTreeSet::new(),
            chunk_count: 0,
            mean_score: 0.0,
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Escalate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "accept",
            Verdict::Escalate => "escalate",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency of a human hand-off. The confidence gate only emits
/// `Low`/`Medium`/`High`; `Critical` is reserved for risk signals found
/// during triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accept/escalate decision derived from retrieval statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceDecision {
    pub verdict: Verdict,
    /// Clamped to `[0, 1]`.
    pub final_confidence: f64,
    /// Present if and only if `verdict == Escalate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    pub reason: String,
}

impl ConfidenceDecision {
    pub fn is_accept(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}
