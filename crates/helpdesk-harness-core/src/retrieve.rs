//! Multi-query retrieval with allow-list filtering, deduplication, and
//! rerank against the original question.
//!
//! # Algorithm
//!
//! 1. Build the candidate query set with [`QueryAugmenter`] (or just the
//!    reformulation when augmentation is off).
//! 2. Embed every variant once, search the index for
//!    `top_k * 2 * overfetch_factor` raw neighbors, and keep up to
//!    `top_k * 2` hits whose source is on the allow-list. If the allow-list
//!    is non-empty and nothing survives, fall back to the unfiltered top
//!    `top_k * 2`.
//! 3. Merge all hit lists, keeping the higher raw score per
//!    `(source, chunk_index)`.
//! 4. Rerank against the reformulation's vector and sort descending.
//! 5. Truncate to `top_k` and render the evidence text.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::augment::QueryAugmenter;
use crate::embedding::{dot, encode_normalized, Embedder};
use crate::error::{EmbeddingError, RetrievalError};
use crate::index::{EmbeddingIndex, SharedIndex};
use crate::models::{QueryData, RetrievalCandidate, RetrievalResult, NO_EVIDENCE_PLACEHOLDER};

const EVIDENCE_RULE_WIDTH: usize = 60;

/// How rerank scores are computed.
///
/// Reranking scores each surviving candidate against the reformulated query
/// alone. `Stored` takes the candidate's vector from the index instead of
/// re-encoding its text; for a deterministic embedder the stored vector is
/// exactly what re-encoding would produce, so both modes yield the same
/// scores and ranking. `Reembed` only differs when the embedder is not
/// deterministic or has changed since the index was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankMode {
    /// Reuse the normalized vectors already stored in the index.
    #[default]
    Stored,
    /// Re-encode every surviving chunk's text on each call.
    Reembed,
}

impl RerankMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RerankMode::Stored => "stored",
            RerankMode::Reembed => "reembed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrieverOptions {
    /// Raw hits fetched per kept hit, so allow-list filtering has enough
    /// to choose from.
    pub overfetch_factor: usize,
    pub rerank: RerankMode,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self {
            overfetch_factor: 3,
            rerank: RerankMode::Stored,
        }
    }
}

/// Retrieval service over a [`SharedIndex`].
///
/// Cheap to clone; every clone searches the same index slot, so a reload
/// through one handle is visible to all.
#[derive(Clone)]
pub struct Retriever {
    index: SharedIndex,
    embedder: Arc<dyn Embedder>,
    augmenter: QueryAugmenter,
    options: RetrieverOptions,
}

impl Retriever {
    pub fn new(index: SharedIndex, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            index,
            embedder,
            augmenter: QueryAugmenter::default(),
            options: RetrieverOptions::default(),
        }
    }

    pub fn with_augmenter(mut self, augmenter: QueryAugmenter) -> Self {
        self.augmenter = augmenter;
        self
    }

    pub fn with_options(mut self, options: RetrieverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Retrieve the `top_k` best chunks for `query`.
    ///
    /// No matches is not an error: the result is then empty, with the
    /// placeholder evidence text and a zero mean.
    ///
    /// # Errors
    ///
    /// - [`RetrievalError::InvalidQuery`] if `query` fails validation.
    /// - [`RetrievalError::Index`] if no index is installed.
    /// - [`RetrievalError::Embedding`] if the embedder fails or produces
    ///   vectors of a different dimensionality than the index.
    pub async fn retrieve(
        &self,
        query: &QueryData,
        top_k: usize,
        use_augmentation: bool,
    ) -> Result<RetrievalResult, RetrievalError> {
        query.validate()?;
        let index = self.index.require()?;

        if self.embedder.dims() != index.dims() {
            return Err(EmbeddingError::Dimension {
                expected: index.dims(),
                got: self.embedder.dims(),
            }
            .into());
        }
        if top_k == 0 {
            return Ok(RetrievalResult::empty());
        }

        let queries = if use_augmentation {
            self.augmenter.augment(query)
        } else {
            vec![query.reformulation.trim().to_string()]
        };
        let query_vectors = encode_normalized(self.embedder.as_ref(), &queries).await?;

        let allow: HashSet<&str> = query.documents.iter().map(|d| d.trim()).collect();
        let keep = top_k.saturating_mul(2);

        let mut merged = Vec::new();
        for (variant, vector) in queries.iter().zip(&query_vectors) {
            let hits = self.search_filtered(&index, vector, &allow, keep);
            debug!(query = %variant, hits = hits.len(), "searched query variant");
            merged.extend(hits);
        }

        let mut candidates = dedup(merged);

        // Element 0 is always the unaugmented reformulation.
        let original = query_vectors
            .first()
            .ok_or(EmbeddingError::Count {
                expected: queries.len(),
                got: 0,
            })?;
        self.rerank(&index, original, &mut candidates).await?;

        candidates.sort_by(compare_final);
        candidates.truncate(top_k);

        let result = assemble(candidates);
        info!(
            variants = queries.len(),
            chunks = result.chunk_count,
            sources = result.source_count(),
            mean_score = result.mean_score,
            "retrieval complete"
        );
        Ok(result)
    }

    fn search_filtered(
        &self,
        index: &EmbeddingIndex,
        vector: &[f32],
        allow: &HashSet<&str>,
        keep: usize,
    ) -> Vec<RetrievalCandidate> {
        let fetch = keep.saturating_mul(self.options.overfetch_factor.max(1));
        let raw = index.search(vector, fetch);

        let to_candidate = |position: usize, score: f32| {
            index.chunk(position).map(|chunk| RetrievalCandidate {
                source: chunk.source.clone(),
                chunk_index: chunk.chunk_index,
                position,
                text: chunk.text.clone(),
                score,
                rerank_score: None,
            })
        };

        let filtered: Vec<RetrievalCandidate> = raw
            .iter()
            .filter_map(|hit| to_candidate(hit.position, hit.score))
            .filter(|c| allow.is_empty() || allow.contains(c.source.as_str()))
            .take(keep)
            .collect();

        if filtered.is_empty() && !allow.is_empty() {
            debug!(
                allowed = allow.len(),
                "no hits in allowed documents; using unfiltered results"
            );
            return raw
                .iter()
                .take(keep)
                .filter_map(|hit| to_candidate(hit.position, hit.score))
                .collect();
        }
        filtered
    }

    async fn rerank(
        &self,
        index: &EmbeddingIndex,
        original: &[f32],
        candidates: &mut [RetrievalCandidate],
    ) -> Result<(), RetrievalError> {
        match self.options.rerank {
            RerankMode::Stored => {
                for c in candidates.iter_mut() {
                    c.rerank_score = index.vector(c.position).map(|v| dot(original, v));
                }
            }
            RerankMode::Reembed => {
                let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
                let vectors = encode_normalized(self.embedder.as_ref(), &texts).await?;
                for (c, v) in candidates.iter_mut().zip(&vectors) {
                    c.rerank_score = Some(dot(original, v));
                }
            }
        }
        Ok(())
    }
}

/// Collapse hits on the same `(source, chunk_index)`, keeping the one with
/// the higher raw score. Output is sorted by raw score, descending.
pub fn dedup(hits: Vec<RetrievalCandidate>) -> Vec<RetrievalCandidate> {
    let mut best: HashMap<(String, usize), RetrievalCandidate> = HashMap::new();
    for hit in hits {
        let key = (hit.source.clone(), hit.chunk_index);
        let better = best
            .get(&key)
            .map_or(true, |existing| hit.score > existing.score);
        if better {
            best.insert(key, hit);
        }
    }
    let mut out: Vec<RetrievalCandidate> = best.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.source.cmp(&b.source))
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    out
}

fn compare_final(a: &RetrievalCandidate, b: &RetrievalCandidate) -> Ordering {
    b.final_score()
        .total_cmp(&a.final_score())
        .then_with(|| a.source.cmp(&b.source))
        .then(a.chunk_index.cmp(&b.chunk_index))
}

/// Render ranked candidates as labeled evidence blocks.
pub fn render_evidence(chunks: &[RetrievalCandidate]) -> String {
    if chunks.is_empty() {
        return NO_EVIDENCE_PLACEHOLDER.to_string();
    }
    let rule = "=".repeat(EVIDENCE_RULE_WIDTH);
    let mut out = String::new();
    for (i, c) in chunks.iter().enumerate() {
        let _ = write!(
            out,
            "\n{rule}\n[Excerpt {}] Source: {}\nScore: {:.3}\n{rule}\n{}\n",
            i + 1,
            c.source,
            c.final_score(),
            c.text
        );
    }
    out
}

fn assemble(chunks: Vec<RetrievalCandidate>) -> RetrievalResult {
    if chunks.is_empty() {
        return RetrievalResult::empty();
    }
    let sources: BTreeSet<String> = chunks.iter().map(|c| c.source.clone()).collect();
    let mean_score =
        chunks.iter().map(|c| f64::from(c.final_score())).sum::<f64>() / chunks.len() as f64;
    RetrievalResult {
        evidence: render_evidence(&chunks),
        chunk_count: chunks.len(),
        sources,
        mean_score,
        chunks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::error::{IndexError, QueryDataError};
    use crate::models::{Chunk, ChunkingParams};

    fn candidate(source: &str, chunk_index: usize, score: f32) -> RetrievalCandidate {
        RetrievalCandidate {
            source: source.into(),
            chunk_index,
            position: chunk_index,
            text: format!("{source} chunk {chunk_index}"),
            score,
            rerank_score: None,
        }
    }

    fn corpus() -> Vec<Chunk> {
        vec![
            Chunk::new("faq", 0, "Reset your password from the login page"),
            Chunk::new("faq", 1, "Invoices are emailed every month"),
            Chunk::new("guide_securite", 0, "Enable two factor authentication in security settings"),
            Chunk::new("guide_securite", 1, "Administrators may require two factor authentication"),
            Chunk::new("tarification", 0, "The pro plan price is billed monthly"),
        ]
    }

    async fn retriever(options: RetrieverOptions) -> Retriever {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let index = SharedIndex::new();
        index
            .rebuild(embedder.as_ref(), corpus(), ChunkingParams::default(), 2)
            .await
            .unwrap();
        Retriever::new(index, embedder).with_options(options)
    }

    #[test]
    fn test_dedup_keeps_higher_score() {
        let merged = vec![
            candidate("faq", 3, 0.4),
            candidate("faq", 1, 0.5),
            candidate("faq", 3, 0.7),
        ];
        let out = dedup(merged);
        let hits: Vec<_> = out
            .iter()
            .filter(|c| c.source == "faq" && c.chunk_index == 3)
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 0.7);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_index, 3);
    }

    #[test]
    fn test_render_evidence_blocks() {
        let mut c = candidate("guide_securite", 0, 0.5);
        c.rerank_score = Some(0.8125);
        let text = render_evidence(&[c]);
        assert!(text.contains(&"=".repeat(60)));
        assert!(text.contains("[Excerpt 1] Source: guide_securite"));
        assert!(text.contains("Score: 0.812") || text.contains("Score: 0.813"));
        assert!(text.contains("guide_securite chunk 0"));
    }

    #[test]
    fn test_render_evidence_empty_placeholder() {
        assert_eq!(render_evidence(&[]), NO_EVIDENCE_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_retrieve_respects_allow_list() {
        let r = retriever(RetrieverOptions::default()).await;
        let mut q = QueryData::new("two factor authentication");
        q.documents = vec!["guide_securite".into()];
        let result = r.retrieve(&q, 3, true).await.unwrap();
        assert!(result.chunk_count <= 3);
        assert_eq!(result.source_count(), 1);
        assert!(result.sources.contains("guide_securite"));
    }

    #[tokio::test]
    async fn test_retrieve_allow_list_fallback() {
        let r = retriever(RetrieverOptions::default()).await;
        let mut q = QueryData::new("two factor authentication");
        q.documents = vec!["no_such_document".into()];
        let result = r.retrieve(&q, 2, false).await.unwrap();
        assert_eq!(result.chunk_count, 2);
        assert!(result.sources.contains("guide_securite"));
    }

    #[tokio::test]
    async fn test_retrieve_ranked_and_bounded() {
        let r = retriever(RetrieverOptions::default()).await;
        let q = QueryData::new("monthly price of the pro plan");
        let result = r.retrieve(&q, 3, true).await.unwrap();
        assert_eq!(result.chunk_count, 3);
        for pair in result.chunks.windows(2) {
            assert!(pair[0].final_score() >= pair[1].final_score());
        }
        assert!(result.chunks.iter().all(|c| c.rerank_score.is_some()));
        assert_eq!(result.chunks[0].source, "tarification");
        let mean = result.chunks.iter().map(|c| f64::from(c.final_score())).sum::<f64>() / 3.0;
        assert!((result.mean_score - mean).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rerank_modes_agree() {
        let q = QueryData::new("reset password login");
        let stored = retriever(RetrieverOptions::default())
            .await
            .retrieve(&q, 3, true)
            .await
            .unwrap();
        let reembed = retriever(RetrieverOptions {
            rerank: RerankMode::Reembed,
            ..RetrieverOptions::default()
        })
        .await
        .retrieve(&q, 3, true)
        .await
        .unwrap();
        assert_eq!(stored.chunk_count, reembed.chunk_count);
        for (a, b) in stored.chunks.iter().zip(&reembed.chunks) {
            assert_eq!((&a.source, a.chunk_index), (&b.source, b.chunk_index));
            assert!((a.final_score() - b.final_score()).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_retrieve_zero_top_k_is_empty() {
        let r = retriever(RetrieverOptions::default()).await;
        let result = r.retrieve(&QueryData::new("password"), 0, true).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(result.evidence, NO_EVIDENCE_PLACEHOLDER);
        assert_eq!(result.mean_score, 0.0);
    }

    #[tokio::test]
    async fn test_retrieve_unset_index() {
        let r = Retriever::new(SharedIndex::new(), Arc::new(HashingEmbedder::new(16)));
        let err = r.retrieve(&QueryData::new("hello"), 3, true).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Index(IndexError::Unset)));
    }

    #[tokio::test]
    async fn test_retrieve_rejects_invalid_query() {
        let r = retriever(RetrieverOptions::default()).await;
        let err = r.retrieve(&QueryData::new(" "), 3, true).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::InvalidQuery(QueryDataError::EmptyReformulation)
        ));
    }

    #[tokio::test]
    async fn test_retrieve_dimension_mismatch() {
        let r = retriever(RetrieverOptions::default()).await;
        let other = Retriever::new(r.index().clone(), Arc::new(HashingEmbedder::new(32)));
        let err = other.retrieve(&QueryData::new("hello"), 3, true).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::Embedding(EmbeddingError::Dimension { .. })
        ));
    }
}
