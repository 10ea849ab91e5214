//! End-to-end retrieval over a small three-document corpus using the
//! deterministic hashing embedder.

use std::sync::Arc;

use helpdesk_harness_core::chunk::chunk_document;
use helpdesk_harness_core::confidence::{decide, ConfidenceInput};
use helpdesk_harness_core::embedding::{Embedder, HashingEmbedder};
use helpdesk_harness_core::error::IndexError;
use helpdesk_harness_core::index::SharedIndex;
use helpdesk_harness_core::models::{ChunkingParams, QueryData, Verdict};
use helpdesk_harness_core::retrieve::Retriever;

const GUIDE_SECURITE: &str = "Open security settings to enable two-factor authentication today. \
Scan the QR code with your authenticator app now. \
Enter the six digit code to confirm two-factor setup. \
Administrators can require two-factor authentication for every member.";

const FAQ: &str = "Reset your password from the sign in page link. \
Invite teammates from the members page in settings. \
Export your projects as CSV from the project menu.";

const TARIFICATION: &str = "The starter plan is free for small teams forever. \
The pro plan costs twelve dollars per user monthly. \
Annual billing gives two months free on every plan.";

fn params() -> ChunkingParams {
    ChunkingParams {
        max_tokens: 10,
        overlap_sentences: 0,
    }
}

fn corpus() -> Vec<helpdesk_harness_core::models::Chunk> {
    let mut chunks = Vec::new();
    for (source, text) in [
        ("guide_securite", GUIDE_SECURITE),
        ("faq", FAQ),
        ("tarification", TARIFICATION),
    ] {
        chunks.extend(chunk_document(source, text, params()));
    }
    chunks
}

async fn build() -> (SharedIndex, Arc<dyn Embedder>) {
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let index = SharedIndex::new();
    index
        .rebuild(embedder.as_ref(), corpus(), params(), 4)
        .await
        .unwrap();
    (index, embedder)
}

#[test]
fn test_corpus_shape() {
    let chunks = corpus();
    assert_eq!(chunks.len(), 10);
    assert_eq!(chunks.iter().filter(|c| c.source == "guide_securite").count(), 4);
    assert!(chunks.iter().all(|c| c.token_count <= 10));
}

#[tokio::test]
async fn test_two_factor_query_restricted_to_security_guide() {
    let (index, embedder) = build().await;
    assert_eq!(index.current().unwrap().len(), 10);

    let retriever = Retriever::new(index, embedder);
    let query = QueryData {
        reformulation: "How to enable two-factor authentication".into(),
        keywords: vec!["two-factor".into(), "authentication".into()],
        category: "security".into(),
        documents: vec!["guide_securite".into()],
    };
    let result = retriever.retrieve(&query, 3, true).await.unwrap();

    assert_eq!(result.source_count(), 1);
    assert!(result.chunk_count <= 3);
    assert!((0.0..=1.0).contains(&result.mean_score));
    assert!(result.evidence.contains("guide_securite"));
    assert!(result.chunks.iter().all(|c| c.source == "guide_securite"));
}

#[tokio::test]
async fn test_retrieval_feeds_confidence_gate() {
    let (index, embedder) = build().await;
    let retriever = Retriever::new(index, embedder);
    let result = retriever
        .retrieve(&QueryData::new("pro plan price per user"), 3, false)
        .await
        .unwrap();
    assert_eq!(result.chunks[0].source, "tarification");

    let input = ConfidenceInput::from_result(&result, "billing");
    let decision = input.baseline();
    assert_eq!(
        decision,
        decide(result.mean_score, result.source_count(), result.chunk_count)
    );
    if decision.verdict == Verdict::Escalate {
        assert!(decision.priority.is_some());
    }
}

#[tokio::test]
async fn test_failed_rebuild_leaves_index_serving() {
    let (index, embedder) = build().await;
    let err = index
        .rebuild(embedder.as_ref(), Vec::new(), params(), 4)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::EmptyCorpus));

    let retriever = Retriever::new(index, embedder);
    let result = retriever
        .retrieve(&QueryData::new("reset password"), 2, true)
        .await
        .unwrap();
    assert_eq!(result.chunk_count, 2);
}
