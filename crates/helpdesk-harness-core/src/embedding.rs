//! Embedding trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that every embedding backend implements,
//! helpers for L2 normalization and inner-product scoring, the
//! little-endian blob codec used by index persistence, and
//! [`HashingEmbedder`], a deterministic feature-hashing encoder that needs
//! no model download.
//!
//! Network and model-backed providers (OpenAI, Ollama, fastembed) live in
//! the `helpdesk-harness` app crate.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::EmbeddingError;

/// A sentence-embedding backend.
///
/// `encode` must be deterministic for a fixed model version and return one
/// vector of `dims()` floats per input text, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"all-minilm-l6-v2"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Encode a batch of texts.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Encode and L2-normalize a batch, validating count and dimensionality.
///
/// Any zero-norm output is rejected rather than passed on as a zero vector.
pub async fn encode_normalized<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let mut vectors = embedder.encode(texts).await?;
    if vectors.len() != texts.len() {
        return Err(EmbeddingError::Count {
            expected: texts.len(),
            got: vectors.len(),
        });
    }
    let dims = embedder.dims();
    for (position, v) in vectors.iter_mut().enumerate() {
        if v.len() != dims {
            return Err(EmbeddingError::Dimension {
                expected: dims,
                got: v.len(),
            });
        }
        if !l2_normalize(v) {
            return Err(EmbeddingError::Degenerate { position });
        }
    }
    Ok(vectors)
}

/// Encode and normalize a single text.
pub async fn encode_one<E: Embedder + ?Sized>(
    embedder: &E,
    text: &str,
) -> Result<Vec<f32>, EmbeddingError> {
    encode_normalized(embedder, &[text.to_string()])
        .await?
        .pop()
        .ok_or(EmbeddingError::Count {
            expected: 1,
            got: 0,
        })
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length in place. Returns `false` (leaving `v`
/// untouched) when its norm is zero or not finite.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if !norm.is_finite() || norm < f32::EPSILON {
        return false;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    true
}

/// Inner product. Equals cosine similarity when both inputs are unit length.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity for vectors of arbitrary length.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let denom = l2_norm(a) * l2_norm(b);
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot(a, b) / denom
}

/// Encode floats as little-endian bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian bytes written by [`vec_to_blob`]. Trailing bytes
/// that do not form a whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Weight of the constant component that keeps every vector non-zero.
const HASHING_BIAS: f32 = 0.1;

/// Deterministic feature-hashing bag-of-words encoder.
///
/// Each lowercase alphanumeric token is hashed with SHA-256 into one of
/// `dims - 1` buckets; bucket 0 carries a small constant bias so empty or
/// punctuation-only text still encodes to a valid direction. Lexical rather
/// than semantic, but stable across platforms and releases.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
    model: String,
}

impl HashingEmbedder {
    /// `dims` is clamped to at least 2 (bias bucket + one token bucket).
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(2);
        Self {
            dims,
            model: format!("hashed-bow-{}", dims),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        v[0] = HASHING_BIAS;
        let buckets = (self.dims - 1) as u64;
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let bucket = 1 + (u64::from_le_bytes(head) % buckets) as usize;
            v[bucket] += 1.0;
        }
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }
}

/// Lowercase alphanumeric tokens of at least two characters.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder {
        dims: usize,
        out: Vec<Vec<f32>>,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn encode(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(self.out.clone())
        }
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        assert!(l2_normalize(&mut v));
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_rejected() {
        let mut v = vec![0.0, 0.0];
        assert!(!l2_normalize(&mut v));
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_hashing_deterministic_and_lexical() {
        let e = HashingEmbedder::new(256);
        let a = e.embed_text("Enable two-factor authentication");
        let b = e.embed_text("enable TWO factor Authentication!");
        assert_eq!(a, b);
        let c = e.embed_text("billing invoice refund");
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[test]
    fn test_hashing_empty_text_non_zero() {
        let e = HashingEmbedder::new(16);
        let v = e.embed_text("?!");
        assert!(l2_norm(&v) > 0.0);
    }

    #[tokio::test]
    async fn test_encode_normalized_unit_vectors() {
        let e = HashingEmbedder::new(64);
        let out = encode_normalized(&e, &["hello world".to_string(), "".to_string()])
            .await
            .unwrap();
        for v in &out {
            assert!((l2_norm(v) - 1.0).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_encode_normalized_rejects_wrong_dims() {
        let e = FixedEmbedder {
            dims: 3,
            out: vec![vec![1.0, 0.0]],
        };
        let err = encode_normalized(&e, &["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Dimension { expected: 3, got: 2 }));
    }

    #[tokio::test]
    async fn test_encode_normalized_rejects_wrong_count() {
        let e = FixedEmbedder {
            dims: 2,
            out: vec![],
        };
        let err = encode_normalized(&e, &["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Count { expected: 1, got: 0 }));
    }

    #[tokio::test]
    async fn test_encode_normalized_rejects_zero_vector() {
        let e = FixedEmbedder {
            dims: 2,
            out: vec![vec![0.0, 0.0]],
        };
        let err = encode_normalized(&e, &["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Degenerate { position: 0 }));
    }
}
