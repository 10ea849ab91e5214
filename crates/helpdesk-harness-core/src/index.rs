//! Embedding index: chunk metadata plus an exact inner-product
//! nearest-neighbor structure over L2-normalized vectors.
//!
//! Vector row `i` of the [`FlatIpIndex`] belongs to `chunks[i]`; the two
//! sequences are only ever extended together, so
//! `chunks.len() == structure.count()` holds for every constructed
//! [`EmbeddingIndex`].
//!
//! # Lifecycle
//!
//! An index is built once per corpus version ([`EmbeddingIndex::build`]) or
//! restored from persisted parts ([`EmbeddingIndex::from_parts`]) and is
//! immutable afterwards. [`SharedIndex`] is the service object handed to
//! request handlers: readers clone an `Arc` snapshot and search without
//! further locking, while a rebuild constructs a complete new index first
//! and swaps it in with a single pointer replacement. A failed build never
//! touches the installed index.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::embedding::{dot, encode_normalized, l2_norm, Embedder};
use crate::error::IndexError;
use crate::models::{Chunk, ChunkingParams};

/// Stored vectors must be unit length within this tolerance.
pub const NORM_TOLERANCE: f32 = 1e-3;

/// One nearest-neighbor hit: row position and inner-product score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    pub position: usize,
    pub score: f32,
}

/// Exact (brute-force) inner-product index over row-major vectors.
#[derive(Debug, Clone)]
pub struct FlatIpIndex {
    dims: usize,
    data: Vec<f32>,
}

impl FlatIpIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
        }
    }

    /// Rebuild from a row-major buffer. The buffer length must be a whole
    /// number of rows.
    pub fn from_raw(dims: usize, data: Vec<f32>) -> Result<Self, IndexError> {
        if dims == 0 {
            return Err(IndexError::corrupt("vector dimensionality is zero"));
        }
        if data.len() % dims != 0 {
            return Err(IndexError::corrupt(format!(
                "vector buffer of {} floats is not a multiple of dims {}",
                data.len(),
                dims
            )));
        }
        Ok(Self { dims, data })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn count(&self) -> usize {
        if self.dims == 0 {
            0
        } else {
            self.data.len() / self.dims
        }
    }

    pub fn add(&mut self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dims {
            return Err(IndexError::corrupt(format!(
                "vector of {} dims added to index of {} dims",
                vector.len(),
                self.dims
            )));
        }
        self.data.extend_from_slice(vector);
        Ok(())
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dims)?;
        self.data.get(start..start + self.dims)
    }

    /// Row-major view of every stored vector.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Up to `k` rows with the highest inner product, descending; ties
    /// resolve to the lower position.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 || query.len() != self.dims || self.data.is_empty() {
            if query.len() != self.dims {
                debug!(
                    query_dims = query.len(),
                    index_dims = self.dims,
                    "query dimensionality does not match index"
                );
            }
            return Vec::new();
        }

        let mut hits: Vec<SearchHit> = self
            .data
            .chunks_exact(self.dims)
            .enumerate()
            .map(|(position, row)| SearchHit {
                position,
                score: dot(query, row),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.position.cmp(&b.position))
        });
        hits.truncate(k);
        hits
    }
}

/// Chunks, their normalized vectors, and the search structure over them.
#[derive(Debug, Clone)]
pub struct EmbeddingIndex {
    model: String,
    params: ChunkingParams,
    chunks: Vec<Chunk>,
    structure: FlatIpIndex,
}

impl EmbeddingIndex {
    /// Encode every chunk, L2-normalize the vectors, and insert them in
    /// chunk order.
    ///
    /// # Errors
    ///
    /// - [`IndexError::EmptyCorpus`] if `chunks` is empty.
    /// - [`IndexError::Embedding`] if the embedder fails or returns vectors
    ///   of the wrong count or dimensionality.
    pub async fn build<E: Embedder + ?Sized>(
        embedder: &E,
        chunks: Vec<Chunk>,
        params: ChunkingParams,
        batch_size: usize,
    ) -> Result<Self, IndexError> {
        if chunks.is_empty() {
            return Err(IndexError::EmptyCorpus);
        }

        let dims = embedder.dims();
        let mut structure = FlatIpIndex::new(dims);
        let batch_size = batch_size.max(1);

        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = encode_normalized(embedder, &texts).await?;
            for v in &vectors {
                structure.add(v)?;
            }
            debug!(batch = batch_no, size = batch.len(), "encoded chunk batch");
        }

        let index = Self {
            model: embedder.model_name().to_string(),
            params,
            chunks,
            structure,
        };
        info!(
            chunks = index.len(),
            dims,
            model = %index.model,
            sources = index.sources().len(),
            "embedding index built"
        );
        Ok(index)
    }

    /// Reassemble an index from persisted parts.
    ///
    /// # Errors
    ///
    /// [`IndexError::Corrupt`] if the vector buffer is malformed, the chunk
    /// and vector counts disagree, or any stored vector is not unit length.
    pub fn from_parts(
        model: String,
        params: ChunkingParams,
        chunks: Vec<Chunk>,
        dims: usize,
        vectors: Vec<f32>,
    ) -> Result<Self, IndexError> {
        let structure = FlatIpIndex::from_raw(dims, vectors)?;
        if structure.count() != chunks.len() {
            return Err(IndexError::corrupt(format!(
                "metadata lists {} chunks but the vector store holds {}",
                chunks.len(),
                structure.count()
            )));
        }
        if chunks.is_empty() {
            return Err(IndexError::corrupt("index artifacts hold no chunks"));
        }
        for (position, row) in structure.as_slice().chunks_exact(dims).enumerate() {
            let norm = l2_norm(row);
            if (norm - 1.0).abs() > NORM_TOLERANCE {
                return Err(IndexError::corrupt(format!(
                    "vector {} has norm {:.4}, expected 1.0",
                    position, norm
                )));
            }
        }
        Ok(Self {
            model,
            params,
            chunks,
            structure,
        })
    }

    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        self.structure.search(query, k)
    }

    pub fn chunk(&self, position: usize) -> Option<&Chunk> {
        self.chunks.get(position)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        self.structure.vector(position)
    }

    pub fn structure(&self) -> &FlatIpIndex {
        &self.structure
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.structure.dims()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn params(&self) -> ChunkingParams {
        self.params
    }

    /// Distinct source identifiers, sorted.
    pub fn sources(&self) -> BTreeSet<&str> {
        self.chunks.iter().map(|c| c.source.as_str()).collect()
    }
}

/// Shared, swappable handle to the current [`EmbeddingIndex`].
///
/// Cloning the handle shares the same slot. Searches run against the
/// snapshot returned by [`current`](SharedIndex::current), so an install
/// never blocks or disturbs searches already in flight.
#[derive(Debug, Clone, Default)]
pub struct SharedIndex {
    slot: Arc<RwLock<Option<Arc<EmbeddingIndex>>>>,
}

impl SharedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_index(index: EmbeddingIndex) -> Self {
        let shared = Self::new();
        shared.install(index);
        shared
    }

    /// Snapshot of the installed index, if any.
    pub fn current(&self) -> Option<Arc<EmbeddingIndex>> {
        let guard = self.slot.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Like [`current`](SharedIndex::current), but an unset index is an error.
    pub fn require(&self) -> Result<Arc<EmbeddingIndex>, IndexError> {
        self.current().ok_or(IndexError::Unset)
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_some()
    }

    /// Atomically replace the installed index, returning the previous one.
    pub fn install(&self, index: EmbeddingIndex) -> Option<Arc<EmbeddingIndex>> {
        let next = Arc::new(index);
        let mut guard = self.slot.write().unwrap_or_else(|e| e.into_inner());
        guard.replace(next)
    }

    /// Build a fresh index and install it only if the build succeeds.
    pub async fn rebuild<E: Embedder + ?Sized>(
        &self,
        embedder: &E,
        chunks: Vec<Chunk>,
        params: ChunkingParams,
        batch_size: usize,
    ) -> Result<Arc<EmbeddingIndex>, IndexError> {
        let index = EmbeddingIndex::build(embedder, chunks, params, batch_size).await?;
        self.install(index);
        self.require()
    }

    /// Search the installed index; empty when nothing is installed.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        match self.current() {
            Some(index) => index.search(query, k),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn corpus() -> Vec<Chunk> {
        vec![
            Chunk::new("faq", 0, "How do I reset my password"),
            Chunk::new("faq", 1, "Billing happens monthly on the first"),
            Chunk::new("guide_securite", 0, "Enable two factor authentication in settings"),
            Chunk::new("guide_securite", 1, "Administrators can enforce two factor authentication"),
        ]
    }

    async fn built() -> EmbeddingIndex {
        EmbeddingIndex::build(&HashingEmbedder::new(128), corpus(), ChunkingParams::default(), 3)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_integrity() {
        let index = built().await;
        assert_eq!(index.len(), 4);
        assert_eq!(index.structure().count(), 4);
        assert_eq!(index.chunks().len(), index.structure().count());
        assert_eq!(index.dims(), 128);
        assert_eq!(index.model(), "hashed-bow-128");
    }

    #[tokio::test]
    async fn test_vectors_unit_norm() {
        let index = built().await;
        for i in 0..index.len() {
            let v = index.vector(i).unwrap();
            assert!((l2_norm(v) - 1.0).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_build_empty_corpus() {
        let err = EmbeddingIndex::build(
            &HashingEmbedder::new(16),
            Vec::new(),
            ChunkingParams::default(),
            8,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::EmptyCorpus));
    }

    #[tokio::test]
    async fn test_search_monotonic_and_bounded() {
        let index = built().await;
        let q = index.vector(2).unwrap().to_vec();
        let hits = index.search(&q, 10);
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].position, 2);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(index.search(&q, 2).len(), 2);
        assert!(index.search(&q, 0).is_empty());
    }

    #[test]
    fn test_search_wrong_dims_is_empty() {
        let mut flat = FlatIpIndex::new(2);
        flat.add(&[1.0, 0.0]).unwrap();
        assert!(flat.search(&[1.0, 0.0, 0.0], 3).is_empty());
    }

    #[test]
    fn test_from_parts_count_mismatch() {
        let chunks = vec![Chunk::new("faq", 0, "a"), Chunk::new("faq", 1, "b")];
        let err = EmbeddingIndex::from_parts(
            "m".into(),
            ChunkingParams::default(),
            chunks,
            2,
            vec![1.0, 0.0],
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }

    #[test]
    fn test_from_parts_rejects_unnormalized() {
        let chunks = vec![Chunk::new("faq", 0, "a")];
        let err = EmbeddingIndex::from_parts(
            "m".into(),
            ChunkingParams::default(),
            chunks,
            2,
            vec![3.0, 4.0],
        )
        .unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }

    #[test]
    fn test_from_raw_ragged_buffer() {
        assert!(FlatIpIndex::from_raw(3, vec![1.0, 0.0]).is_err());
        assert!(FlatIpIndex::from_raw(0, vec![]).is_err());
    }

    #[tokio::test]
    async fn test_shared_index_unset_search_empty() {
        let shared = SharedIndex::new();
        assert!(!shared.is_ready());
        assert!(shared.search(&[1.0, 0.0], 5).is_empty());
        assert!(matches!(shared.require(), Err(IndexError::Unset)));
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_previous() {
        let embedder = HashingEmbedder::new(128);
        let shared = SharedIndex::new();
        shared
            .rebuild(&embedder, corpus(), ChunkingParams::default(), 8)
            .await
            .unwrap();
        let before = shared.current().unwrap();

        let err = shared
            .rebuild(&embedder, Vec::new(), ChunkingParams::default(), 8)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::EmptyCorpus));

        let after = shared.current().unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.len(), 4);
    }

    #[tokio::test]
    async fn test_install_swaps_snapshot() {
        let shared = SharedIndex::with_index(built().await);
        let old = shared.current().unwrap();
        let replaced = shared.install(built().await).unwrap();
        assert!(Arc::ptr_eq(&old, &replaced));
        assert!(!Arc::ptr_eq(&old, &shared.current().unwrap()));
        assert_eq!(old.len(), 4);
    }
}
