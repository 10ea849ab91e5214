//! On-disk index artifacts.
//!
//! An index directory holds exactly two files that are written and read as
//! a pair:
//!
//! | File | Content |
//! |------|---------|
//! | `vectors.bin` | magic `HDXV`, `u32` format version, `u32` dims, `u32` count, then `count × dims` little-endian `f32` |
//! | `metadata.json` | model, dims, chunking parameters, build time, SHA-256 of `vectors.bin`, and every chunk in insertion order |
//!
//! Each file is written to a `.tmp` sibling and renamed into place, vectors
//! first and metadata last. The recorded checksum ties the pair together,
//! so a save interrupted between the two renames is detected on load.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use helpdesk_harness_core::embedding::{blob_to_vec, vec_to_blob};
use helpdesk_harness_core::error::IndexError;
use helpdesk_harness_core::index::EmbeddingIndex;
use helpdesk_harness_core::models::{Chunk, ChunkingParams};

pub const VECTORS_FILE: &str = "vectors.bin";
pub const METADATA_FILE: &str = "metadata.json";
pub const FORMAT_VERSION: u32 = 1;
const MAGIC: &[u8; 4] = b"HDXV";
const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub format_version: u32,
    pub model: String,
    pub dims: usize,
    pub chunking: ChunkingParams,
    pub built_at: String,
    pub vectors_sha256: String,
    pub chunks: Vec<Chunk>,
}

fn vectors_path(dir: &Path) -> PathBuf {
    dir.join(VECTORS_FILE)
}

fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE)
}

fn encode_vectors(index: &EmbeddingIndex) -> Vec<u8> {
    let data = index.structure().as_slice();
    let mut out = Vec::with_capacity(HEADER_LEN + data.len() * 4);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(index.dims() as u32).to_le_bytes());
    out.extend_from_slice(&(index.len() as u32).to_le_bytes());
    out.extend_from_slice(&vec_to_blob(data));
    out
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

/// Parse `vectors.bin`, returning `(dims, count, data)`.
fn decode_vectors(bytes: &[u8]) -> Result<(usize, usize, Vec<f32>), IndexError> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(IndexError::corrupt("vectors.bin has no HDXV header"));
    }
    let version = read_u32(bytes, 4);
    if version != FORMAT_VERSION {
        return Err(IndexError::corrupt(format!(
            "vectors.bin format version {} is not supported (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let dims = read_u32(bytes, 8) as usize;
    let count = read_u32(bytes, 12) as usize;
    let payload = &bytes[HEADER_LEN..];
    let expected = dims
        .checked_mul(count)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| IndexError::corrupt("vectors.bin header overflows"))?;
    if payload.len() != expected {
        return Err(IndexError::corrupt(format!(
            "vectors.bin holds {} payload bytes, header promises {}",
            payload.len(),
            expected
        )));
    }
    Ok((dims, count, blob_to_vec(payload)))
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// Persist `index` into `dir`, replacing any previous artifacts.
pub fn save_index(dir: &Path, index: &EmbeddingIndex) -> Result<IndexMetadata> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create index directory: {}", dir.display()))?;

    let blob = encode_vectors(index);
    let metadata = IndexMetadata {
        format_version: FORMAT_VERSION,
        model: index.model().to_string(),
        dims: index.dims(),
        chunking: index.params(),
        built_at: Utc::now().to_rfc3339(),
        vectors_sha256: sha256_hex(&blob),
        chunks: index.chunks().to_vec(),
    };
    let json = serde_json::to_vec_pretty(&metadata)?;

    write_atomic(&vectors_path(dir), &blob)?;
    write_atomic(&metadata_path(dir), &json)?;

    info!(
        dir = %dir.display(),
        chunks = metadata.chunks.len(),
        dims = metadata.dims,
        "index saved"
    );
    Ok(metadata)
}

fn read_metadata(dir: &Path) -> Result<IndexMetadata, IndexError> {
    let path = metadata_path(dir);
    let bytes = std::fs::read(&path)
        .map_err(|e| IndexError::corrupt(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| IndexError::corrupt(format!("metadata.json is malformed: {}", e)))
}

/// Load both artifacts from `dir` and reassemble the index.
///
/// Every failure is an [`IndexError::Corrupt`]; the caller should rebuild.
pub fn load_index(dir: &Path) -> Result<EmbeddingIndex, IndexError> {
    let metadata = read_metadata(dir)?;
    if metadata.format_version != FORMAT_VERSION {
        return Err(IndexError::corrupt(format!(
            "metadata.json format version {} is not supported",
            metadata.format_version
        )));
    }

    let path = vectors_path(dir);
    let blob = std::fs::read(&path)
        .map_err(|e| IndexError::corrupt(format!("cannot read {}: {}", path.display(), e)))?;
    if sha256_hex(&blob) != metadata.vectors_sha256 {
        return Err(IndexError::corrupt(
            "vectors.bin checksum does not match metadata.json",
        ));
    }

    let (dims, count, data) = decode_vectors(&blob)?;
    if dims != metadata.dims {
        return Err(IndexError::corrupt(format!(
            "vectors.bin has {} dims, metadata.json says {}",
            dims, metadata.dims
        )));
    }
    if count != metadata.chunks.len() {
        return Err(IndexError::corrupt(format!(
            "vectors.bin holds {} vectors, metadata.json lists {} chunks",
            count,
            metadata.chunks.len()
        )));
    }

    let index =
        EmbeddingIndex::from_parts(metadata.model, metadata.chunking, metadata.chunks, dims, data)?;
    info!(dir = %dir.display(), chunks = index.len(), "index loaded");
    Ok(index)
}

/// Summary of the artifacts in an index directory.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub present: bool,
    pub chunk_count: usize,
    pub dims: usize,
    pub model: Option<String>,
    pub chunking: Option<ChunkingParams>,
    pub built_at: Option<String>,
    /// Chunk count per source.
    pub sources: BTreeMap<String, usize>,
    /// False when the artifacts are missing, unreadable, or were built with
    /// a different model or chunking parameters than configured.
    pub compatible: bool,
    pub problems: Vec<String>,
}

/// Inspect `dir` against the configured chunking parameters and model.
pub fn index_status(dir: &Path, params: ChunkingParams, model: &str) -> IndexStatus {
    let mut status = IndexStatus {
        present: false,
        chunk_count: 0,
        dims: 0,
        model: None,
        chunking: None,
        built_at: None,
        sources: BTreeMap::new(),
        compatible: false,
        problems: Vec::new(),
    };

    if !metadata_path(dir).exists() && !vectors_path(dir).exists() {
        status.problems.push("no index has been built".to_string());
        return status;
    }
    status.present = true;

    let metadata = match read_metadata(dir) {
        Ok(m) => m,
        Err(e) => {
            status.problems.push(e.to_string());
            return status;
        }
    };

    status.chunk_count = metadata.chunks.len();
    status.dims = metadata.dims;
    for chunk in &metadata.chunks {
        *status.sources.entry(chunk.source.clone()).or_insert(0) += 1;
    }

    if metadata.chunking != params {
        status.problems.push(format!(
            "built with max_tokens={} overlap_sentences={}, configured max_tokens={} overlap_sentences={}",
            metadata.chunking.max_tokens,
            metadata.chunking.overlap_sentences,
            params.max_tokens,
            params.overlap_sentences
        ));
    }
    if metadata.model != model {
        status.problems.push(format!(
            "built with model '{}', configured model is '{}'",
            metadata.model, model
        ));
    }
    if !vectors_path(dir).exists() {
        status.problems.push("vectors.bin is missing".to_string());
    }

    status.compatible = status.problems.is_empty();
    status.model = Some(metadata.model);
    status.chunking = Some(metadata.chunking);
    status.built_at = Some(metadata.built_at);
    status
}
