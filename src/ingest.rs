//! Document ingestion: scan the documents root, extract text, chunk, and
//! build the embedding index.
//!
//! Each file becomes one source, identified by its file stem
//! (`guides/guide_securite.pdf` → `guide_securite`). Files are processed in
//! path order so repeated builds over the same tree produce the same index.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use helpdesk_harness_core::chunk::chunk_document;
use helpdesk_harness_core::embedding::Embedder;
use helpdesk_harness_core::index::EmbeddingIndex;
use helpdesk_harness_core::models::{Chunk, ChunkingParams};

use crate::config::{Config, DocumentsConfig};
use crate::extract::extract_file;

/// A document ready for chunking.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub source: String,
    pub path: PathBuf,
    /// Extracted text with whitespace runs collapsed to single spaces.
    pub text: String,
}

/// Walk `root` and return every included file, sorted by relative path.
pub fn scan_documents(root: &Path, docs: &DocumentsConfig) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("Documents root does not exist: {}", root.display());
    }

    let include_set = build_globset(&docs.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string()];
    excludes.extend(docs.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push((rel_str, path.to_path_buf()));
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files.into_iter().map(|(_, p)| p).collect())
}

/// Collapse every whitespace run to a single space.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract every file under `root`. Unreadable files are logged and
/// skipped; two files with the same stem are an error.
pub fn load_documents(root: &Path, docs: &DocumentsConfig) -> Result<Vec<SourceDocument>> {
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut out = Vec::new();

    for path in scan_documents(root, docs)? {
        let source = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if source.is_empty() {
            continue;
        }
        if let Some(previous) = seen.get(&source) {
            bail!(
                "Duplicate document identifier '{}': {} and {}",
                source,
                previous.display(),
                path.display()
            );
        }

        let text = match extract_file(&path) {
            Ok(text) => normalize_whitespace(&text),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping document");
                continue;
            }
        };
        if text.is_empty() {
            debug!(path = %path.display(), "document has no text");
        }

        seen.insert(source.clone(), path.clone());
        out.push(SourceDocument { source, path, text });
    }

    Ok(out)
}

/// Chunk every document in order.
pub fn chunk_corpus(documents: &[SourceDocument], params: ChunkingParams) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for doc in documents {
        let doc_chunks = chunk_document(&doc.source, &doc.text, params);
        debug!(source = %doc.source, chunks = doc_chunks.len(), "chunked document");
        chunks.extend(doc_chunks);
    }
    chunks
}

/// Summary printed by `hdx index build`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BuildReport {
    pub documents: usize,
    pub chunks: usize,
    pub dims: usize,
    pub model: String,
}

/// Ingest the documents root and build a fresh index (not yet saved).
pub async fn build_index(
    config: &Config,
    embedder: &dyn Embedder,
    root_override: Option<&Path>,
) -> Result<(EmbeddingIndex, BuildReport)> {
    let root = root_override
        .map(Path::to_path_buf)
        .or_else(|| config.documents.root.clone())
        .context("No documents root: set [documents].root or pass --docs")?;

    let documents = load_documents(&root, &config.documents)?;
    let params = config.chunking.params();
    let chunks = chunk_corpus(&documents, params);
    info!(
        root = %root.display(),
        documents = documents.len(),
        chunks = chunks.len(),
        "corpus chunked"
    );

    let index = EmbeddingIndex::build(embedder, chunks, params, config.embedding.batch_size)
        .await
        .with_context(|| format!("Failed to build index from {}", root.display()))?;

    let report = BuildReport {
        documents: documents.len(),
        chunks: index.len(),
        dims: index.dims(),
        model: index.model().to_string(),
    };
    Ok((index, report))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
