//! Plain-text extraction for supported document formats.
//!
//! Markdown and text files are read as UTF-8 (invalid sequences replaced);
//! PDFs go through `pdf-extract`. Extraction never panics: failures come
//! back as [`ExtractError`] and the caller skips the file.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
}

/// Document format, decided by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Pdf,
}

impl DocumentKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "md" | "markdown" | "txt" => Some(DocumentKind::Text),
            "pdf" => Some(DocumentKind::Pdf),
            _ => None,
        }
    }
}

/// Extract plain text from in-memory document bytes.
pub fn extract_text(bytes: &[u8], kind: DocumentKind) -> Result<String, ExtractError> {
    match kind {
        DocumentKind::Text => Ok(String::from_utf8_lossy(bytes).into_owned()),
        DocumentKind::Pdf => {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
        }
    }
}

/// Read and extract the file at `path`.
pub fn extract_file(path: &Path) -> Result<String, ExtractError> {
    let kind = DocumentKind::from_path(path)
        .ok_or_else(|| ExtractError::Unsupported(path.display().to_string()))?;
    let bytes = std::fs::read(path)?;
    extract_text(&bytes, kind)
}
