//! Error taxonomy for the retrieval core.
//!
//! Retrieval never fails on "no matches"; an empty result is a value. The
//! errors below cover precondition violations and collaborator failures.

/// Failures of the embedding collaborator.
///
/// Always propagated: a silently substituted zero vector would corrupt
/// every similarity computed against it.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding backend unavailable: {0}")]
    Unavailable(String),

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },

    #[error("embedding count mismatch: sent {expected} texts, got {got} vectors")]
    Count { expected: usize, got: usize },

    #[error("embedding vector has zero norm (input #{position})")]
    Degenerate { position: usize },
}

/// Embedding index lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("cannot build an index from an empty corpus")]
    EmptyCorpus,

    #[error("index artifacts are corrupt or incomplete: {reason}")]
    Corrupt { reason: String },

    #[error("index has not been built or loaded")]
    Unset,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

impl IndexError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        IndexError::Corrupt {
            reason: reason.into(),
        }
    }
}

/// Malformed `QueryData` handed over by the classification collaborator.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryDataError {
    #[error("query reformulation must not be empty")]
    EmptyReformulation,

    #[error("keyword #{0} is blank")]
    BlankKeyword(usize),

    #[error("document allow-list entry #{0} is blank")]
    BlankDocument(usize),
}

/// Errors surfaced by [`crate::retrieve::Retriever::retrieve`].
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("invalid query data: {0}")]
    InvalidQuery(#[from] QueryDataError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Failure of a model-backed confidence policy.
///
/// Recovered locally by falling back to the rule gate; never user-visible.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("confidence policy backend failed: {0}")]
    Backend(String),

    #[error("confidence policy timed out")]
    Timeout,

    #[error("confidence policy returned unparseable output: {0}")]
    Parse(String),
}
