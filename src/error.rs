use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the reasoning core.
///
/// Only `BackendUnavailable` on the reflective path is meant to reach the end
/// user as a request failure; the remaining conditions are either rejected at
/// a store boundary or recovered locally.
#[derive(Debug, Error)]
pub enum Error {
    #[error("backend unavailable: {0:#}")]
    BackendUnavailable(#[source] anyhow::Error),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk/vector count mismatch: {chunks} chunks, {vectors} vectors")]
    LengthMismatch { chunks: usize, vectors: usize },

    #[error("malformed assessment: {0}")]
    MalformedAssessment(String),

    #[error("no agent produced an answer ({failed} failed)")]
    NoAgentResponses { failed: usize },

    #[error("answer cites sources that were not retrieved: {}", .labels.join(", "))]
    UnknownCitation { labels: Vec<String> },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Error::BackendUnavailable(err.into())
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }
}
