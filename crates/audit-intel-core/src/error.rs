//! Error kinds shared by every stage of ingestion and retrieval.
//!
//! The variants map one-to-one onto the failure classes callers need to
//! tell apart: a bad document (do not retry), transient infrastructure
//! trouble (retry later), and caller mistakes.

use thiserror::Error;

/// Errors raised by the ingestion and retrieval core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The document could not be turned into text (unsupported or corrupt).
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The embedding backend is unreachable, timed out, or rate limited.
    #[error("embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// The embedding backend refused the input (e.g. malformed request).
    #[error("embedding request rejected: {0}")]
    EmbeddingRejected(String),

    /// The vector store is unreachable or timed out.
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// Two versions of the same logical document raced each other.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// A document or job id that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request itself is invalid (size limit, bad state transition, …).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The ingestion queue is full.
    #[error("ingestion queue is full ({0} jobs admitted)")]
    Overloaded(usize),

    /// The ingestion job was cancelled before it committed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The document catalog or upload store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::EmbeddingUnavailable(_) | Error::IndexUnavailable(_)
        )
    }
}

/// Convenience result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_errors_are_retryable() {
        assert!(Error::EmbeddingUnavailable("timeout".into()).is_retryable());
        assert!(Error::IndexUnavailable("refused".into()).is_retryable());
        assert!(!Error::Extraction("corrupt".into()).is_retryable());
        assert!(!Error::EmbeddingRejected("400".into()).is_retryable());
        assert!(!Error::NotFound("doc".into()).is_retryable());
        assert!(!Error::Cancelled("job".into()).is_retryable());
    }

    #[test]
    fn display_includes_detail() {
        let err = Error::Overloaded(64);
        assert_eq!(err.to_string(), "ingestion queue is full (64 jobs admitted)");
    }
}
