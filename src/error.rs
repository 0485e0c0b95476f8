//! Error type for the non-critical pipeline collaborators.
//!
//! The classifier, rewriter, cache, and vector search all return
//! [`PipelineError`] instead of silently swallowing failures. The chat
//! orchestrator is the single place that maps these errors to their safe
//! defaults (classifier → needs retrieval, rewriter → original query,
//! cache → miss), which keeps every fallback an explicit, testable branch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model call failed: {0}")]
    Model(String),

    #[error("malformed model output: {0}")]
    MalformedOutput(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("vector index error: {0}")]
    Index(String),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Index(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Model(err.to_string())
    }
}
