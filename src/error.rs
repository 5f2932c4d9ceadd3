//! Error taxonomy for the query path.
//!
//! Component-local conditions (one unreadable document, one retryable
//! network error) are absorbed inside the component that sees them. Anything
//! that would otherwise produce a wrong or empty answer becomes a
//! [`RagError`] and reaches the chat orchestrator, which turns it into a
//! [`ChatError`] for the caller.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// The persisted index is missing or corrupt. Blocks retrieval only.
    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    /// The query would be embedded with a different model than the index.
    #[error("embedding model mismatch: index was built with '{index_model}' but the active model is '{active_model}'")]
    ModelMismatch {
        index_model: String,
        active_model: String,
    },

    /// The generation service is unreachable, exhausted its retries, or
    /// returned nothing.
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The query itself could not be embedded.
    #[error("query embedding failed: {0}")]
    Embedding(String),
}

impl RagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::IndexUnavailable(_) => ErrorKind::IndexUnavailable,
            RagError::ModelMismatch { .. } => ErrorKind::IndexUnavailable,
            RagError::GenerationUnavailable(_) => ErrorKind::GenerationUnavailable,
            RagError::BadRequest(_) => ErrorKind::BadRequest,
            RagError::Embedding(_) => ErrorKind::IndexUnavailable,
        }
    }
}

/// Classification exposed by the chat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    GenerationUnavailable,
    IndexUnavailable,
    BadRequest,
}

/// Structured failure returned to the caller of the chat endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message}")]
pub struct ChatError {
    pub kind: ErrorKind,
    /// Human-readable, safe to show to an end user.
    pub message: String,
}

impl From<&RagError> for ChatError {
    fn from(err: &RagError) -> Self {
        let message = match err {
            RagError::IndexUnavailable(_) => {
                "The knowledge base is not available right now. Please try again later.".to_string()
            }
            RagError::ModelMismatch { .. } => {
                "The knowledge base was built with a different embedding model and must be rebuilt."
                    .to_string()
            }
            RagError::GenerationUnavailable(_) => {
                "The answer service is unavailable right now. Please try again later.".to_string()
            }
            RagError::BadRequest(reason) => format!("Invalid request: {}", reason),
            RagError::Embedding(_) => {
                "The question could not be processed against the knowledge base.".to_string()
            }
        };
        ChatError {
            kind: err.kind(),
            message,
        }
    }
}

/// A non-fatal, per-document problem recorded during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for IngestionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_mismatch_names_both_models() {
        let err = RagError::ModelMismatch {
            index_model: "all-minilm-l6-v2".to_string(),
            active_model: "bge-small-en-v1.5".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("all-minilm-l6-v2"));
        assert!(text.contains("bge-small-en-v1.5"));
        assert_eq!(err.kind(), ErrorKind::IndexUnavailable);
    }

    #[test]
    fn test_chat_error_hides_internal_detail() {
        let err = RagError::GenerationUnavailable("HTTP 503 from upstream at 10.0.0.4".to_string());
        let chat: ChatError = (&err).into();
        assert_eq!(chat.kind, ErrorKind::GenerationUnavailable);
        assert!(!chat.message.contains("10.0.0.4"));
    }

    #[test]
    fn test_bad_request_keeps_reason() {
        let err = RagError::BadRequest("conversation is empty".to_string());
        let chat = ChatError::from(&err);
        assert_eq!(chat.kind, ErrorKind::BadRequest);
        assert!(chat.message.contains("conversation is empty"));
    }
}
