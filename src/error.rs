//! Error taxonomy for the ingestion and question-answering pipeline.
//!
//! Every failure the library can surface is a [`RagError`] variant. Callers
//! use [`RagError::class`] to tell "fix your input" apart from "retry later"
//! and "internal bug" without matching on individual variants.

use serde::Serialize;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("unsupported format for '{file}': {format}")]
    UnsupportedFormat { file: String, format: String },

    #[error("could not extract text from '{file}': {reason}")]
    Extraction { file: String, reason: String },

    #[error("authentication failed: {message}")]
    Authentication { message: String },

    #[error("rate limited by provider: {message}")]
    RateLimit { message: String },

    /// `retryable` is set for provider timeouts and 5xx responses.
    #[error("generation failed: {message}")]
    Generation { message: String, retryable: bool },

    #[error("embedding failed: {message}")]
    Embedding { message: String, retryable: bool },

    #[error("index mismatch: {message}")]
    IndexMismatch { message: String },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("no documents are indexed yet; upload documents first")]
    NotReady,

    #[error("none of the {} uploaded file(s) could be ingested", failures.len())]
    NoUsableDocuments { failures: Vec<FileFailure> },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`RagError`] for user-facing reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request or its input must change before retrying.
    InvalidInput,
    /// Transient provider-side condition; the same request may succeed later.
    Retryable,
    /// A broken invariant or environment problem.
    Internal,
}

impl RagError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RagError::UnsupportedFormat { .. }
            | RagError::Extraction { .. }
            | RagError::Authentication { .. }
            | RagError::InvalidParameter { .. }
            | RagError::NotReady
            | RagError::NoUsableDocuments { .. }
            | RagError::Config(_) => ErrorClass::InvalidInput,
            RagError::RateLimit { .. } => ErrorClass::Retryable,
            RagError::Generation { retryable, .. } | RagError::Embedding { retryable, .. } => {
                if *retryable {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Internal
                }
            }
            RagError::IndexMismatch { .. } | RagError::Storage(_) | RagError::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        RagError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn auth(message: impl Into<String>) -> Self {
        RagError::Authentication {
            message: message.into(),
        }
    }
}

/// A single file that could not be turned into segments.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub error: String,
    pub unsupported: bool,
}

impl FileFailure {
    pub fn from_error(file: &str, err: &RagError) -> Self {
        Self {
            file: file.to_string(),
            error: err.to_string(),
            unsupported: matches!(err, RagError::UnsupportedFormat { .. }),
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
