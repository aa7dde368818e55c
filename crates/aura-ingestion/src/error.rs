//! Ingestion error taxonomy.
//!
//! Abort-class errors stop the whole run; item-class errors are isolated to
//! one paper by the orchestrator and turned into a `failed` status.

use aura_common::Retryable;
use aura_db::DbError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::RunStage;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Paper source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Fetch failed for {external_id}: {reason}")]
    FetchFailed { external_id: String, reason: String },

    #[error("Text extraction failed: {reason}")]
    ExtractionFailed { reason: String },

    #[error("Inference backend unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("Inference failures {failures}/{attempted} exceed threshold {threshold}")]
    InferenceThresholdExceeded { failures: u32, attempted: u32, threshold: f64 },

    #[error("Invalid stage transition {from} -> {to}")]
    InvalidTransition { from: RunStage, to: RunStage },

    #[error("Storage error: {0}")]
    Db(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// How far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Stops the run; it is marked `failed`.
    Abort,
    /// Confined to one paper; the run continues.
    Item,
}

/// Error categories reported in run metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ScrapingError,
    ExtractionError,
    LlmError,
    DatabaseError,
    PipelineError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ScrapingError   => "SCRAPING_ERROR",
            ErrorCategory::ExtractionError => "EXTRACTION_ERROR",
            ErrorCategory::LlmError        => "LLM_ERROR",
            ErrorCategory::DatabaseError   => "DATABASE_ERROR",
            ErrorCategory::PipelineError   => "PIPELINE_ERROR",
        }
    }
}

impl IngestionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestionError::SourceUnavailable(_)
            | IngestionError::InferenceThresholdExceeded { .. }
            | IngestionError::InvalidTransition { .. }
            | IngestionError::Config(_) => ErrorClass::Abort,
            IngestionError::FetchFailed { .. }
            | IngestionError::ExtractionFailed { .. }
            | IngestionError::InferenceUnavailable(_)
            | IngestionError::Db(_)
            | IngestionError::Io(_) => ErrorClass::Item,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestionError::SourceUnavailable(_) | IngestionError::FetchFailed { .. } => ErrorCategory::ScrapingError,
            IngestionError::ExtractionFailed { .. } => ErrorCategory::ExtractionError,
            IngestionError::InferenceUnavailable(_) => ErrorCategory::LlmError,
            IngestionError::Db(_) => ErrorCategory::DatabaseError,
            IngestionError::InferenceThresholdExceeded { .. }
            | IngestionError::InvalidTransition { .. }
            | IngestionError::Io(_)
            | IngestionError::Config(_) => ErrorCategory::PipelineError,
        }
    }

    pub fn extraction(reason: impl Into<String>) -> Self {
        IngestionError::ExtractionFailed { reason: reason.into() }
    }
}

/// Outcome of one network attempt, classified for [`aura_common::RetryPolicy`].
#[derive(Debug, Error)]
pub(crate) enum AttemptError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl Retryable for AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Transient(_))
    }
}

impl AttemptError {
    /// Connection failures and timeouts are transient; anything else reqwest
    /// reports (bad URL, body decode) is not.
    pub(crate) fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
            AttemptError::Transient(e.to_string())
        } else {
            AttemptError::Permanent(e.to_string())
        }
    }

    /// 408, 429 and 5xx are retried; other non-success statuses are final.
    pub(crate) fn from_status(status: reqwest::StatusCode, url: &str) -> Self {
        let msg = format!("HTTP {status} from {url}");
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            AttemptError::Transient(msg)
        } else {
            AttemptError::Permanent(msg)
        }
    }
}
