//! Database error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Paper {paper_id} cannot move from {from} to {to}")]
    StatusRegression { paper_id: i64, from: String, to: String },

    #[error("Pipeline run {0} is already closed")]
    RunClosed(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}
