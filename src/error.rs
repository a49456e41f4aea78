//! Error types for the relational sink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Batch rejected: {0}")]
    Rejected(String),
}
