//! Errors shared by the worker's task model, configuration and record store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Task record query failed
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration file unreadable, unparsable or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// No analysis result row exists for the scan
    #[error("No analysis record for scan {0}")]
    RecordNotFound(i64),

    /// Queue payload or object name the worker cannot act on
    #[error("Malformed task: {0}")]
    MalformedTask(String),
}
