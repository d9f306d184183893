use docbus_store::MapperError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The record failed pre-store validation; never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The store driver reported a final failure.
    #[error("store driver error: {0}")]
    Store(String),

    /// Moving a record to or from document form failed.
    #[error("mapping error: {0}")]
    Mapping(#[from] MapperError),

    /// The engine's poll loop is already running.
    #[error("engine already running")]
    AlreadyRunning,
}
