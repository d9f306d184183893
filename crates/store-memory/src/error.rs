use docbus_store::StoreDriverError;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A document with the same `_id` already exists.
    #[error("duplicate _id: {0}")]
    Duplicate(String),

    /// No topology status is currently scripted.
    #[error("topology status unavailable")]
    TopologyUnavailable,
}

impl StoreDriverError for Error {}
