use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The monitor's tick loop is already running.
    #[error("monitor already running")]
    AlreadyRunning,
}
