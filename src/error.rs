use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
///
/// Transport failures and HTTP error statuses are not represented here: they
/// are recorded as failed samples in the metrics engine and never interrupt
/// a run.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration failed validation; the run is never started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A virtual user was asked to stop before or during an iteration.
    /// Treated as graceful by callers.
    #[error("virtual user stopped")]
    Stopped,

    /// An executor's internal invariant broke; surfaced as the scenario's
    /// error while other scenarios continue.
    #[error("executor failure: {0}")]
    Executor(String),

    /// HTTP client construction failed.
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),
}

impl Error {
    /// True for the graceful termination variants.
    pub fn is_graceful(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Stopped)
    }
}
