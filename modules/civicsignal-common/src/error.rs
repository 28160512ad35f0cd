use thiserror::Error;

/// Failure taxonomy surfaced to callers of the clustering engine.
#[derive(Error, Debug)]
pub enum CivicSignalError {
    /// Malformed or missing input. Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A concurrent write won the race and internal retries ran out.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The store failed or timed out. Nothing was committed.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The report was already assigned to a cluster.
    #[error("Stale state: {0}")]
    StaleState(String),
}

impl CivicSignalError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CivicSignalError::Conflict(_) | CivicSignalError::StoreUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CivicSignalError>;
