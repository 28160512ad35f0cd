use uuid::Uuid;

use civicsignal_common::CivicSignalError;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Version conflict on cluster {id}: expected {expected}, found {found}")]
    VersionConflict { id: Uuid, expected: i64, found: i64 },

    /// Aggregates of a resolved cluster are frozen.
    #[error("Cluster {0} is resolved")]
    ClusterResolved(Uuid),

    /// A create re-check found a cluster that appeared after the candidate search.
    #[error("Candidate cluster {0} appeared before create committed")]
    CandidateAppeared(Uuid),

    #[error("Report {0} is already clustered")]
    ReportAlreadyClustered(Uuid),

    #[error("Report not found: {0}")]
    ReportNotFound(Uuid),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(Uuid),

    #[error("Invalid row: {0}")]
    InvalidRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Races the caller can recover from by re-reading and trying again.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. }
                | StoreError::ClusterResolved(_)
                | StoreError::CandidateAppeared(_)
        )
    }
}

impl From<StoreError> for CivicSignalError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict { .. }
            | StoreError::ClusterResolved(_)
            | StoreError::CandidateAppeared(_) => CivicSignalError::Conflict(e.to_string()),
            StoreError::ReportAlreadyClustered(_) => CivicSignalError::StaleState(e.to_string()),
            StoreError::ReportNotFound(_) | StoreError::ClusterNotFound(_) => {
                CivicSignalError::NotFound(e.to_string())
            }
            StoreError::InvalidRow(_) | StoreError::Database(_) => {
                CivicSignalError::StoreUnavailable(e.to_string())
            }
        }
    }
}
