//! Error types for snapshot persistence.

use thiserror::Error;

pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Snapshot failures. Load-side failures are downgraded to "no snapshot"
/// by callers; only save-side failures are worth surfacing.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("snapshot references unknown instance rank {0:?}")]
    UnknownInstance(String),
}
