//! Error types for the engine.

use thiserror::Error;

use airlift_deploy::DeployError;
use airlift_placement::PlacementError;
use airlift_remote::{BackendError, RemoteError};

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine failures. Errors raised inside a fan-out worker are fatal for
/// that worker's instance only; errors raised while preparing a phase
/// (an unassigned job, an infeasible packing) abort the phase.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job #{0} has not been assigned to an instance")]
    UnassignedJob(usize),

    #[error("job #{0} has no environment attached")]
    MissingEnvironment(usize),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error("fan-out worker failed: {0}")]
    Worker(String),
}
