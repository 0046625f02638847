//! Error types for deployment.

use thiserror::Error;

use airlift_remote::RemoteError;

pub type DeployResult<T> = Result<T, DeployError>;

/// Deployment failures. All are fatal for the instance being deployed and
/// only for that instance — the fan-out isolates them.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("job #{0} has no environment attached")]
    MissingEnvironment(usize),
}
