//! Error types for the remote seam.

use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors from the remote-shell transport.
///
/// Transient connection failures are retried inside executor
/// implementations; the errors surfaced here are fatal for the instance
/// whose worker hit them, and only for that instance.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no address known for instance {0}")]
    NoAddress(String),

    #[error("failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("connection to {host} lost: {reason}")]
    Disconnected { host: String, reason: String },

    #[error("command failed on {host}: {reason}")]
    Exec { host: String, reason: String },

    #[error("upload to {host} failed: {reason}")]
    Upload { host: String, reason: String },
}

/// Errors from the instance provider.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("instance {0} not found")]
    NotFound(String),

    #[error("failed to create instance {name}: {reason}")]
    Create { name: String, reason: String },

    #[error("provider call failed: {0}")]
    Provider(String),
}
