//! Error types for Airlift configuration and entity construction.

use thiserror::Error;

/// Result type alias for configuration-level operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Fatal configuration errors. None of these are retried — they abort the
/// whole run before any instance is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(
        "instance {rank}: sub-instance cpu count {cpus} is not accepted by type {instance_type} (valid: {valid:?})"
    )]
    CpuIncrement {
        rank: String,
        cpus: u32,
        instance_type: String,
        valid: Vec<u32>,
    },

    #[error("job #{rank}: configuration requires non-empty input_file and output_file")]
    MissingJobIo { rank: usize },

    #[error("job #{rank}: more than one environment is defined and the job has no env_name")]
    AmbiguousEnvironment { rank: usize },

    #[error("job #{rank}: no environment named {name:?}")]
    UnknownEnvironment { rank: usize, name: String },

    #[error("no environments defined but jobs are present")]
    NoEnvironments,
}
