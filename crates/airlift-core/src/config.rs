//! airlift.toml configuration parser.
//!
//! One file describes the whole run: the project, the instances to
//! provision, the environments to materialize on them and the jobs to
//! execute. Sections map one-to-one onto the entity model in
//! [`crate::entity`].

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigResult;

/// Top-level run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirliftConfig {
    /// Project name, folded into instance and environment names.
    pub project: Option<String>,
    /// Dev mode: names omit content-hash suffixes so artifacts are reused
    /// across edits.
    #[serde(default)]
    pub dev: bool,
    /// Job-to-instance assignment policy.
    #[serde(default)]
    pub job_assign: AssignPolicy,
    /// Echo deployment output to the log.
    #[serde(default)]
    pub print_deploy: bool,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

/// Assignment policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignPolicy {
    #[default]
    Random,
    MultiKnapsack,
}

/// One instance request. Expanded into one or more concrete instances
/// according to `number`, `cpus` and `explode` (see [`crate::expand`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Provider instance type (e.g. "c5.4xlarge").
    #[serde(rename = "type")]
    pub instance_type: String,
    pub region: Option<String>,
    /// Requested total cpu count, or a non-numeric marker meaning "use the
    /// provider's reported core count for the type".
    pub cpus: Option<CpuRequest>,
    /// Split the request into several physical instances when the cpu
    /// requirement exceeds one machine.
    pub explode: Option<bool>,
    /// Replica count, default 1.
    pub number: Option<u32>,
    /// Login user on the machine image.
    #[serde(default = "default_remote_user")]
    pub remote_user: String,
}

/// A cpu request is either a concrete count or a marker like "auto".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CpuRequest {
    Count(u32),
    Auto(String),
}

impl CpuRequest {
    /// The concrete count, if this request carries one.
    pub fn count(&self) -> Option<u32> {
        match self {
            CpuRequest::Count(n) => Some(*n),
            CpuRequest::Auto(_) => None,
        }
    }
}

fn default_remote_user() -> String {
    "ubuntu".to_string()
}

/// One runtime environment: package lists per package manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Explicit name. When absent a deterministic name is derived from the
    /// project and the content hash.
    pub name: Option<String>,
    /// Conda package specs.
    pub conda: Option<Vec<String>>,
    /// Pip package specs.
    pub pip: Option<Vec<String>>,
    /// Apt package names.
    pub apt: Option<Vec<String>>,
}

/// One job: a payload to upload and a command to run inside an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Name of the environment this job runs in. May be omitted when
    /// exactly one environment is defined.
    pub env_name: Option<String>,
    /// Script to upload and execute (first token is the local path,
    /// the rest are arguments).
    pub run_script: Option<String>,
    /// Literal command to execute instead of a script.
    pub run_command: Option<String>,
    /// Additional files to upload next to the job payload.
    pub upload_files: Option<Vec<String>>,
    /// Input file, read by the job. Required, non-empty.
    pub input_file: Option<String>,
    /// Output file, produced by the job. Required, non-empty.
    pub output_file: Option<String>,
    /// Cpu requirement used by the multi-knapsack assignment, default 1.
    pub cpus: Option<u32>,
}

impl AirliftConfig {
    /// Load and parse a configuration file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AirliftConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
