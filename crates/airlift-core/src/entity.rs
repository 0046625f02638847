//! Entity model: instances, environments, jobs and processes.
//!
//! Instances, environments and jobs are created once from configuration
//! and live for the whole run (or are restored from a snapshot). The
//! `Deployed*` types are short-lived read-only projections binding an
//! entity to one instance; they add computed remote paths and commands and
//! never duplicate mutable state — all mutation goes through the owning
//! entity.

use std::ops::BitOr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{EnvironmentConfig, JobConfig};
use crate::error::{ConfigError, ConfigResult};
use crate::hash;

/// Root for derived instance names.
pub const INSTANCE_NAME_ROOT: &str = "airlift-node";
/// Root for derived environment names.
pub const ENVIRONMENT_NAME_ROOT: &str = "airlift-env";
/// Remote working directory, relative to the login user's home.
pub const REMOTE_RUN_DIR: &str = "$HOME/run";
/// Marker file signalling "this artifact is fully uploaded".
pub const READY_MARKER: &str = "ready";

/// Index of an instance in the inventory.
pub type InstanceId = usize;
/// Index of an environment in the inventory.
pub type EnvId = usize;
/// Index of a job in the inventory.
pub type JobId = usize;

pub type SharedInstance = Arc<RwLock<Instance>>;
pub type SharedJob = Arc<RwLock<Job>>;
pub type SharedProcess = Arc<RwLock<Process>>;

// ── Instance ──────────────────────────────────────────────────────

/// Provider lifecycle state of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    #[default]
    Unknown,
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

/// A concrete instance specification, produced by the expander.
///
/// `rank` is `"group.subindex"`, unique within the expansion of one
/// instance request group. `cpus` of `None` means "provider default size".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_type: String,
    pub region: Option<String>,
    pub rank: String,
    pub cpus: Option<u32>,
    pub remote_user: String,
    pub project: Option<String>,
    pub dev: bool,
    /// Identity hash over (type, region, cpus); suffix of the name unless
    /// dev mode is on.
    pub hash: String,
}

impl InstanceSpec {
    /// Deterministic instance name:
    /// `airlift-node[-{project}]-{rank}[-{hash}]`, the hash suffix omitted
    /// in dev mode.
    pub fn name(&self) -> String {
        let mut name = INSTANCE_NAME_ROOT.to_string();
        if let Some(project) = &self.project {
            name.push('-');
            name.push_str(project);
        }
        name.push('-');
        name.push_str(&self.rank);
        if !self.dev {
            name.push('-');
            name.push_str(&self.hash);
        }
        name
    }
}

/// A provisioned (or to-be-provisioned) machine plus its attached work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub spec: InstanceSpec,
    pub name: String,
    /// Provider handle; `None` until the instance exists.
    pub provider_id: Option<String>,
    pub ip_addr: Option<String>,
    pub dns_addr: Option<String>,
    pub state: InstanceState,
    /// Set when provisioning failed permanently; the instance is skipped
    /// by later phases but never removed from the inventory.
    pub invalid: bool,
    /// Jobs assigned to this instance, in assignment order.
    pub jobs: Vec<JobId>,
    /// Names of environments required by the assigned jobs, first-seen
    /// order, deduplicated.
    pub env_names: Vec<String>,
}

impl Instance {
    pub fn new(spec: InstanceSpec) -> Self {
        let name = spec.name();
        Self {
            spec,
            name,
            provider_id: None,
            ip_addr: None,
            dns_addr: None,
            state: InstanceState::Unknown,
            invalid: false,
            jobs: Vec::new(),
            env_names: Vec::new(),
        }
    }

    /// Record a job assignment and the environment it pulls in.
    pub fn attach_job(&mut self, job: JobId, env_name: &str) {
        self.jobs.push(job);
        if !self.env_names.iter().any(|n| n == env_name) {
            self.env_names.push(env_name.to_string());
        }
    }

    /// Absolute home directory of the login user.
    pub fn home_dir(&self) -> String {
        format!("/home/{}", self.spec.remote_user)
    }

    /// Absolute remote working directory.
    pub fn run_dir(&self) -> String {
        format!("{}/run", self.home_dir())
    }

    /// Address used for the remote-shell connection: DNS when known,
    /// otherwise IP.
    pub fn connect_addr(&self) -> Option<&str> {
        self.dns_addr.as_deref().or(self.ip_addr.as_deref())
    }
}

// ── Environment ───────────────────────────────────────────────────

/// A named runtime environment (package sets), hashed over its normalized
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub config: EnvironmentConfig,
    pub project: Option<String>,
    pub dev: bool,
    pub hash: String,
    pub name: String,
}

impl Environment {
    pub fn new(project: Option<String>, dev: bool, config: EnvironmentConfig) -> Self {
        let hash = hash::environment_hash(&config);
        let name = match &config.name {
            Some(name) => name.clone(),
            None => {
                let mut name = ENVIRONMENT_NAME_ROOT.to_string();
                if let Some(project) = &project {
                    name.push('-');
                    name.push_str(project);
                }
                if !dev {
                    name.push('-');
                    name.push_str(&hash);
                }
                name
            }
        };
        Self {
            config,
            project,
            dev,
            hash,
            name,
        }
    }

    /// Remote path template, shell-expanded on the instance.
    pub fn path(&self) -> String {
        format!("{REMOTE_RUN_DIR}/{}", self.name)
    }

    /// Bind this environment to an instance.
    pub fn deploy<'a>(&'a self, instance: &'a Instance) -> DeployedEnvironment<'a> {
        DeployedEnvironment::new(self, instance)
    }
}

/// Read-only projection of an [`Environment`] bound to one [`Instance`].
///
/// Adds the absolute remote path (which depends on the instance's login
/// user). Created fresh per deploy call; it is a view, not a new entity.
#[derive(Debug, Clone, Copy)]
pub struct DeployedEnvironment<'a> {
    env: &'a Environment,
    instance: &'a Instance,
}

impl<'a> DeployedEnvironment<'a> {
    fn new(env: &'a Environment, instance: &'a Instance) -> Self {
        Self { env, instance }
    }

    pub fn name(&self) -> &str {
        &self.env.name
    }

    pub fn instance(&self) -> &Instance {
        self.instance
    }

    /// Shell-expanded remote path (`$HOME/run/{name}`).
    pub fn path(&self) -> String {
        self.env.path()
    }

    /// Absolute remote path (`/home/{user}/run/{name}`).
    pub fn path_abs(&self) -> String {
        format!("{}/{}", self.instance.run_dir(), self.env.name)
    }

    /// Rendered remote manifest: the normalized environment object with
    /// the derived name written back, serialized as JSON for the
    /// bootstrap tooling on the instance.
    pub fn manifest_json(&self) -> String {
        let manifest = serde_json::json!({
            "name": self.env.name,
            "conda": self.env.config.conda,
            "pip": self.env.config.pip,
            "apt": self.env.config.apt,
        });
        manifest.to_string()
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// A unit of work: payload files plus a command, bound to exactly one
/// environment and (after assignment) exactly one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub config: JobConfig,
    pub hash: String,
    /// Position in the configuration, stable across runs.
    pub rank: usize,
    pub env: Option<EnvId>,
    pub instance: Option<InstanceId>,
}

impl Job {
    /// Construct and validate a job. Missing or empty input/output file
    /// names are a fatal configuration error.
    pub fn new(config: JobConfig, rank: usize) -> ConfigResult<Self> {
        let io_ok = matches!(&config.input_file, Some(f) if !f.is_empty())
            && matches!(&config.output_file, Some(f) if !f.is_empty());
        if !io_ok {
            return Err(ConfigError::MissingJobIo { rank });
        }
        let hash = hash::job_hash(&config);
        Ok(Self {
            config,
            hash,
            rank,
            env: None,
            instance: None,
        })
    }

    pub fn attach_env(&mut self, env: EnvId) {
        self.env = Some(env);
    }

    pub fn input_file(&self) -> &str {
        self.config.input_file.as_deref().unwrap_or_default()
    }

    pub fn output_file(&self) -> &str {
        self.config.output_file.as_deref().unwrap_or_default()
    }

    /// All files uploaded alongside the job payload: declared upload files
    /// plus the input file.
    pub fn payload_files(&self) -> Vec<String> {
        let mut files = self.config.upload_files.clone().unwrap_or_default();
        if let Some(input) = &self.config.input_file {
            files.push(input.clone());
        }
        files
    }

    /// Bind this job to a deployed environment.
    pub fn deploy<'a>(&'a self, env: DeployedEnvironment<'a>) -> DeployedJob<'a> {
        DeployedJob::new(self, env)
    }
}

/// Read-only projection of a [`Job`] bound to one [`DeployedEnvironment`].
///
/// Adds the computed remote path and run command. Several projections may
/// exist per job (one per deploy invocation).
#[derive(Debug, Clone)]
pub struct DeployedJob<'a> {
    job: &'a Job,
    env: DeployedEnvironment<'a>,
    path: String,
    command: String,
}

impl<'a> DeployedJob<'a> {
    fn new(job: &'a Job, env: DeployedEnvironment<'a>) -> Self {
        let path = format!("{}/{}", env.path_abs(), job.hash);
        let command = job_command(&path, &job.config);
        Self {
            job,
            env,
            path,
            command,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn env(&self) -> &DeployedEnvironment<'a> {
        &self.env
    }

    pub fn hash(&self) -> &str {
        &self.job.hash
    }

    /// Absolute remote payload directory (`{env_abs}/{job_hash}`).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The command executed by the remote run wrapper.
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Compute the run command for a job payload deployed at `path`.
///
/// A `run_script` is rewritten so the script resolves inside the payload
/// directory; a `run_command` is taken verbatim.
fn job_command(path: &str, config: &JobConfig) -> String {
    if let Some(script) = &config.run_script {
        let mut parts = script.split_whitespace();
        let file = parts.next().unwrap_or_default();
        let name = basename(file);
        let mut command = format!("{path}/{name}");
        for arg in parts {
            command.push(' ');
            command.push_str(arg);
        }
        command
    } else {
        config.run_command.clone().unwrap_or_default()
    }
}

/// Final path component of a slash-separated path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Directory component of a slash-separated path, if any.
pub fn dirname(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some(("", _)) | None => None,
        Some((dir, _)) => Some(dir),
    }
}

// ── Process ───────────────────────────────────────────────────────

/// Lifecycle state of a launched job, as reported by the remote side.
///
/// States form a loose pipeline WAIT → QUEUE → IDLE → RUNNING →
/// {DONE | ABORTED}; transition legality is not enforced locally — the
/// remote report is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Unknown,
    Wait,
    Queue,
    Idle,
    Running,
    Done,
    Aborted,
}

impl RunState {
    /// Bit value used in [`StateMask`]s.
    pub const fn bit(self) -> u32 {
        match self {
            RunState::Unknown => 0,
            RunState::Wait => 1,
            RunState::Queue => 2,
            RunState::Idle => 4,
            RunState::Running => 8,
            RunState::Done => 16,
            RunState::Aborted => 32,
        }
    }

    /// Parse a remote state token, case-insensitively. The caller strips
    /// any trailing parenthetical before matching.
    pub fn parse(token: &str) -> Option<RunState> {
        match token.to_ascii_lowercase().as_str() {
            "unknown" => Some(RunState::Unknown),
            "wait" => Some(RunState::Wait),
            "queue" => Some(RunState::Queue),
            "idle" => Some(RunState::Idle),
            "running" => Some(RunState::Running),
            "done" => Some(RunState::Done),
            "aborted" => Some(RunState::Aborted),
            _ => None,
        }
    }
}

/// A combinable set of [`RunState`] bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMask(u32);

impl StateMask {
    pub const NONE: StateMask = StateMask(0);
    /// Every named state. UNKNOWN carries no bit and satisfies no mask.
    pub const ANY: StateMask = StateMask(1 | 2 | 4 | 8 | 16 | 32);
    /// Terminal states.
    pub const FINISHED: StateMask = StateMask(16 | 32);

    pub fn contains(self, state: RunState) -> bool {
        self.0 & state.bit() != 0
    }
}

impl From<RunState> for StateMask {
    fn from(state: RunState) -> Self {
        StateMask(state.bit())
    }
}

impl BitOr for StateMask {
    type Output = StateMask;
    fn bitor(self, rhs: StateMask) -> StateMask {
        StateMask(self.0 | rhs.0)
    }
}

impl BitOr<RunState> for StateMask {
    type Output = StateMask;
    fn bitor(self, rhs: RunState) -> StateMask {
        StateMask(self.0 | rhs.bit())
    }
}

impl BitOr for RunState {
    type Output = StateMask;
    fn bitor(self, rhs: RunState) -> StateMask {
        StateMask(self.bit() | rhs.bit())
    }
}

/// Handle to one launched job run on one instance.
///
/// Created by the run coordinator with `pid` unset (batched sequential
/// execution yields no pid synchronously); the reconciler fills it in.
/// The launch facts needed by the status protocol are denormalized here so
/// polling needs no entity lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Unique run id, generated per launch, never reused.
    pub uid: String,
    pub pid: Option<u32>,
    pub state: RunState,
    pub job: JobId,
    pub instance: InstanceId,
    pub env_name: String,
    pub job_hash: String,
    pub output_file: String,
}

impl Process {
    pub fn new(
        uid: String,
        job: JobId,
        instance: InstanceId,
        env_name: String,
        job_hash: String,
        output_file: String,
    ) -> Self {
        Self {
            uid,
            pid: None,
            state: RunState::Unknown,
            job,
            instance,
            env_name,
            job_hash,
            output_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentConfig;

    fn spec(rank: &str, cpus: Option<u32>, dev: bool) -> InstanceSpec {
        InstanceSpec {
            instance_type: "c5.large".to_string(),
            region: Some("eu-west-3".to_string()),
            rank: rank.to_string(),
            cpus,
            remote_user: "ubuntu".to_string(),
            project: Some("demo".to_string()),
            dev,
            hash: "abc123def456".to_string(),
        }
    }

    fn job_config() -> JobConfig {
        JobConfig {
            env_name: None,
            run_script: Some("scripts/train.py --epochs 3".to_string()),
            run_command: None,
            upload_files: Some(vec!["data/set.csv".to_string()]),
            input_file: Some("in.json".to_string()),
            output_file: Some("out.json".to_string()),
            cpus: None,
        }
    }

    #[test]
    fn instance_name_includes_project_rank_and_hash() {
        let name = spec("2.3", Some(16), false).name();
        assert_eq!(name, "airlift-node-demo-2.3-abc123def456");
    }

    #[test]
    fn dev_instance_name_omits_hash() {
        let name = spec("1.1", None, true).name();
        assert_eq!(name, "airlift-node-demo-1.1");
    }

    #[test]
    fn environment_name_derivation() {
        let env = Environment::new(
            Some("demo".to_string()),
            false,
            EnvironmentConfig {
                name: None,
                conda: None,
                pip: Some(vec!["requests".to_string()]),
                apt: None,
            },
        );
        assert!(env.name.starts_with("airlift-env-demo-"));
        assert!(env.name.ends_with(&env.hash));

        let dev_env = Environment::new(
            Some("demo".to_string()),
            true,
            EnvironmentConfig {
                name: None,
                conda: None,
                pip: Some(vec!["requests".to_string()]),
                apt: None,
            },
        );
        assert_eq!(dev_env.name, "airlift-env-demo");
    }

    #[test]
    fn explicit_environment_name_wins() {
        let env = Environment::new(
            None,
            false,
            EnvironmentConfig {
                name: Some("custom".to_string()),
                conda: None,
                pip: None,
                apt: None,
            },
        );
        assert_eq!(env.name, "custom");
        assert_eq!(env.path(), "$HOME/run/custom");
    }

    #[test]
    fn job_requires_input_and_output() {
        let mut config = job_config();
        config.output_file = None;
        assert!(matches!(
            Job::new(config, 0),
            Err(ConfigError::MissingJobIo { rank: 0 })
        ));

        let mut config = job_config();
        config.input_file = Some(String::new());
        assert!(Job::new(config, 1).is_err());
    }

    #[test]
    fn deployed_projection_paths() {
        let instance = Instance::new(spec("1.1", Some(4), false));
        let env = Environment::new(None, false, EnvironmentConfig {
            name: Some("e1".to_string()),
            conda: None,
            pip: None,
            apt: None,
        });
        let job = Job::new(job_config(), 0).unwrap();

        let dpl_env = env.deploy(&instance);
        assert_eq!(dpl_env.path_abs(), "/home/ubuntu/run/e1");

        let dpl_job = job.deploy(dpl_env);
        assert_eq!(dpl_job.path(), format!("/home/ubuntu/run/e1/{}", job.hash));
        assert_eq!(
            dpl_job.command(),
            format!("/home/ubuntu/run/e1/{}/train.py --epochs 3", job.hash)
        );
    }

    #[test]
    fn run_command_taken_verbatim() {
        let mut config = job_config();
        config.run_script = None;
        config.run_command = Some("python -c 'pass'".to_string());
        let job = Job::new(config, 0).unwrap();
        let instance = Instance::new(spec("1.1", None, false));
        let env = Environment::new(None, false, EnvironmentConfig {
            name: Some("e1".to_string()),
            conda: None,
            pip: None,
            apt: None,
        });
        let dpl = job.deploy(env.deploy(&instance));
        assert_eq!(dpl.command(), "python -c 'pass'");
    }

    #[test]
    fn state_mask_membership() {
        let mask = RunState::Done | RunState::Aborted;
        assert!(mask.contains(RunState::Done));
        assert!(mask.contains(RunState::Aborted));
        assert!(!mask.contains(RunState::Running));
        assert!(!mask.contains(RunState::Unknown));
        assert!(!StateMask::ANY.contains(RunState::Unknown));
        assert_eq!(mask, StateMask::FINISHED);
    }

    #[test]
    fn run_state_parse_is_case_insensitive() {
        assert_eq!(RunState::parse("RUNNING"), Some(RunState::Running));
        assert_eq!(RunState::parse("done"), Some(RunState::Done));
        assert_eq!(RunState::parse("Queue"), Some(RunState::Queue));
        assert_eq!(RunState::parse("bogus"), None);
    }

    #[test]
    fn path_helpers() {
        assert_eq!(basename("a/b/c.txt"), "c.txt");
        assert_eq!(basename("c.txt"), "c.txt");
        assert_eq!(dirname("a/b/c.txt"), Some("a/b"));
        assert_eq!(dirname("c.txt"), None);
        assert_eq!(dirname("/c.txt"), None);
    }

    #[test]
    fn attach_job_dedupes_env_names() {
        let mut instance = Instance::new(spec("1.1", None, false));
        instance.attach_job(0, "e1");
        instance.attach_job(1, "e1");
        instance.attach_job(2, "e2");
        assert_eq!(instance.jobs, vec![0, 1, 2]);
        assert_eq!(instance.env_names, vec!["e1", "e2"]);
    }
}
