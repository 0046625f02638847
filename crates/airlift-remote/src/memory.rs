//! In-memory backend and executor doubles.
//!
//! `MemoryCloud` provisions named records instead of machines and
//! `MemoryExecutor` applies a small interpretation of the deployment
//! command vocabulary (mkdir/rm/bootstrap/state probes) to a fake
//! filesystem per host. Tests across the workspace — and the CLI's local
//! dry-run mode — drive the whole pipeline against them.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use airlift_core::entity::{InstanceSpec, InstanceState};
use airlift_core::expand::CpuCatalog;

use crate::error::{BackendError, RemoteError};
use crate::traits::{
    ConnectTarget, ExecOutput, FileChannel, InstanceBackend, InstanceProbe, RemoteConnection,
    RemoteExecutor,
};

// ── MemoryCloud ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CpuProfile {
    recommended: Option<Vec<u32>>,
    cores: Option<u32>,
}

#[derive(Debug)]
struct MachineRecord {
    id: String,
    name: String,
    state: InstanceState,
    ip_addr: String,
    dns_addr: String,
}

#[derive(Default)]
struct CloudInner {
    profiles: HashMap<String, CpuProfile>,
    machines: Vec<MachineRecord>,
    fail_create: HashSet<String>,
    next_id: u32,
}

/// An instance backend backed by a vector of records. Created machines
/// report `Running` with synthetic addresses on the next describe.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    inner: Arc<Mutex<CloudInner>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the cpu profile for an instance type.
    pub fn set_profile(&self, instance_type: &str, recommended: Option<Vec<u32>>, cores: Option<u32>) {
        let mut inner = self.inner.lock().expect("cloud lock");
        inner
            .profiles
            .insert(instance_type.to_string(), CpuProfile { recommended, cores });
    }

    /// Make creation of the named instance fail permanently.
    pub fn fail_creation(&self, name: &str) {
        let mut inner = self.inner.lock().expect("cloud lock");
        inner.fail_create.insert(name.to_string());
    }

    /// Number of machines created so far.
    pub fn machine_count(&self) -> usize {
        self.inner.lock().expect("cloud lock").machines.len()
    }
}

impl CpuCatalog for MemoryCloud {
    fn recommended_cpus(&self, instance_type: &str) -> Option<Vec<u32>> {
        let inner = self.inner.lock().expect("cloud lock");
        inner
            .profiles
            .get(instance_type)
            .and_then(|p| p.recommended.clone())
    }

    fn core_count(&self, instance_type: &str) -> Option<u32> {
        let inner = self.inner.lock().expect("cloud lock");
        inner.profiles.get(instance_type).and_then(|p| p.cores)
    }
}

impl InstanceBackend for MemoryCloud {
    fn user_region(&self) -> String {
        "mem-central-1".to_string()
    }

    async fn create_or_find(&self, spec: &InstanceSpec) -> Result<(String, bool), BackendError> {
        let name = spec.name();
        let mut inner = self.inner.lock().expect("cloud lock");
        if inner.fail_create.contains(&name) {
            return Err(BackendError::Create {
                name,
                reason: "capacity permanently unavailable".to_string(),
            });
        }
        if let Some(record) = inner.machines.iter().find(|m| m.name == name) {
            return Ok((record.id.clone(), false));
        }
        inner.next_id += 1;
        let n = inner.next_id;
        let record = MachineRecord {
            id: format!("mem-{n:04}"),
            name: name.clone(),
            state: InstanceState::Running,
            ip_addr: format!("10.0.0.{n}"),
            dns_addr: format!("{name}.mem.internal"),
        };
        let id = record.id.clone();
        inner.machines.push(record);
        Ok((id, true))
    }

    async fn find(&self, spec: &InstanceSpec) -> Result<Option<String>, BackendError> {
        let name = spec.name();
        let inner = self.inner.lock().expect("cloud lock");
        Ok(inner
            .machines
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.id.clone()))
    }

    async fn start(&self, id: &str) -> Result<(), BackendError> {
        self.set_state(id, InstanceState::Running)
    }

    async fn stop(&self, id: &str) -> Result<(), BackendError> {
        self.set_state(id, InstanceState::Stopped)
    }

    async fn terminate(&self, id: &str) -> Result<(), BackendError> {
        self.set_state(id, InstanceState::Terminated)
    }

    async fn describe(&self, id: &str) -> Result<InstanceProbe, BackendError> {
        let inner = self.inner.lock().expect("cloud lock");
        let record = inner
            .machines
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        Ok(InstanceProbe {
            ip_addr: Some(record.ip_addr.clone()),
            dns_addr: Some(record.dns_addr.clone()),
            state: record.state,
        })
    }
}

impl MemoryCloud {
    fn set_state(&self, id: &str, state: InstanceState) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().expect("cloud lock");
        let record = inner
            .machines
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        record.state = state;
        Ok(())
    }
}

// ── MemoryExecutor ────────────────────────────────────────────────

#[derive(Default)]
struct HostFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    commands: Vec<String>,
    uploads: u32,
    /// Programmed status replies: uid → (pid, state token).
    states: HashMap<String, (Option<u32>, String)>,
}

#[derive(Default)]
struct ExecInner {
    hosts: HashMap<String, HostFs>,
    refused: HashSet<String>,
}

/// A remote executor over fake per-host filesystems.
#[derive(Clone, Default)]
pub struct MemoryExecutor {
    inner: Arc<Mutex<ExecInner>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connections to `host` fail permanently.
    pub fn refuse(&self, host: &str) {
        let mut inner = self.inner.lock().expect("exec lock");
        inner.refused.insert(host.to_string());
    }

    /// Program the status reply for a run uid on a host.
    pub fn set_state(&self, host: &str, uid: &str, pid: Option<u32>, state: &str) {
        let mut inner = self.inner.lock().expect("exec lock");
        inner
            .hosts
            .entry(host.to_string())
            .or_default()
            .states
            .insert(uid.to_string(), (pid, state.to_string()));
    }

    /// Uploads performed against a host since the last reset.
    pub fn upload_count(&self, host: &str) -> u32 {
        let inner = self.inner.lock().expect("exec lock");
        inner.hosts.get(host).map(|h| h.uploads).unwrap_or(0)
    }

    pub fn reset_upload_count(&self, host: &str) {
        let mut inner = self.inner.lock().expect("exec lock");
        if let Some(h) = inner.hosts.get_mut(host) {
            h.uploads = 0;
        }
    }

    pub fn has_file(&self, host: &str, path: &str) -> bool {
        let inner = self.inner.lock().expect("exec lock");
        inner
            .hosts
            .get(host)
            .is_some_and(|h| h.files.contains_key(path))
    }

    pub fn file(&self, host: &str, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("exec lock");
        inner.hosts.get(host).and_then(|h| h.files.get(path).cloned())
    }

    /// Paths of files uploaded to a host, sorted.
    pub fn files(&self, host: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("exec lock");
        inner
            .hosts
            .get(host)
            .map(|h| h.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a directory from a host, simulating out-of-band removal of a
    /// package-manager artifact.
    pub fn remove_dir(&self, host: &str, path: &str) {
        let mut inner = self.inner.lock().expect("exec lock");
        if let Some(h) = inner.hosts.get_mut(host) {
            h.dirs.remove(path);
        }
    }

    /// Drop a file from a host.
    pub fn remove_file(&self, host: &str, path: &str) {
        let mut inner = self.inner.lock().expect("exec lock");
        if let Some(h) = inner.hosts.get_mut(host) {
            h.files.remove(path);
        }
    }

    pub fn commands(&self, host: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("exec lock");
        inner
            .hosts
            .get(host)
            .map(|h| h.commands.clone())
            .unwrap_or_default()
    }
}

impl RemoteExecutor for MemoryExecutor {
    type Conn = MemoryConnection;

    async fn connect(&self, target: &ConnectTarget) -> Result<MemoryConnection, RemoteError> {
        let mut inner = self.inner.lock().expect("exec lock");
        if inner.refused.contains(&target.host) {
            return Err(RemoteError::Connect {
                host: target.host.clone(),
                reason: "connection refused".to_string(),
            });
        }
        inner.hosts.entry(target.host.clone()).or_default();
        Ok(MemoryConnection {
            inner: self.inner.clone(),
            host: target.host.clone(),
            home: format!("/home/{}", target.user),
        })
    }
}

/// One fake connection; shares the executor's host table.
#[derive(Clone)]
pub struct MemoryConnection {
    inner: Arc<Mutex<ExecInner>>,
    host: String,
    home: String,
}

impl MemoryConnection {
    fn expand(&self, path: &str) -> String {
        path.replace("$HOME", &self.home)
    }

    fn with_host<T>(&self, f: impl FnOnce(&mut HostFs) -> T) -> T {
        let mut inner = self.inner.lock().expect("exec lock");
        let host = inner.hosts.entry(self.host.clone()).or_default();
        f(host)
    }

    /// Apply the side effects of one shell fragment to the fake fs.
    fn apply_fragment(&self, fragment: &str, host: &mut HostFs) {
        let fragment = fragment.trim();
        if let Some(rest) = fragment.strip_prefix("mkdir -p ") {
            for dir in rest.split_whitespace() {
                host.dirs.insert(self.expand(dir));
            }
        } else if let Some(rest) = fragment.strip_prefix("rm -f ") {
            for file in rest.split_whitespace() {
                host.files.remove(&self.expand(file));
            }
        } else if fragment.contains("bootstrap.sh") {
            // Environment bootstrap: mark the env ready and create the
            // package-manager marker directories, as the real script does
            // once the tooling finishes.
            if let Some(name) = quoted_arg(fragment) {
                host.files
                    .insert(format!("{}/run/{name}/ready", self.home), Vec::new());
                host.dirs.insert(format!("{}/micromamba/envs/{name}", self.home));
                host.dirs.insert(format!("{}/.{name}", self.home));
            }
        }
    }

    /// When a command invokes a previously uploaded script, interpret the
    /// script's content line by line as well.
    fn run_uploaded_script(&self, command: &str, host: &mut HostFs) {
        let Some(first) = command.split_whitespace().next() else {
            return;
        };
        let path = self.expand(first);
        if let Some(content) = host.files.get(&path).cloned() {
            let text = String::from_utf8_lossy(&content).into_owned();
            for line in text.lines() {
                for fragment in line.split(&['&', ';'][..]) {
                    self.apply_fragment(fragment, host);
                }
            }
        }
    }

    fn state_reply(&self, command: &str, host: &mut HostFs) -> String {
        // state.sh {env} {hash} {uid} {pid} "{output}" ...
        let args = command
            .split_once("state.sh")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        let tokens: Vec<&str> = args.split_whitespace().collect();
        let mut reply = String::new();
        for group in tokens.chunks(5) {
            if group.len() < 3 {
                continue;
            }
            let uid = group[2];
            let (pid, state) = host
                .states
                .get(uid)
                .cloned()
                .unwrap_or((None, "wait".to_string()));
            let pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "none".to_string());
            reply.push_str(&format!("{uid},{pid},{state}\n"));
        }
        reply
    }
}

impl RemoteConnection for MemoryConnection {
    type Channel = MemoryConnection;

    async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        self.with_host(|host| {
            host.commands.push(command.to_string());
            let stdout = if command.contains("state.sh") {
                self.state_reply(command, host)
            } else {
                for fragment in command.split(&['&', ';'][..]) {
                    self.apply_fragment(fragment, host);
                }
                self.run_uploaded_script(command, host);
                String::new()
            };
            Ok(ExecOutput {
                stdout,
                stderr: String::new(),
            })
        })
    }

    async fn exec_detached(&self, command: &str, _output: &str) -> Result<(), RemoteError> {
        self.with_host(|host| {
            host.commands.push(command.to_string());
            for fragment in command.split(&['&', ';'][..]) {
                self.apply_fragment(fragment, host);
            }
            self.run_uploaded_script(command, host);
        });
        Ok(())
    }

    async fn exists(&self, path: &str, is_file: bool) -> Result<bool, RemoteError> {
        let path = self.expand(path);
        Ok(self.with_host(|host| {
            if is_file {
                host.files.contains_key(&path)
            } else {
                host.dirs.contains(&path)
            }
        }))
    }

    async fn open_channel(&self) -> Result<MemoryConnection, RemoteError> {
        Ok(self.clone())
    }
}

impl FileChannel for MemoryConnection {
    async fn put(&self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let bytes = std::fs::read(local).map_err(|e| RemoteError::Upload {
            host: self.host.clone(),
            reason: format!("{}: {e}", local.display()),
        })?;
        self.put_bytes(bytes, remote).await
    }

    async fn put_bytes(&self, bytes: Vec<u8>, remote: &str) -> Result<(), RemoteError> {
        let remote = self.expand(remote);
        self.with_host(|host| {
            host.files.insert(remote, bytes);
            host.uploads += 1;
        });
        Ok(())
    }
}

/// First double-quoted argument of a shell fragment.
fn quoted_arg(fragment: &str) -> Option<&str> {
    let start = fragment.find('"')? + 1;
    let end = fragment[start..].find('"')? + start;
    Some(&fragment[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str) -> ConnectTarget {
        ConnectTarget {
            host: host.to_string(),
            user: "ubuntu".to_string(),
            region: None,
        }
    }

    fn spec(rank: &str) -> InstanceSpec {
        InstanceSpec {
            instance_type: "mem.large".to_string(),
            region: None,
            rank: rank.to_string(),
            cpus: Some(4),
            remote_user: "ubuntu".to_string(),
            project: None,
            dev: false,
            hash: "cafe01".to_string(),
        }
    }

    #[tokio::test]
    async fn cloud_create_is_idempotent() {
        let cloud = MemoryCloud::new();
        let (id1, created1) = cloud.create_or_find(&spec("1.1")).await.unwrap();
        let (id2, created2) = cloud.create_or_find(&spec("1.1")).await.unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(id1, id2);
        assert_eq!(cloud.machine_count(), 1);

        let probe = cloud.describe(&id1).await.unwrap();
        assert_eq!(probe.state, InstanceState::Running);
        assert!(probe.dns_addr.is_some());
    }

    #[test]
    fn cloud_reports_a_user_region() {
        let cloud = MemoryCloud::new();
        assert!(!cloud.user_region().is_empty());
    }

    #[tokio::test]
    async fn cloud_failed_creation() {
        let cloud = MemoryCloud::new();
        let spec = spec("1.1");
        cloud.fail_creation(&spec.name());
        assert!(cloud.create_or_find(&spec).await.is_err());
        assert!(cloud.find(&spec).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn executor_tracks_files_and_markers() {
        let exec = MemoryExecutor::new();
        let conn = exec.connect(&target("h1")).await.unwrap();

        assert!(!conn.exists("$HOME/run/ready", true).await.unwrap());
        conn.exec("mkdir -p $HOME/run && rm -f $HOME/run/ready")
            .await
            .unwrap();
        let chan = conn.open_channel().await.unwrap();
        chan.put_bytes(Vec::new(), "$HOME/run/ready").await.unwrap();
        assert!(conn.exists("$HOME/run/ready", true).await.unwrap());
        assert_eq!(exec.upload_count("h1"), 1);

        conn.exec("rm -f $HOME/run/ready").await.unwrap();
        assert!(!conn.exists("$HOME/run/ready", true).await.unwrap());
    }

    #[tokio::test]
    async fn executor_refuses_configured_hosts() {
        let exec = MemoryExecutor::new();
        exec.refuse("h2");
        assert!(exec.connect(&target("h2")).await.is_err());
        assert!(exec.connect(&target("h3")).await.is_ok());
    }

    #[tokio::test]
    async fn bootstrap_fragment_marks_environment_ready() {
        let exec = MemoryExecutor::new();
        let conn = exec.connect(&target("h1")).await.unwrap();
        conn.exec_detached("$HOME/run/bootstrap.sh \"env-a\" 0", "$HOME/run/bootstrap.log")
            .await
            .unwrap();
        assert!(conn.exists("/home/ubuntu/run/env-a/ready", true).await.unwrap());
        assert!(conn
            .exists("/home/ubuntu/micromamba/envs/env-a", false)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn state_command_replies_per_uid() {
        let exec = MemoryExecutor::new();
        exec.set_state("h1", "uid-b", Some(4242), "running(1)");
        let conn = exec.connect(&target("h1")).await.unwrap();
        let out = conn
            .exec("$HOME/run/state.sh env-a hash1 uid-a none \"o1\" env-a hash2 uid-b none \"o2\"")
            .await
            .unwrap();
        let lines: Vec<&str> = out.stdout.lines().collect();
        assert_eq!(lines, vec!["uid-a,none,wait", "uid-b,4242,running(1)"]);
    }
}
