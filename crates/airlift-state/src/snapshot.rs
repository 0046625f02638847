//! Snapshot capture, persistence, consistency checking and restore.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use std::sync::Arc;

use airlift_core::config::{EnvironmentConfig, JobConfig};
use airlift_core::entity::{InstanceSpec, InstanceState, Process, RunState, SharedProcess};
use airlift_core::registry::Inventory;
use tokio::sync::RwLock;

use crate::error::{SnapshotError, SnapshotResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceRecord {
    spec: InstanceSpec,
    name: String,
    provider_id: Option<String>,
    ip_addr: Option<String>,
    dns_addr: Option<String>,
    state: InstanceState,
    invalid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EnvironmentRecord {
    name: String,
    hash: String,
    project: Option<String>,
    dev: bool,
    config: EnvironmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    hash: String,
    rank: usize,
    config: JobConfig,
    /// Cross-reference by environment name, resolved after load.
    env_name: Option<String>,
    /// Cross-reference by instance rank, resolved after load.
    instance_rank: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProcessRecord {
    uid: String,
    pid: Option<u32>,
    state: RunState,
    job_rank: usize,
    instance_rank: String,
    env_name: String,
    job_hash: String,
    output_file: String,
}

/// The serialized {instances, environments, jobs} graph, plus the
/// in-flight process handles of the run that captured it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    instances: Vec<InstanceRecord>,
    environments: Vec<EnvironmentRecord>,
    jobs: Vec<JobRecord>,
    #[serde(default)]
    processes: Vec<ProcessRecord>,
}

impl Snapshot {
    /// Capture the current entity graph and in-flight processes.
    pub async fn capture(inventory: &Inventory, tracked: &[SharedProcess]) -> Snapshot {
        let mut instances = Vec::with_capacity(inventory.instances.len());
        for shared in &inventory.instances {
            let instance = shared.read().await;
            instances.push(InstanceRecord {
                spec: instance.spec.clone(),
                name: instance.name.clone(),
                provider_id: instance.provider_id.clone(),
                ip_addr: instance.ip_addr.clone(),
                dns_addr: instance.dns_addr.clone(),
                state: instance.state,
                invalid: instance.invalid,
            });
        }

        let environments = inventory
            .environments
            .iter()
            .map(|env| EnvironmentRecord {
                name: env.name.clone(),
                hash: env.hash.clone(),
                project: env.project.clone(),
                dev: env.dev,
                config: env.config.clone(),
            })
            .collect();

        let mut jobs = Vec::with_capacity(inventory.jobs.len());
        for shared in &inventory.jobs {
            let job = shared.read().await;
            let env_name = inventory.environment_of(&job).map(|env| env.name.clone());
            let instance_rank = match job.instance {
                Some(id) => Some(inventory.instances[id].read().await.spec.rank.clone()),
                None => None,
            };
            jobs.push(JobRecord {
                hash: job.hash.clone(),
                rank: job.rank,
                config: job.config.clone(),
                env_name,
                instance_rank,
            });
        }

        let mut processes = Vec::with_capacity(tracked.len());
        for shared in tracked {
            let process = shared.read().await;
            let job_rank = inventory.jobs[process.job].read().await.rank;
            let instance_rank = inventory.instances[process.instance]
                .read()
                .await
                .spec
                .rank
                .clone();
            processes.push(ProcessRecord {
                uid: process.uid.clone(),
                pid: process.pid,
                state: process.state,
                job_rank,
                instance_rank,
                env_name: process.env_name.clone(),
                job_hash: process.job_hash.clone(),
                output_file: process.output_file.clone(),
            });
        }

        Snapshot {
            instances,
            environments,
            jobs,
            processes,
        }
    }

    pub fn save(&self, path: &Path) -> SnapshotResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "snapshot saved");
        Ok(())
    }

    pub fn load(path: &Path) -> SnapshotResult<Snapshot> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Check the snapshot against a freshly loaded inventory.
    ///
    /// Same entity counts; per index, instance (name, cpus), environment
    /// name and job (hash, rank) must match, and every job's environment
    /// reference must resolve within the snapshot. Any mismatch means the
    /// snapshot belongs to a different configuration and is treated as
    /// absent.
    pub async fn consistent_with(&self, inventory: &Inventory) -> bool {
        if self.instances.len() != inventory.instances.len()
            || self.environments.len() != inventory.environments.len()
            || self.jobs.len() != inventory.jobs.len()
        {
            warn!("snapshot entity counts differ from configuration");
            return false;
        }

        for (record, shared) in self.instances.iter().zip(&inventory.instances) {
            let instance = shared.read().await;
            if record.name != instance.name || record.spec.cpus != instance.spec.cpus {
                warn!(instance = %record.name, "snapshot instance mismatch");
                return false;
            }
        }

        for (record, env) in self.environments.iter().zip(&inventory.environments) {
            if record.name != env.name {
                warn!(environment = %record.name, "snapshot environment mismatch");
                return false;
            }
        }

        for (record, shared) in self.jobs.iter().zip(&inventory.jobs) {
            let job = shared.read().await;
            if record.hash != job.hash || record.rank != job.rank {
                warn!(rank = record.rank, "snapshot job mismatch");
                return false;
            }
            if let Some(env_name) = &record.env_name {
                if !self.environments.iter().any(|e| &e.name == env_name) {
                    warn!(env = %env_name, "snapshot job references unknown environment");
                    return false;
                }
            }
        }
        true
    }

    /// Apply the snapshot's runtime state onto the inventory: instance
    /// provider data and job-to-instance assignments. References resolve
    /// by rank after every entity exists; call only after
    /// [`consistent_with`] has accepted the snapshot.
    ///
    /// [`consistent_with`]: Snapshot::consistent_with
    pub async fn restore_into(&self, inventory: &Inventory) -> SnapshotResult<()> {
        for (record, shared) in self.instances.iter().zip(&inventory.instances) {
            let mut instance = shared.write().await;
            instance.provider_id = record.provider_id.clone();
            instance.ip_addr = record.ip_addr.clone();
            instance.dns_addr = record.dns_addr.clone();
            instance.state = record.state;
            instance.invalid = record.invalid;
            instance.jobs.clear();
            instance.env_names.clear();
        }

        for (job_id, (record, shared)) in self.jobs.iter().zip(&inventory.jobs).enumerate() {
            let Some(rank) = &record.instance_rank else {
                continue;
            };
            let (instance_id, instance) = inventory
                .instance_by_rank(rank)
                .await
                .ok_or_else(|| SnapshotError::UnknownInstance(rank.clone()))?;
            let env_name = {
                let mut job = shared.write().await;
                job.instance = Some(instance_id);
                inventory
                    .environment_of(&job)
                    .map(|env| env.name.clone())
                    .unwrap_or_default()
            };
            instance.write().await.attach_job(job_id, &env_name);
        }
        debug!("snapshot restored");
        Ok(())
    }

    /// Rebuild the process handles the snapshotting run was tracking.
    /// Ranks resolve against the restored inventory; a record whose
    /// instance vanished is dropped with a warning.
    pub async fn restore_processes(&self, inventory: &Inventory) -> Vec<SharedProcess> {
        let mut handles = Vec::with_capacity(self.processes.len());
        for record in &self.processes {
            let Some((instance_id, _)) = inventory.instance_by_rank(&record.instance_rank).await
            else {
                warn!(rank = %record.instance_rank, uid = %record.uid, "dropping process: unknown instance");
                continue;
            };
            let mut process = Process::new(
                record.uid.clone(),
                record.job_rank,
                instance_id,
                record.env_name.clone(),
                record.job_hash.clone(),
                record.output_file.clone(),
            );
            process.pid = record.pid;
            process.state = record.state;
            handles.push(Arc::new(RwLock::new(process)));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::config::{
        AirliftConfig, AssignPolicy, CpuRequest, InstanceConfig,
    };
    use airlift_core::expand::CpuCatalog;

    struct FixedCatalog;

    impl CpuCatalog for FixedCatalog {
        fn recommended_cpus(&self, _t: &str) -> Option<Vec<u32>> {
            Some(vec![1, 2, 4])
        }
        fn core_count(&self, _t: &str) -> Option<u32> {
            Some(4)
        }
    }

    fn config() -> AirliftConfig {
        AirliftConfig {
            project: Some("demo".to_string()),
            dev: false,
            job_assign: AssignPolicy::Random,
            print_deploy: false,
            instances: vec![InstanceConfig {
                instance_type: "mem.large".to_string(),
                region: None,
                cpus: Some(CpuRequest::Count(4)),
                explode: None,
                number: Some(2),
                remote_user: "ubuntu".to_string(),
            }],
            environments: vec![EnvironmentConfig {
                name: Some("e1".to_string()),
                conda: None,
                pip: Some(vec!["requests".to_string()]),
                apt: None,
            }],
            jobs: vec![JobConfig {
                env_name: None,
                run_script: None,
                run_command: Some("true".to_string()),
                upload_files: None,
                input_file: Some("in".to_string()),
                output_file: Some("out".to_string()),
                cpus: None,
            }],
        }
    }

    async fn inventory() -> Arc<Inventory> {
        Arc::new(Inventory::load(&config(), &FixedCatalog).unwrap())
    }

    #[tokio::test]
    async fn round_trip_preserves_identity() {
        let inv = inventory().await;
        {
            // Simulate a run in flight.
            let mut instance = inv.instances[1].write().await;
            instance.provider_id = Some("mem-0001".to_string());
            instance.dns_addr = Some("h1".to_string());
            instance.state = InstanceState::Running;
        }
        inv.jobs[0].write().await.instance = Some(1);
        inv.instances[1].write().await.attach_job(0, "e1");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        Snapshot::capture(&inv, &[]).await.save(&path).unwrap();

        let loaded = Snapshot::load(&path).unwrap();
        let fresh = inventory().await;
        assert!(loaded.consistent_with(&fresh).await);

        loaded.restore_into(&fresh).await.unwrap();
        let instance = fresh.instances[1].read().await;
        assert_eq!(instance.provider_id.as_deref(), Some("mem-0001"));
        assert_eq!(instance.dns_addr.as_deref(), Some("h1"));
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.jobs, vec![0]);
        assert_eq!(fresh.jobs[0].read().await.instance, Some(1));
    }

    #[tokio::test]
    async fn tampered_count_fails_consistency() {
        let inv = inventory().await;
        let mut snapshot = Snapshot::capture(&inv, &[]).await;
        snapshot.jobs.clear();
        assert!(!snapshot.consistent_with(&inv).await);
    }

    #[tokio::test]
    async fn tampered_hash_fails_consistency() {
        let inv = inventory().await;
        let mut snapshot = Snapshot::capture(&inv, &[]).await;
        snapshot.jobs[0].hash = "0000deadbeef".to_string();
        assert!(!snapshot.consistent_with(&inv).await);
    }

    #[tokio::test]
    async fn tampered_instance_cpus_fails_consistency() {
        let inv = inventory().await;
        let mut snapshot = Snapshot::capture(&inv, &[]).await;
        snapshot.instances[0].spec.cpus = Some(2);
        assert!(!snapshot.consistent_with(&inv).await);
    }

    #[tokio::test]
    async fn dangling_environment_reference_fails_consistency() {
        let inv = inventory().await;
        let mut snapshot = Snapshot::capture(&inv, &[]).await;
        snapshot.jobs[0].env_name = Some("ghost".to_string());
        assert!(!snapshot.consistent_with(&inv).await);
    }

    #[tokio::test]
    async fn unassigned_jobs_restore_as_unassigned() {
        let inv = inventory().await;
        let snapshot = Snapshot::capture(&inv, &[]).await;
        let fresh = inventory().await;
        snapshot.restore_into(&fresh).await.unwrap();
        assert!(fresh.jobs[0].read().await.instance.is_none());
    }
}
