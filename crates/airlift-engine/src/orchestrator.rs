//! The orchestrator facade.
//!
//! Assembles the phase pipeline the CLI drives: provision instances, wait
//! for them to come up, assign jobs, deploy, launch, poll. Every
//! per-instance phase goes through the bounded fan-out; a failing
//! instance is marked invalid and skipped by later phases while its
//! siblings continue.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use airlift_core::config::AirliftConfig;
use airlift_core::entity::{InstanceId, InstanceState, SharedProcess, StateMask};
use airlift_core::error::ConfigResult;
use airlift_core::registry::Inventory;
use airlift_deploy::Deployer;
use airlift_placement::assign_jobs;
use airlift_remote::traits::{InstanceBackend, RemoteExecutor};
use airlift_state::Snapshot;

use crate::error::{EngineError, EngineResult};
use crate::fanout::{self, fan_out};
use crate::launcher::Launcher;
use crate::reconciler::Reconciler;

/// Interval between instance-readiness probes.
const READY_POLL: Duration = Duration::from_secs(10);

/// Drives one run end to end against a backend and an executor.
pub struct Orchestrator<B: InstanceBackend, R: RemoteExecutor> {
    config: AirliftConfig,
    inventory: Arc<Inventory>,
    backend: B,
    executor: R,
    processes: Vec<SharedProcess>,
}

impl<B: InstanceBackend, R: RemoteExecutor> Orchestrator<B, R> {
    /// Load the inventory from configuration. Configuration errors abort
    /// here, before any provider call.
    pub fn new(config: AirliftConfig, backend: B, executor: R) -> ConfigResult<Self> {
        let inventory = Arc::new(Inventory::load(&config, &backend)?);
        Ok(Self {
            config,
            inventory,
            backend,
            executor,
            processes: Vec::new(),
        })
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    pub fn processes(&self) -> &[SharedProcess] {
        &self.processes
    }

    /// Create or find every instance and record its provider data.
    /// A creation failure marks the instance invalid; the run continues
    /// with the remaining instances.
    pub async fn start(&self) -> EngineResult<()> {
        let work = self.all_instances();
        let results = fan_out(work, |instance_id, ()| {
            let backend = self.backend.clone();
            let inventory = self.inventory.clone();
            async move {
                let spec = inventory.instances[instance_id].read().await.spec.clone();
                match backend.create_or_find(&spec).await {
                    Ok((provider_id, created)) => {
                        let probe = backend.describe(&provider_id).await?;
                        let mut instance = inventory.instances[instance_id].write().await;
                        instance.provider_id = Some(provider_id);
                        instance.ip_addr = probe.ip_addr;
                        instance.dns_addr = probe.dns_addr;
                        instance.state = probe.state;
                        info!(instance = %instance.name, created, "instance ready");
                        Ok(())
                    }
                    Err(e) => {
                        let mut instance = inventory.instances[instance_id].write().await;
                        instance.invalid = true;
                        warn!(instance = %instance.name, error = %e, "instance creation failed");
                        Err(EngineError::Backend(e))
                    }
                }
            }
        })
        .await;
        fanout::successes(results);
        Ok(())
    }

    /// Poll until every valid instance reports `Running` with a known
    /// address. Stopped instances are restarted; a failed restart
    /// terminates and recreates the instance.
    pub async fn wait_ready(&self) -> EngineResult<()> {
        let work = self.valid_instances().await;
        let results = fan_out(work, |instance_id, ()| {
            let backend = self.backend.clone();
            let inventory = self.inventory.clone();
            async move { wait_instance_ready(&backend, &inventory, instance_id).await }
        })
        .await;
        fanout::successes(results);
        Ok(())
    }

    /// Assign every unassigned job under the configured policy.
    pub async fn assign(&self) -> EngineResult<()> {
        assign_jobs(self.config.job_assign, &self.inventory).await?;
        airlift_placement::log_distribution(&self.inventory).await;
        Ok(())
    }

    /// Deploy agent scripts, environments and job payloads everywhere.
    pub async fn deploy(&self) -> EngineResult<()> {
        let work = self.valid_instances().await;
        let dev = self.config.dev;
        let log_output = self.config.print_deploy;
        let results = fan_out(work, |instance_id, ()| {
            let deployer = Deployer::new(self.executor.clone(), dev, log_output);
            let inventory = self.inventory.clone();
            async move {
                deployer.deploy(&inventory, instance_id).await?;
                Ok(())
            }
        })
        .await;
        fanout::successes(results);
        Ok(())
    }

    /// Launch all assigned jobs and keep their process handles.
    pub async fn run(&mut self) -> EngineResult<&[SharedProcess]> {
        let launcher = Launcher::new(self.executor.clone());
        self.processes = launcher.run_jobs(&self.inventory).await?;
        Ok(&self.processes)
    }

    /// Block until every launched process reaches a state within `mask`.
    pub async fn wait(&self, mask: StateMask) -> EngineResult<()> {
        Reconciler::new(self.executor.clone())
            .wait_for(&self.inventory, &self.processes, mask)
            .await
    }

    /// Poll once and return with the best-known states recorded.
    pub async fn refresh(&self) -> EngineResult<()> {
        Reconciler::new(self.executor.clone())
            .refresh(&self.inventory, &self.processes)
            .await
    }

    /// Clear every remote marker so the next deploy re-uploads.
    pub async fn reset(&self) -> EngineResult<()> {
        let work = self.valid_instances().await;
        let dev = self.config.dev;
        let results = fan_out(work, |instance_id, ()| {
            let deployer = Deployer::new(self.executor.clone(), dev, false);
            let inventory = self.inventory.clone();
            async move {
                deployer.reset(&inventory, instance_id).await?;
                Ok(())
            }
        })
        .await;
        fanout::successes(results);
        Ok(())
    }

    /// Persist the entity graph and tracked processes.
    pub async fn save_state(&self, path: &Path) -> EngineResult<()> {
        let snapshot = Snapshot::capture(&self.inventory, &self.processes).await;
        if let Err(e) = snapshot.save(path) {
            warn!(error = %e, "snapshot save failed");
        }
        Ok(())
    }

    /// Restore a previous run's state when a consistent snapshot exists.
    /// An absent or inconsistent snapshot is not an error.
    pub async fn try_restore(&mut self, path: &Path) -> bool {
        let snapshot = match Snapshot::load(path) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                info!(error = %e, "no usable snapshot");
                return false;
            }
        };
        if !snapshot.consistent_with(&self.inventory).await {
            warn!("snapshot inconsistent with configuration, ignoring");
            return false;
        }
        match snapshot.restore_into(&self.inventory).await {
            Ok(()) => {
                self.processes = snapshot.restore_processes(&self.inventory).await;
                true
            }
            Err(e) => {
                warn!(error = %e, "snapshot restore failed");
                false
            }
        }
    }

    fn all_instances(&self) -> Vec<(InstanceId, ())> {
        (0..self.inventory.instances.len()).map(|id| (id, ())).collect()
    }

    async fn valid_instances(&self) -> Vec<(InstanceId, ())> {
        let mut ids = Vec::new();
        for (id, instance) in self.inventory.instances.iter().enumerate() {
            if !instance.read().await.invalid {
                ids.push((id, ()));
            }
        }
        ids
    }
}

/// Readiness loop for one instance: refresh provider data until the
/// machine runs and has an address, restarting or recreating it on the
/// way when the provider reports it stopped.
async fn wait_instance_ready<B: InstanceBackend>(
    backend: &B,
    inventory: &Arc<Inventory>,
    instance_id: InstanceId,
) -> EngineResult<()> {
    loop {
        let (provider_id, spec) = {
            let instance = inventory.instances[instance_id].read().await;
            (instance.provider_id.clone(), instance.spec.clone())
        };
        let Some(provider_id) = provider_id else {
            return Err(EngineError::Worker(format!(
                "instance {} has no provider handle",
                spec.rank
            )));
        };

        let probe = backend.describe(&provider_id).await?;
        {
            let mut instance = inventory.instances[instance_id].write().await;
            instance.ip_addr = probe.ip_addr.clone();
            instance.dns_addr = probe.dns_addr.clone();
            instance.state = probe.state;
        }

        match probe.state {
            InstanceState::Running if probe.dns_addr.is_some() => return Ok(()),
            InstanceState::Stopped | InstanceState::Stopping => {
                if let Err(e) = backend.start(&provider_id).await {
                    warn!(error = %e, "restart failed, recreating instance");
                    backend.terminate(&provider_id).await?;
                    let (new_id, _) = backend.create_or_find(&spec).await?;
                    inventory.instances[instance_id].write().await.provider_id = Some(new_id);
                }
            }
            _ => {}
        }

        info!(rank = %spec.rank, state = ?probe.state, "waiting for instance");
        tokio::time::sleep(READY_POLL).await;
    }
}
