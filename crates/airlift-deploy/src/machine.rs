//! The deployment state machine.
//!
//! Per instance, three nested levels of (re-)upload are decided and
//! executed: the instance's agent scripts, each attached environment, and
//! each assigned job's payload. The decision rule is the same at every
//! level: probe a marker at a well-known path; absence means upload and
//! write the marker on success, presence means skip. Re-running deploy on
//! an already-deployed instance is a no-op apart from configuration or
//! job-list changes.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, warn};

use airlift_core::entity::{basename, dirname, Instance, InstanceId, READY_MARKER};
use airlift_core::registry::Inventory;
use airlift_remote::traits::{
    ConnectTarget, FileChannel, RemoteConnection, RemoteExecutor,
};

use crate::error::{DeployError, DeployResult};

/// Agent scripts uploaded to `$HOME/run` on every instance.
const AGENT_SCRIPTS: [(&str, &str); 4] = [
    ("bootstrap.sh", include_str!("../remote/bootstrap.sh")),
    ("run.sh", include_str!("../remote/run.sh")),
    ("state.sh", include_str!("../remote/state.sh")),
    ("getpid.sh", include_str!("../remote/getpid.sh")),
];

/// Re-upload decisions recorded while deploying one instance.
#[derive(Debug, Default)]
pub struct DeployLedger {
    /// Agent scripts were (re-)uploaded.
    pub instance_uploaded: bool,
    /// Per environment name: manifest was (re-)uploaded.
    pub env_uploaded: HashMap<String, bool>,
    /// Number of job payloads (re-)uploaded.
    pub jobs_uploaded: u32,
}

/// Drives the three deployment levels over one connection per instance.
pub struct Deployer<R: RemoteExecutor> {
    executor: R,
    dev: bool,
    log_output: bool,
}

impl<R: RemoteExecutor> Deployer<R> {
    pub fn new(executor: R, dev: bool, log_output: bool) -> Self {
        Self {
            executor,
            dev,
            log_output,
        }
    }

    /// Deploy everything the instance needs: agent scripts, environments,
    /// job payloads. Connection failures and broken commands are fatal
    /// for this instance; missing local payload files are not.
    pub async fn deploy(
        &self,
        inventory: &Inventory,
        instance_id: InstanceId,
    ) -> DeployResult<DeployLedger> {
        let instance = inventory.instances[instance_id].read().await.clone();
        let target = ConnectTarget::for_instance(&instance)?;
        let conn = self.executor.connect(&target).await?;
        let chan = conn.open_channel().await?;

        let mut ledger = DeployLedger::default();
        debug!(instance = %instance.name, "deploying agent scripts");
        self.deploy_base(&instance, &conn, &chan, &mut ledger).await?;
        debug!(instance = %instance.name, "deploying environments");
        self.deploy_environments(inventory, &instance, &conn, &chan, &mut ledger)
            .await?;
        debug!(instance = %instance.name, "deploying job payloads");
        self.deploy_jobs(inventory, &instance, &conn, &chan, &mut ledger)
            .await?;

        info!(
            instance = %instance.name,
            scripts = ledger.instance_uploaded,
            jobs = ledger.jobs_uploaded,
            "deployment complete"
        );
        Ok(ledger)
    }

    /// Remove every marker on the instance so the next deploy re-uploads
    /// scripts, environments and payloads from scratch.
    pub async fn reset(&self, inventory: &Inventory, instance_id: InstanceId) -> DeployResult<()> {
        let instance = inventory.instances[instance_id].read().await.clone();
        let target = ConnectTarget::for_instance(&instance)?;
        let conn = self.executor.connect(&target).await?;

        let mut command = format!("rm -f $HOME/run/{READY_MARKER}");
        for env_name in &instance.env_names {
            if let Some((_, env)) = inventory.environment_by_name(env_name) {
                let dpl_env = env.deploy(&instance);
                command.push_str(&format!(" {}/{READY_MARKER}", dpl_env.path_abs()));
            }
        }
        for &job_id in &instance.jobs {
            let job = inventory.jobs[job_id].read().await.clone();
            if let Some(env) = inventory.environment_of(&job) {
                let dpl_job = job.deploy(env.deploy(&instance));
                command.push_str(&format!(" {}/{READY_MARKER}", dpl_job.path()));
            }
        }
        conn.exec(&command).await?;
        info!(instance = %instance.name, "markers cleared");
        Ok(())
    }

    // ── Level 1: instance ───────────────────────────────────────────

    async fn deploy_base(
        &self,
        instance: &Instance,
        conn: &R::Conn,
        chan: &<R::Conn as RemoteConnection>::Channel,
        ledger: &mut DeployLedger,
    ) -> DeployResult<()> {
        let marker = format!("$HOME/run/{READY_MARKER}");
        if conn.exists(&marker, true).await? {
            ledger.instance_uploaded = false;
            return Ok(());
        }

        self.exec_logged(conn, &format!("mkdir -p $HOME/run && rm -f {marker}"))
            .await?;
        for (name, content) in AGENT_SCRIPTS {
            chan.put_bytes(
                content.as_bytes().to_vec(),
                &format!("{}/{name}", instance.run_dir()),
            )
            .await?;
        }
        self.exec_logged(conn, "chmod +x $HOME/run/*.sh").await?;
        chan.put_bytes(Vec::new(), &format!("{}/{READY_MARKER}", instance.run_dir()))
            .await?;

        ledger.instance_uploaded = true;
        Ok(())
    }

    // ── Level 2: environments ───────────────────────────────────────

    async fn deploy_environments(
        &self,
        inventory: &Inventory,
        instance: &Instance,
        conn: &R::Conn,
        chan: &<R::Conn as RemoteConnection>::Channel,
        ledger: &mut DeployLedger,
    ) -> DeployResult<()> {
        // One combined bootstrap invocation per instance: the package
        // tooling is not safe to run concurrently against itself.
        let mut bootstrap_command = String::new();

        for env_name in &instance.env_names {
            let Some((_, env)) = inventory.environment_by_name(env_name) else {
                warn!(env = %env_name, "environment attached to instance but not defined");
                continue;
            };
            let dpl_env = env.deploy(instance);

            let marker = format!("{}/{READY_MARKER}", dpl_env.path_abs());
            let mut re_upload = !conn.exists(&marker, true).await?;
            if !re_upload {
                // The primary marker exists; the package-manager-specific
                // artifacts may still have been removed out of band.
                if env.config.conda.is_some() {
                    let conda_dir = format!("$HOME/micromamba/envs/{}", env.name);
                    re_upload |= !conn.exists(&conda_dir, false).await?;
                }
                if env.config.pip.is_some() && env.config.conda.is_none() {
                    let venv_dir = format!("$HOME/.{}", env.name);
                    re_upload |= !conn.exists(&venv_dir, false).await?;
                }
            }

            debug!(env = %env.name, re_upload, "environment probe");
            ledger.env_uploaded.insert(env.name.clone(), re_upload);
            if !re_upload {
                continue;
            }

            self.exec_logged(
                conn,
                &format!("mkdir -p {} && rm -f {marker}", dpl_env.path()),
            )
            .await?;
            chan.put_bytes(
                dpl_env.manifest_json().into_bytes(),
                &format!("{}/manifest.json", dpl_env.path_abs()),
            )
            .await?;

            if !bootstrap_command.is_empty() {
                bootstrap_command.push_str(" ; ");
            }
            bootstrap_command.push_str(&format!(
                "$HOME/run/bootstrap.sh \"{}\" {}",
                env.name,
                if self.dev { 1 } else { 0 }
            ));
        }

        // The bootstrap script writes each environment's ready marker when
        // the tooling finishes.
        if !bootstrap_command.is_empty() {
            chan.put_bytes(
                bootstrap_command.into_bytes(),
                &format!("{}/setup_envs.sh", instance.run_dir()),
            )
            .await?;
            self.exec_logged(conn, "chmod +x $HOME/run/setup_envs.sh").await?;
            conn.exec_detached("$HOME/run/setup_envs.sh", "$HOME/run/bootstrap.log")
                .await?;
        }
        Ok(())
    }

    // ── Level 3: job payloads ───────────────────────────────────────

    async fn deploy_jobs(
        &self,
        inventory: &Inventory,
        instance: &Instance,
        conn: &R::Conn,
        chan: &<R::Conn as RemoteConnection>::Channel,
        ledger: &mut DeployLedger,
    ) -> DeployResult<()> {
        for &job_id in &instance.jobs {
            let job = inventory.jobs[job_id].read().await.clone();
            let env = inventory
                .environment_of(&job)
                .ok_or(DeployError::MissingEnvironment(job.rank))?;
            let dpl_job = job.deploy(env.deploy(instance));

            // Create the payload directory and any subdirectories implied
            // by files with a directory component.
            let mut mkdir = format!("mkdir -p {}", dpl_job.path());
            for file in job.payload_files() {
                if let Some(dir) = dirname(&file) {
                    mkdir.push_str(&format!(" {}/{dir}", dpl_job.path()));
                }
            }
            self.exec_logged(conn, &mkdir).await?;

            let marker = format!("{}/{READY_MARKER}", dpl_job.path());
            if conn.exists(&marker, true).await? {
                continue;
            }
            self.exec_logged(conn, &format!("rm -f {marker}")).await?;

            if let Some(script) = &job.config.run_script {
                let file = script.split_whitespace().next().unwrap_or_default();
                let remote = format!("{}/{}", dpl_job.path(), basename(file));
                if let Err(e) = chan.put(Path::new(file), &remote).await {
                    warn!(job = job.rank, file, error = %e, "run script not available, skipping");
                }
            }
            for file in job.config.upload_files.iter().flatten() {
                let remote = format!("{}/{file}", dpl_job.path());
                if let Err(e) = chan.put(Path::new(file), &remote).await {
                    warn!(job = job.rank, file, error = %e, "upload file not available, skipping");
                }
            }
            if let Some(input) = &job.config.input_file {
                let remote = format!("{}/{input}", dpl_job.path());
                if let Err(e) = chan.put(Path::new(input), &remote).await {
                    warn!(job = job.rank, file = %input, error = %e, "input file not available, skipping");
                }
            }

            // Written after all uploads have been attempted.
            chan.put_bytes(Vec::new(), &marker).await?;
            ledger.jobs_uploaded += 1;
            debug!(job = job.rank, hash = %dpl_job.hash(), "payload uploaded");
        }
        Ok(())
    }

    async fn exec_logged(&self, conn: &R::Conn, command: &str) -> DeployResult<()> {
        debug!(command, "exec");
        let output = conn.exec(command).await?;
        if self.log_output && !output.stdout.is_empty() {
            info!(stdout = %output.stdout, "remote output");
        }
        if !output.stderr.is_empty() {
            warn!(stderr = %output.stderr, "remote stderr");
        }
        Ok(())
    }
}
