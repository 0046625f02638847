//! The run coordinator.
//!
//! Groups assigned jobs by instance and launches one batched run per
//! instance: a pre-run script preparing each job's run directory and
//! initial lifecycle marker (`wait` for the first job of the batch,
//! `queue` for the rest — the batch executes sequentially), a run script
//! invoking the remote run wrapper once per job, and a pid script for
//! later pid retrieval. The run script is executed detached; one Process
//! handle is synthesized per job with its fresh run uid and no pid (the
//! reconciler fills pids in from remote state).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use airlift_core::entity::{
    basename, dirname, DeployedJob, InstanceId, Process, SharedProcess,
};
use airlift_core::registry::Inventory;
use airlift_remote::traits::{ConnectTarget, FileChannel, RemoteConnection, RemoteExecutor};

use crate::error::{EngineError, EngineResult};
use crate::fanout::{self, fan_out};

/// Facts captured at batch-build time, enough to mint a [`Process`].
#[derive(Debug, Clone)]
struct ProcessSeed {
    job: usize,
    uid: String,
    env_name: String,
    job_hash: String,
    output_file: String,
}

/// One instance's combined batch.
struct InstanceBatch {
    pre: String,
    run: String,
    pid: String,
    seeds: Vec<ProcessSeed>,
}

/// Builds and launches batched runs across instances.
pub struct Launcher<R: RemoteExecutor> {
    executor: R,
}

impl<R: RemoteExecutor> Launcher<R> {
    pub fn new(executor: R) -> Self {
        Self { executor }
    }

    /// Launch every assigned job, batched per instance, concurrently
    /// across instances. A job without an instance is a phase error; a
    /// failing instance loses only its own batch.
    pub async fn run_jobs(&self, inventory: &Arc<Inventory>) -> EngineResult<Vec<SharedProcess>> {
        let batches = build_batches(inventory).await?;

        // One batch uid shared across all instances of this invocation.
        let batch_uid = Uuid::new_v4().simple().to_string();

        let work: Vec<(InstanceId, InstanceBatch)> = batches.into_iter().collect();
        let results = fan_out(work, |instance_id, batch| {
            let executor = self.executor.clone();
            let inventory = inventory.clone();
            let batch_uid = batch_uid.clone();
            async move {
                launch_batch(&executor, &inventory, instance_id, batch, &batch_uid).await
            }
        })
        .await;

        let mut processes = Vec::new();
        for (_, launched) in fanout::successes(results) {
            processes.extend(launched);
        }
        info!(count = processes.len(), "jobs launched");
        Ok(processes)
    }
}

/// Group jobs by instance and accumulate the three per-instance scripts.
async fn build_batches(
    inventory: &Arc<Inventory>,
) -> EngineResult<HashMap<InstanceId, InstanceBatch>> {
    let mut batches: HashMap<InstanceId, InstanceBatch> = HashMap::new();

    for (job_id, shared) in inventory.jobs.iter().enumerate() {
        let job = shared.read().await.clone();
        let instance_id = job.instance.ok_or(EngineError::UnassignedJob(job.rank))?;
        let instance = inventory.instances[instance_id].read().await.clone();
        let env = inventory
            .environment_of(&job)
            .ok_or(EngineError::MissingEnvironment(job.rank))?;
        let dpl_job = job.deploy(env.deploy(&instance));

        let uid = Uuid::new_v4().simple().to_string();
        let run_path = format!("{}/{uid}", dpl_job.path());
        let pid_file = format!("{run_path}/pid");
        let state_file = format!("{run_path}/state");

        let batch = batches.entry(instance_id).or_insert_with(|| InstanceBatch {
            pre: String::new(),
            run: String::new(),
            pid: String::new(),
            seeds: Vec::new(),
        });

        // The first job of a batch waits for bootstrap; the others queue
        // behind it. Sequential order is the batch file's line order.
        let initial_state = if batch.pre.is_empty() { "wait" } else { "queue" };
        batch.pre.push_str(&format!(
            "rm -f {pid_file} && mkdir -p {run_path} && echo '{initial_state}' > {state_file}\n"
        ));
        let links = link_command(&dpl_job, &uid);
        if !links.is_empty() {
            batch.pre.push_str(&links);
            batch.pre.push('\n');
        }

        batch.run.push_str(&format!(
            "$HOME/run/run.sh \"{}\" \"{}\" {} {} {} {}\n",
            env.name,
            dpl_job.command(),
            job.input_file(),
            job.output_file(),
            job.hash,
            uid
        ));
        batch.pid.push_str(&format!("$HOME/run/getpid.sh \"{pid_file}\"\n"));

        batch.seeds.push(ProcessSeed {
            job: job_id,
            uid,
            env_name: env.name.clone(),
            job_hash: job.hash.clone(),
            output_file: job.output_file().to_string(),
        });
    }
    Ok(batches)
}

/// Upload and start one instance's batch, then mint its process handles.
async fn launch_batch<R: RemoteExecutor>(
    executor: &R,
    inventory: &Arc<Inventory>,
    instance_id: InstanceId,
    batch: InstanceBatch,
    batch_uid: &str,
) -> EngineResult<Vec<SharedProcess>> {
    let instance = inventory.instances[instance_id].read().await.clone();
    let target = ConnectTarget::for_instance(&instance)?;
    let conn = executor.connect(&target).await?;
    let chan = conn.open_channel().await?;

    let run_file = format!("batch_run-{batch_uid}.sh");
    let pid_file = format!("batch_pid-{batch_uid}.sh");

    let mut script = batch.pre.clone();
    script.push_str(&batch.run);
    chan.put_bytes(
        script.into_bytes(),
        &format!("{}/{run_file}", instance.run_dir()),
    )
    .await?;
    chan.put_bytes(
        batch.pid.into_bytes(),
        &format!("{}/{pid_file}", instance.run_dir()),
    )
    .await?;

    conn.exec(&format!(
        "chmod +x $HOME/run/{run_file} $HOME/run/{pid_file}"
    ))
    .await?;
    // Detached: the batch outlives the connection; state is retrieved by
    // polling, not from this channel.
    conn.exec_detached(&format!("$HOME/run/{run_file}"), "$HOME/run/out.log")
        .await?;

    let mut processes = Vec::new();
    for seed in batch.seeds {
        let process = Process::new(
            seed.uid,
            seed.job,
            instance_id,
            seed.env_name,
            seed.job_hash,
            seed.output_file,
        );
        debug!(uid = %process.uid, job = seed.job, instance = %instance.name, "process created");
        processes.push(Arc::new(RwLock::new(process)));
    }
    Ok(processes)
}

/// Symlink the uploaded payload files into the per-run directory, so the
/// job sees them relative to its working directory.
fn link_command(dpl_job: &DeployedJob<'_>, uid: &str) -> String {
    let mut links = String::new();
    for file in dpl_job.job().payload_files() {
        let name = basename(&file);
        let (full_dir, upload_dir) = match dirname(&file) {
            Some(dir) if dir != "/" => (
                format!("{}/{uid}/{dir}", dpl_job.path()),
                format!("{}/{dir}", dpl_job.path()),
            ),
            _ => (format!("{}/{uid}", dpl_job.path()), dpl_job.path().to_string()),
        };
        if !links.is_empty() {
            links.push_str(" && ");
        }
        links.push_str(&format!(
            "mkdir -p {full_dir} && ln -sf {upload_dir}/{name} {full_dir}/{name}"
        ));
    }
    links
}
