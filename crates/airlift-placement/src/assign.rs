//! Job-to-instance assignment policies.

use rand::Rng;
use tracing::{debug, info};

use airlift_core::config::AssignPolicy;
use airlift_core::entity::{InstanceId, JobId};
use airlift_core::registry::Inventory;

use crate::error::{PlacementError, PlacementResult};

/// Assign every unassigned job in the inventory under the configured
/// policy. Jobs that already carry an instance are skipped, so repeated
/// calls are idempotent.
pub async fn assign_jobs(policy: AssignPolicy, inventory: &Inventory) -> PlacementResult<()> {
    if inventory.instances.is_empty() {
        return Err(PlacementError::NoInstances);
    }
    match policy {
        AssignPolicy::Random => random_assign(inventory).await,
        AssignPolicy::MultiKnapsack => knapsack_assign(inventory).await,
    }
}

/// Uniform random choice among all instances, independent per job.
/// No load awareness.
pub async fn random_assign(inventory: &Inventory) -> PlacementResult<()> {
    let mut rng = rand::thread_rng();
    for (job_id, job) in inventory.jobs.iter().enumerate() {
        if job.read().await.instance.is_some() {
            continue;
        }
        let instance_id = rng.gen_range(0..inventory.instances.len());
        commit(inventory, job_id, instance_id).await;
    }
    Ok(())
}

/// Multi-knapsack packing: instances are knapsacks with cpu capacity,
/// jobs are items weighing their cpu requirement (default 1).
///
/// Best-fit-decreasing: jobs are placed heaviest first into the tightest
/// instance that still fits them. Placement is staged and only committed
/// once every job has a home — an infeasible set fails without mutating
/// anything. The heuristic can reject rare feasible packings; capacities
/// here are coarse instance sizes, where best-fit-decreasing is exact in
/// practice.
pub async fn knapsack_assign(inventory: &Inventory) -> PlacementResult<()> {
    // Remaining capacity per instance; None = unbounded (provider-default
    // size, no declared cpu count).
    let mut remaining: Vec<Option<u32>> = Vec::with_capacity(inventory.instances.len());
    for instance in &inventory.instances {
        remaining.push(instance.read().await.spec.cpus);
    }

    // Account for jobs assigned in an earlier call.
    let mut pending: Vec<(JobId, u32)> = Vec::new();
    for (job_id, job) in inventory.jobs.iter().enumerate() {
        let job = job.read().await;
        let weight = job.config.cpus.unwrap_or(1);
        match job.instance {
            Some(instance_id) => {
                if let Some(Some(cap)) = remaining.get_mut(instance_id) {
                    *cap = cap.saturating_sub(weight);
                }
            }
            None => pending.push((job_id, weight)),
        }
    }

    // Heaviest first; rank breaks ties for determinism.
    pending.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut staged: Vec<(JobId, InstanceId)> = Vec::new();
    for (job_id, weight) in pending {
        let slot = remaining
            .iter()
            .enumerate()
            .filter(|(_, cap)| cap.map_or(true, |c| c >= weight))
            .min_by_key(|(_, cap)| cap.unwrap_or(u32::MAX))
            .map(|(id, _)| id);

        match slot {
            Some(instance_id) => {
                if let Some(cap) = remaining[instance_id] {
                    remaining[instance_id] = Some(cap - weight);
                }
                staged.push((job_id, instance_id));
            }
            None => {
                let rank = inventory.jobs[job_id].read().await.rank;
                return Err(PlacementError::Infeasible { rank, cpus: weight });
            }
        }
    }

    for (job_id, instance_id) in staged {
        commit(inventory, job_id, instance_id).await;
    }
    Ok(())
}

/// Record one assignment on both sides of the relation.
async fn commit(inventory: &Inventory, job_id: JobId, instance_id: InstanceId) {
    let env_name = {
        let mut job = inventory.jobs[job_id].write().await;
        job.instance = Some(instance_id);
        inventory
            .environment_of(&job)
            .map(|env| env.name.clone())
            .unwrap_or_default()
    };
    let mut instance = inventory.instances[instance_id].write().await;
    instance.attach_job(job_id, &env_name);
    debug!(job = job_id, instance = %instance.name, "assigned job");
}

/// Log the final distribution, one line per occupied instance.
pub async fn log_distribution(inventory: &Inventory) {
    for instance in &inventory.instances {
        let instance = instance.read().await;
        if !instance.jobs.is_empty() {
            info!(
                instance = %instance.name,
                jobs = instance.jobs.len(),
                cpus = ?instance.spec.cpus,
                "assignment"
            );
        }
    }
}
