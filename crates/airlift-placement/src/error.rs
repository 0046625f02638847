//! Error types for job assignment.

use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

/// Assignment failures. Both are fatal for the run: assignment never
/// silently drops a job.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no instances available for assignment")]
    NoInstances,

    #[error("no feasible packing: job #{rank} (cpus {cpus}) fits no instance")]
    Infeasible { rank: usize, cpus: u32 },
}
