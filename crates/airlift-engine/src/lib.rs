//! Airlift engine: bounded per-instance fan-out, the batched run
//! coordinator, the remote state reconciler and the orchestrator facade
//! that drives start → assign → deploy → run → wait.

mod error;
mod fanout;
mod launcher;
mod orchestrator;
mod reconciler;

pub use error::{EngineError, EngineResult};
pub use fanout::{fan_out, successes, MAX_WORKERS};
pub use launcher::Launcher;
pub use orchestrator::Orchestrator;
pub use reconciler::{Reconciler, POLL_INTERVAL};
