//! Airlift persisted snapshot.
//!
//! Serializes the {instances, environments, jobs} graph to one JSON file
//! so a later invocation can pick up a run in flight. Cross-references
//! are stored as string ids (environment name, instance rank) and
//! resolved only after every entity is loaded; no entity is duplicated.

mod error;
mod snapshot;

pub use error::{SnapshotError, SnapshotResult};
pub use snapshot::Snapshot;
