//! Airlift remote seam: traits for the instance provider and the
//! remote-shell transport, plus in-memory doubles for tests and local
//! dry runs.

pub mod error;
pub mod memory;
pub mod retry;
pub mod traits;

pub use error::{BackendError, BackendResult, RemoteError, RemoteResult};
pub use memory::{MemoryCloud, MemoryExecutor};
pub use traits::{
    ConnectTarget, ExecOutput, FileChannel, InstanceBackend, InstanceProbe, RemoteConnection,
    RemoteExecutor,
};
