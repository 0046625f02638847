//! Traits for the two external collaborators: the instance provider and
//! the remote-shell transport.
//!
//! Implementations are injected into the engine by the caller; the engine
//! itself never talks to a vendor API or an SSH library directly.

use std::future::Future;
use std::path::Path;

use airlift_core::entity::{Instance, InstanceSpec, InstanceState};
use airlift_core::expand::CpuCatalog;

use crate::error::{BackendError, RemoteError};

/// Point-in-time provider view of one instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceProbe {
    pub ip_addr: Option<String>,
    pub dns_addr: Option<String>,
    pub state: InstanceState,
}

/// A trait for injecting instance provisioning into the engine.
///
/// Also a [`CpuCatalog`]: the provider knows which cpu sizes each
/// instance type accepts.
pub trait InstanceBackend: CpuCatalog + Send + Sync + Clone + 'static {
    /// Region of the calling user's credentials, used when a spec does
    /// not pin one.
    fn user_region(&self) -> String;

    /// Find the instance for a spec, or create it. Returns the provider
    /// handle and whether the instance was newly created.
    fn create_or_find(
        &self,
        spec: &InstanceSpec,
    ) -> impl Future<Output = Result<(String, bool), BackendError>> + Send;

    /// Find the instance for a spec without creating it.
    fn find(
        &self,
        spec: &InstanceSpec,
    ) -> impl Future<Output = Result<Option<String>, BackendError>> + Send;

    fn start(&self, id: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn stop(&self, id: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn terminate(&self, id: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Current addresses and lifecycle state.
    fn describe(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<InstanceProbe, BackendError>> + Send;
}

/// Where to open a remote-shell connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
    /// DNS name or IP address.
    pub host: String,
    /// Login user.
    pub user: String,
    /// Region, for key lookup by implementations that need it. `None`
    /// means the calling user's default region
    /// ([`InstanceBackend::user_region`]).
    pub region: Option<String>,
}

impl ConnectTarget {
    /// Build the target for an instance. Fails when the instance has no
    /// known address yet.
    pub fn for_instance(instance: &Instance) -> Result<Self, RemoteError> {
        let host = instance
            .connect_addr()
            .ok_or_else(|| RemoteError::NoAddress(instance.name.clone()))?;
        Ok(Self {
            host: host.to_string(),
            user: instance.spec.remote_user.clone(),
            region: instance.spec.region.clone(),
        })
    }
}

/// Captured output of a completed remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A trait for injecting the remote-shell transport into the engine.
///
/// `connect` retries transient failures (instance still booting,
/// connection refused) internally with a fixed back-off — that loop is a
/// deliberate wait-for-provisioning, not an error path. Only fatal
/// failures surface.
pub trait RemoteExecutor: Send + Sync + Clone + 'static {
    type Conn: RemoteConnection;

    fn connect(
        &self,
        target: &ConnectTarget,
    ) -> impl Future<Output = Result<Self::Conn, RemoteError>> + Send;
}

/// One live connection, owned by a single fan-out worker for the duration
/// of its unit of work.
pub trait RemoteConnection: Send + Sync {
    type Channel: FileChannel;

    /// Run a command to completion and capture its output.
    fn exec(&self, command: &str) -> impl Future<Output = Result<ExecOutput, RemoteError>> + Send;

    /// Run a command detached in the background, stdout/stderr redirected
    /// to `output` on the remote side.
    fn exec_detached(
        &self,
        command: &str,
        output: &str,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// The re-upload probe: does `path` exist as a file (or directory)?
    fn exists(
        &self,
        path: &str,
        is_file: bool,
    ) -> impl Future<Output = Result<bool, RemoteError>> + Send;

    /// Open a file-transfer channel on this connection.
    fn open_channel(&self) -> impl Future<Output = Result<Self::Channel, RemoteError>> + Send;
}

/// File transfer over one connection.
pub trait FileChannel: Send + Sync {
    fn put(
        &self,
        local: &Path,
        remote: &str,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn put_bytes(
        &self,
        bytes: Vec<u8>,
        remote: &str,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}
