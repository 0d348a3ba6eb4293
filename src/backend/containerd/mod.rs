// ABOUTME: containerd backend handle and the namespaced runtime primitives.
// ABOUTME: Containers, tasks, and processes are traits so lifecycle logic is mockable.

pub(crate) mod grpc;
pub(crate) mod io;
pub mod spec;

use std::path::Path;

use async_trait::async_trait;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::leases_client::LeasesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::DeleteRequest as DeleteLeaseRequest;
use oci_spec::image::ImageConfiguration;
use tokio::sync::oneshot;
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::Code;

use crate::error::{Error, Result};
use crate::execution::{sealed::Sealed, ContainerClient};

use self::io::TaskIo;
use self::spec::{Process as ProcessSpec, Spec};

pub(crate) const SNAPSHOTTER: &str = "overlayfs";
pub(crate) const RUNTIME_NAME: &str = "io.containerd.runc.v2";

const NAMESPACE_HEADER: &str = "containerd-namespace";
const LEASE_HEADER: &str = "containerd-lease";

/// Handle on a containerd instance, bound to one namespace.
///
/// Cloning is cheap; the tonic channel is shared. Every request this handle
/// issues carries the namespace header, and requests made under a lease carry
/// the lease header as well.
#[derive(Clone)]
pub struct Containerd {
    channel: Channel,
    namespace: String,
}

impl Containerd {
    /// Wrap an existing channel.
    pub fn new(channel: Channel, namespace: impl Into<String>) -> Self {
        Self {
            channel,
            namespace: namespace.into(),
        }
    }

    /// Connect to a containerd socket.
    pub async fn connect(
        socket_path: impl AsRef<Path>,
        namespace: impl Into<String>,
    ) -> Result<Self> {
        let channel = containerd_client::connect(socket_path.as_ref())
            .await
            .map_err(|e| Error::Connect(e.to_string()))?;
        Ok(Self::new(channel, namespace))
    }

    /// The namespace every request is scoped to.
    pub fn default_namespace(&self) -> &str {
        &self.namespace
    }

    pub(crate) fn containers(&self) -> ContainersClient<Channel> {
        ContainersClient::new(self.channel.clone())
    }

    pub(crate) fn tasks(&self) -> TasksClient<Channel> {
        TasksClient::new(self.channel.clone())
    }

    pub(crate) fn images(&self) -> ImagesClient<Channel> {
        ImagesClient::new(self.channel.clone())
    }

    pub(crate) fn leases(&self) -> LeasesClient<Channel> {
        LeasesClient::new(self.channel.clone())
    }

    pub(crate) fn snapshots(&self) -> SnapshotsClient<Channel> {
        SnapshotsClient::new(self.channel.clone())
    }

    pub(crate) fn content(&self) -> ContentClient<Channel> {
        ContentClient::new(self.channel.clone())
    }

    /// Namespace-scoped request.
    pub(crate) fn request<T>(&self, message: T) -> std::result::Result<tonic::Request<T>, ApiError> {
        let mut request = tonic::Request::new(message);
        let namespace = MetadataValue::try_from(self.namespace.as_str())
            .map_err(|e| ApiError::Other(format!("invalid namespace: {e}")))?;
        request.metadata_mut().insert(NAMESPACE_HEADER, namespace);
        Ok(request)
    }

    /// Namespace-scoped request whose created resources are held by `lease`.
    pub(crate) fn leased_request<T>(
        &self,
        message: T,
        lease: &Lease,
    ) -> std::result::Result<tonic::Request<T>, ApiError> {
        let mut request = self.request(message)?;
        let lease_id = MetadataValue::try_from(lease.id.as_str())
            .map_err(|e| ApiError::Other(format!("invalid lease id: {e}")))?;
        request.metadata_mut().insert(LEASE_HEADER, lease_id);
        Ok(request)
    }
}

impl Sealed for Containerd {}
impl ContainerClient for Containerd {}

/// containerd API failure, classified for the cleanup swallow rules.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub(crate) fn from_status(status: tonic::Status) -> Self {
        if status.code() == Code::NotFound {
            ApiError::NotFound(status.message().to_string())
        } else {
            ApiError::Other(status.to_string())
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

pub(crate) type ApiResult<T> = std::result::Result<T, ApiError>;

/// Time-bounded reservation on namespaced resources; releasing it makes the
/// container, snapshot, and content eligible for garbage collection.
pub(crate) struct Lease {
    containerd: Containerd,
    pub(crate) id: String,
}

impl Lease {
    pub(crate) fn new(containerd: Containerd, id: String) -> Self {
        Self { containerd, id }
    }

    /// Release the lease. Best effort: a failed release only delays garbage
    /// collection until the expiration label kicks in.
    pub(crate) async fn release(&self) {
        let request = match self.containerd.request(DeleteLeaseRequest {
            id: self.id.clone(),
            sync: false,
        }) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(lease = %self.id, error = %e, "could not build lease release");
                return;
            }
        };
        if let Err(status) = self.containerd.leases().delete(request).await {
            if status.code() != Code::NotFound {
                tracing::warn!(lease = %self.id, error = %status, "error releasing lease");
            }
        }
    }
}

/// An image resolved from the namespace: its parsed config and the snapshot
/// chain id of its unpacked layers.
pub(crate) struct ImageInfo {
    pub name: String,
    pub config: ImageConfiguration,
    pub chain_id: String,
}

/// Exit notification delivered over a process's wait channel.
#[derive(Debug)]
pub(crate) struct ExitStatus {
    pub code: i64,
    /// Transport failure while waiting, mutually exclusive with a real code.
    pub error: Option<String>,
}

/// A containerd container record plus its prepared snapshot.
#[async_trait]
pub(crate) trait Container: Send + Sync {
    fn id(&self) -> &str;

    /// The OCI spec stored on the container record.
    async fn spec(&self) -> ApiResult<Spec>;

    /// Attach to the container's existing task, failing if none exists.
    async fn attach_task(&self, io: TaskIo) -> ApiResult<Box<dyn Task>>;

    /// Create the container's init task without starting it.
    async fn new_task(&self, io: TaskIo) -> ApiResult<Box<dyn Task>>;

    /// Delete the container record and, when asked, its snapshot.
    async fn delete(&self, cleanup_snapshot: bool) -> ApiResult<()>;
}

/// A created task on a container; the host for exec'd processes.
#[async_trait]
pub(crate) trait Task: Send + Sync {
    fn id(&self) -> &str;

    /// Exec a process inside the task with its own stdio.
    async fn exec(
        &self,
        exec_id: &str,
        spec: ProcessSpec,
        io: TaskIo,
    ) -> ApiResult<Box<dyn Process>>;

    /// Delete the task, first killing everything in it when `kill` is set.
    async fn delete(&self, kill: bool) -> ApiResult<()>;
}

/// An exec'd process. `wait` must be subscribed before `start` or the exit
/// event can be missed.
#[async_trait]
pub(crate) trait Process: Send + Sync {
    fn id(&self) -> &str;

    /// Subscribe to the process's exit. The returned channel fires once,
    /// after the output pumps have drained.
    async fn wait(&self) -> ApiResult<oneshot::Receiver<ExitStatus>>;

    async fn start(&self) -> ApiResult<()>;
}
