// ABOUTME: gRPC-backed implementations of the namespaced runtime primitives.
// ABOUTME: Lease creation, image resolution, snapshot-backed containers, tasks, processes.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime;
use containerd_client::services::v1::snapshots::{PrepareSnapshotRequest, RemoveSnapshotRequest};
use containerd_client::services::v1::{
    Container as ContainerMessage, CreateContainerRequest, CreateRequest as CreateLeaseRequest,
    CreateTaskRequest, DeleteContainerRequest, DeleteTaskRequest, ExecProcessRequest,
    GetContainerRequest, GetImageRequest, GetRequest, KillRequest, ReadContentRequest,
    StartRequest, WaitRequest,
};
use oci_spec::image::ImageConfiguration;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tonic::Code;

use crate::naming;

use super::io::{FifoSet, IoPumps, TaskIo};
use super::spec::{self, Process as ProcessSpec, Spec};
use super::{
    ApiError, ApiResult, Container, Containerd, ExitStatus, ImageInfo, Lease, Process, Task,
    RUNTIME_NAME, SNAPSHOTTER,
};

const GC_EXPIRE_LABEL: &str = "containerd.io/gc.expire";
const LEASE_ID_RANDOM_LEN: usize = 8;
const SIGKILL: u32 = 9;

/// Options for creating a container record with a fresh snapshot.
pub(crate) struct NewContainerOpts {
    pub id: String,
    pub image_name: String,
    pub snapshot_key: String,
    pub parent_chain_id: String,
    pub spec: Spec,
    pub labels: HashMap<String, String>,
}

impl Containerd {
    /// Create a lease expiring after `expiration`, so abandoned resources are
    /// garbage collected well before the daemon's 24 hour default.
    pub(crate) async fn create_lease(&self, expiration: Duration) -> ApiResult<Lease> {
        let id = format!("kivotos-{}", naming::random_string(LEASE_ID_RANDOM_LEN));
        let expire_at = chrono::Utc::now()
            + chrono::Duration::from_std(expiration)
                .map_err(|e| ApiError::Other(format!("lease expiration out of range: {e}")))?;

        let mut labels = HashMap::new();
        labels.insert(GC_EXPIRE_LABEL.to_string(), expire_at.to_rfc3339());

        self.leases()
            .create(self.request(CreateLeaseRequest {
                id: id.clone(),
                labels,
            })?)
            .await
            .map_err(ApiError::from_status)?;

        Ok(Lease::new(self.clone(), id))
    }

    /// Resolve an image already present in the namespace: parse its config
    /// and compute the chain id of its unpacked layers. No pulling happens
    /// here; a missing image is the caller's problem to fix out of band.
    pub(crate) async fn get_image(&self, name: &str) -> ApiResult<ImageInfo> {
        let response = self
            .images()
            .get(self.request(GetImageRequest {
                name: name.to_string(),
            })?)
            .await
            .map_err(ApiError::from_status)?
            .into_inner();

        let image = response
            .image
            .ok_or_else(|| ApiError::NotFound(format!("image {name}")))?;
        let target = image
            .target
            .ok_or_else(|| ApiError::Other(format!("image {name} has no target descriptor")))?;

        let manifest = self.read_manifest(&target.digest).await?;
        let config_blob = self.read_blob(&manifest.config.digest).await?;
        let config: ImageConfiguration = serde_json::from_slice(&config_blob)
            .map_err(|e| ApiError::Other(format!("parsing image config: {e}")))?;

        let chain_id = chain_id(config.rootfs().diff_ids());

        Ok(ImageInfo {
            name: image.name,
            config,
            chain_id,
        })
    }

    /// Create a container record over a freshly prepared snapshot. Both the
    /// snapshot and the record are held by `lease`.
    pub(crate) async fn new_container(
        &self,
        opts: NewContainerOpts,
        lease: &Lease,
    ) -> ApiResult<Box<dyn Container>> {
        let prepared = self
            .snapshots()
            .prepare(self.leased_request(
                PrepareSnapshotRequest {
                    snapshotter: SNAPSHOTTER.to_string(),
                    key: opts.snapshot_key.clone(),
                    parent: opts.parent_chain_id.clone(),
                    labels: HashMap::new(),
                },
                lease,
            )?)
            .await
            .map_err(ApiError::from_status)?
            .into_inner();

        let container = ContainerMessage {
            id: opts.id.clone(),
            image: opts.image_name.clone(),
            runtime: Some(Runtime {
                name: RUNTIME_NAME.to_string(),
                options: None,
            }),
            spec: Some(spec::spec_to_any(&opts.spec)?),
            snapshotter: SNAPSHOTTER.to_string(),
            snapshot_key: opts.snapshot_key.clone(),
            labels: opts.labels,
            ..Default::default()
        };

        self.containers()
            .create(self.leased_request(
                CreateContainerRequest {
                    container: Some(container),
                },
                lease,
            )?)
            .await
            .map_err(ApiError::from_status)?;

        Ok(Box::new(GrpcContainer {
            containerd: self.clone(),
            id: opts.id,
            snapshot_key: opts.snapshot_key,
            rootfs: prepared.mounts,
        }))
    }

    async fn read_manifest(&self, digest: &str) -> ApiResult<Manifest> {
        let doc: ManifestDoc = serde_json::from_slice(&self.read_blob(digest).await?)
            .map_err(|e| ApiError::Other(format!("parsing manifest {digest}: {e}")))?;

        if let Some(config) = doc.config {
            return Ok(Manifest { config });
        }

        // Multi-platform index: descend into the first referenced manifest.
        if let Some(entries) = doc.manifests {
            let entry = entries
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::Other(format!("image index {digest} is empty")))?;
            let nested: ManifestDoc = serde_json::from_slice(&self.read_blob(&entry.digest).await?)
                .map_err(|e| ApiError::Other(format!("parsing manifest {}: {e}", entry.digest)))?;
            let config = nested.config.ok_or_else(|| {
                ApiError::Other(format!("manifest {} has no config descriptor", entry.digest))
            })?;
            return Ok(Manifest { config });
        }

        Err(ApiError::Other(format!(
            "unrecognized manifest format for {digest}"
        )))
    }

    async fn read_blob(&self, digest: &str) -> ApiResult<Vec<u8>> {
        let mut stream = self
            .content()
            .read(self.request(ReadContentRequest {
                digest: digest.to_string(),
                offset: 0,
                size: 0,
            })?)
            .await
            .map_err(ApiError::from_status)?
            .into_inner();

        let mut data = Vec::new();
        while let Some(chunk) = stream.message().await.map_err(ApiError::from_status)? {
            data.extend(chunk.data);
        }
        Ok(data)
    }
}

#[derive(Deserialize)]
struct ManifestDoc {
    config: Option<BlobRef>,
    manifests: Option<Vec<BlobRef>>,
}

struct Manifest {
    config: BlobRef,
}

#[derive(Deserialize)]
struct BlobRef {
    digest: String,
}

/// Chain id of an unpacked layer sequence, per the OCI image layout:
/// `chain(n) = sha256(chain(n-1) + " " + diff(n))`.
pub(crate) fn chain_id(diff_ids: &[String]) -> String {
    let mut iter = diff_ids.iter();
    let mut chain = match iter.next() {
        Some(first) => first.clone(),
        None => return String::new(),
    };
    for diff in iter {
        let digest = Sha256::digest(format!("{chain} {diff}").as_bytes());
        chain = format!("sha256:{digest:x}");
    }
    chain
}

struct GrpcContainer {
    containerd: Containerd,
    id: String,
    snapshot_key: String,
    rootfs: Vec<containerd_client::types::Mount>,
}

#[async_trait]
impl Container for GrpcContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn spec(&self) -> ApiResult<Spec> {
        let response = self
            .containerd
            .containers()
            .get(self.containerd.request(GetContainerRequest {
                id: self.id.clone(),
            })?)
            .await
            .map_err(ApiError::from_status)?
            .into_inner();

        let any = response
            .container
            .and_then(|c| c.spec)
            .ok_or_else(|| ApiError::Other(format!("container {} has no spec", self.id)))?;
        spec::spec_from_any(&any)
    }

    async fn attach_task(&self, _io: TaskIo) -> ApiResult<Box<dyn Task>> {
        // An existing task keeps the fifos it was created with; the raw API
        // offers no re-attachment, so the caller's streams stay unused here.
        let response = self
            .containerd
            .tasks()
            .get(self.containerd.request(GetRequest {
                container_id: self.id.clone(),
                exec_id: String::new(),
            })?)
            .await
            .map_err(ApiError::from_status)?
            .into_inner();

        if response.process.is_none() {
            return Err(ApiError::NotFound(format!("no task for {}", self.id)));
        }

        Ok(Box::new(GrpcTask {
            containerd: self.containerd.clone(),
            container_id: self.id.clone(),
        }))
    }

    async fn new_task(&self, io: TaskIo) -> ApiResult<Box<dyn Task>> {
        let streams = io.into_streams();
        let fifos = match streams {
            Some(_) => Some(
                FifoSet::create().map_err(|e| ApiError::Other(format!("creating fifos: {e}")))?,
            ),
            None => None,
        };

        let (stdin, stdout, stderr) = match &fifos {
            Some(f) => (
                FifoSet::path_str(&f.stdin),
                FifoSet::path_str(&f.stdout),
                FifoSet::path_str(&f.stderr),
            ),
            None => (String::new(), String::new(), String::new()),
        };

        self.containerd
            .tasks()
            .create(self.containerd.request(CreateTaskRequest {
                container_id: self.id.clone(),
                rootfs: self.rootfs.clone(),
                stdin,
                stdout,
                stderr,
                terminal: false,
                ..Default::default()
            })?)
            .await
            .map_err(ApiError::from_status)?;

        // Init-task pumps have no owner to drain them; they run until the
        // shim closes its ends. The library only starts exec'd processes, so
        // this path normally carries null IO.
        if let (Some(fifos), Some(streams)) = (fifos, streams) {
            let _ = IoPumps::spawn(fifos, streams);
        }

        Ok(Box::new(GrpcTask {
            containerd: self.containerd.clone(),
            container_id: self.id.clone(),
        }))
    }

    async fn delete(&self, cleanup_snapshot: bool) -> ApiResult<()> {
        if cleanup_snapshot {
            let removal = self
                .containerd
                .snapshots()
                .remove(self.containerd.request(RemoveSnapshotRequest {
                    snapshotter: SNAPSHOTTER.to_string(),
                    key: self.snapshot_key.clone(),
                })?)
                .await;
            match removal {
                Ok(_) => {}
                Err(status) if status.code() == Code::NotFound => {}
                Err(status) => return Err(ApiError::from_status(status)),
            }
        }

        self.containerd
            .containers()
            .delete(self.containerd.request(DeleteContainerRequest {
                id: self.id.clone(),
            })?)
            .await
            .map_err(ApiError::from_status)?;
        Ok(())
    }
}

struct GrpcTask {
    containerd: Containerd,
    container_id: String,
}

#[async_trait]
impl Task for GrpcTask {
    fn id(&self) -> &str {
        &self.container_id
    }

    async fn exec(
        &self,
        exec_id: &str,
        spec: ProcessSpec,
        io: TaskIo,
    ) -> ApiResult<Box<dyn Process>> {
        let process_any = spec::process_to_any(&spec)?;

        let streams = io.into_streams();
        let fifos = match streams {
            Some(_) => Some(
                FifoSet::create().map_err(|e| ApiError::Other(format!("creating fifos: {e}")))?,
            ),
            None => None,
        };
        let (stdin, stdout, stderr) = match &fifos {
            Some(f) => (
                FifoSet::path_str(&f.stdin),
                FifoSet::path_str(&f.stdout),
                FifoSet::path_str(&f.stderr),
            ),
            None => (String::new(), String::new(), String::new()),
        };

        self.containerd
            .tasks()
            .exec(self.containerd.request(ExecProcessRequest {
                container_id: self.container_id.clone(),
                exec_id: exec_id.to_string(),
                stdin,
                stdout,
                stderr,
                terminal: false,
                spec: Some(process_any),
            })?)
            .await
            .map_err(ApiError::from_status)?;

        let pumps = match (fifos, streams) {
            (Some(fifos), Some(streams)) => IoPumps::spawn(fifos, streams),
            _ => IoPumps::none(),
        };

        Ok(Box::new(GrpcProcess {
            containerd: self.containerd.clone(),
            container_id: self.container_id.clone(),
            exec_id: exec_id.to_string(),
            pumps: StdMutex::new(Some(pumps)),
        }))
    }

    async fn delete(&self, kill: bool) -> ApiResult<()> {
        if kill {
            let killed = self
                .containerd
                .tasks()
                .kill(self.containerd.request(KillRequest {
                    container_id: self.container_id.clone(),
                    exec_id: String::new(),
                    signal: SIGKILL,
                    all: true,
                })?)
                .await;
            match killed {
                Ok(_) => {}
                Err(status) if status.code() == Code::NotFound => {}
                Err(status) => {
                    tracing::warn!(task = %self.container_id, error = %status, "error killing task");
                }
            }
        }

        self.containerd
            .tasks()
            .delete(self.containerd.request(DeleteTaskRequest {
                container_id: self.container_id.clone(),
            })?)
            .await
            .map_err(ApiError::from_status)?;
        Ok(())
    }
}

struct GrpcProcess {
    containerd: Containerd,
    container_id: String,
    exec_id: String,
    pumps: StdMutex<Option<IoPumps>>,
}

#[async_trait]
impl Process for GrpcProcess {
    fn id(&self) -> &str {
        &self.exec_id
    }

    async fn wait(&self) -> ApiResult<oneshot::Receiver<ExitStatus>> {
        let request = self.containerd.request(WaitRequest {
            container_id: self.container_id.clone(),
            exec_id: self.exec_id.clone(),
        })?;
        let mut tasks = self.containerd.tasks();
        let pumps = self.pumps.lock().unwrap_or_else(|e| e.into_inner()).take();
        let (tx, rx) = oneshot::channel();

        // The wait RPC is issued here, before the caller starts the process,
        // so the exit event cannot be missed.
        tokio::spawn(async move {
            let status = match tasks.wait(request).await {
                Ok(response) => {
                    if let Some(mut pumps) = pumps {
                        pumps.drain().await;
                    }
                    ExitStatus {
                        code: i64::from(response.into_inner().exit_status),
                        error: None,
                    }
                }
                Err(status) => ExitStatus {
                    code: -1,
                    error: Some(status.to_string()),
                },
            };
            let _ = tx.send(status);
        });

        Ok(rx)
    }

    async fn start(&self) -> ApiResult<()> {
        self.containerd
            .tasks()
            .start(self.containerd.request(StartRequest {
                container_id: self.container_id.clone(),
                exec_id: self.exec_id.clone(),
            })?)
            .await
            .map_err(ApiError::from_status)?;
        Ok(())
    }
}
