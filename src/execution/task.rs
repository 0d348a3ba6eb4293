// ABOUTME: Namespaced-task execution strategy over containerd.
// ABOUTME: Lifecycle: lease, image, snapshot container, task, exec'd process, exit channel.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::backend::containerd::io::TaskIo;
use crate::backend::containerd::spec::{self, OciMount, Process as ProcessSpec};
use crate::backend::containerd::{
    grpc::NewContainerOpts, Container, Containerd, ExitStatus, Lease, Process, Task,
};
use crate::config::CommandDetails;
use crate::error::{Error, Result};
use crate::naming;
use crate::stream::{BoxedReader, OutputSink};

use super::Execution;

/// Grace added to every lease and deadline so garbage collection never
/// reclaims resources a still-running task holds.
const LEASE_GRACE: Duration = Duration::from_secs(5 * 60);

const OWNER_LABEL: &str = "wk/owner";
const OWNER_VALUE: &str = "chains";
const EXECUTOR_LABEL: &str = "chains/commandExecutorId";
const CHAIN_EXECUTOR_LABEL: &str = "chains/chainExecutorId";
const RESULT_LABEL: &str = "chains/commandResultId";
const DEADLINE_LABEL: &str = "chains/deadline";

/// Options for the namespaced-task strategy.
#[derive(Debug, Clone, Default)]
pub struct CreateTaskOptions {
    /// Image reference; must already exist in the client's namespace.
    pub image: String,
    /// Extra mounts in the OCI shape.
    pub mounts: Vec<OciMount>,
    /// User to run as; numeric "uid" or "uid:gid" is applied directly.
    pub user: String,
    /// Environment in KEY=VALUE form, appended after the image's own.
    pub env: Vec<String>,
    /// Caller-imposed runtime bound; zero means only the lease grace applies.
    pub command_timeout: Duration,
    pub working_dir: String,
    /// Identity tuple for container naming and labels.
    pub command_details: CommandDetails,
}

/// Execution strategy that provisions a dedicated containerd container and
/// runs the command as an exec'd process in a fresh task.
pub fn by_creating_task(opts: CreateTaskOptions) -> CreateTask {
    CreateTask {
        opts,
        cmd: Vec::new(),
        lease: None,
        container: None,
        task: None,
        process: None,
        exit_rx: None,
        deadline: None,
    }
}

pub struct CreateTask {
    opts: CreateTaskOptions,
    cmd: Vec<String>,
    lease: Option<Lease>,
    container: Option<Box<dyn Container>>,
    task: Option<Box<dyn Task>>,
    process: Option<Box<dyn Process>>,
    exit_rx: Option<oneshot::Receiver<ExitStatus>>,
    deadline: Option<Instant>,
}

#[async_trait]
impl Execution<Containerd> for CreateTask {
    async fn create(&mut self, client: &Containerd, cmd: Vec<String>) -> Result<()> {
        self.cmd = cmd;

        // The daemon's default GC window is 24 hours; with the volume of
        // short-lived tasks this library runs, resources are leased for just
        // the command timeout plus grace.
        let expiration = self.opts.command_timeout + LEASE_GRACE;
        let lease = client
            .create_lease(expiration)
            .await
            .map_err(|e| Error::CreateLease(e.to_string()))?;
        self.deadline = Some(Instant::now() + expiration);

        // The image must already be pulled into the namespace; fetching
        // private images would need auth this library does not carry.
        let image = client
            .get_image(&self.opts.image)
            .await
            .map_err(|e| Error::GetImage {
                name: self.opts.image.clone(),
                namespace: client.default_namespace().to_string(),
                message: e.to_string(),
            })?;

        let name = naming::container_name(&self.opts.command_details);
        let runtime_spec =
            spec::runtime_spec(&image.config, &self.opts.env, &self.opts.user, &self.opts.mounts);

        let container = client
            .new_container(
                NewContainerOpts {
                    id: name.clone(),
                    image_name: image.name.clone(),
                    snapshot_key: format!("{name}-snapshot"),
                    parent_chain_id: image.chain_id.clone(),
                    spec: runtime_spec,
                    labels: self.labels(expiration),
                },
                &lease,
            )
            .await
            .map_err(|e| Error::CreateContainer(e.to_string()))?;
        tracing::info!(container = %container.id(), "successfully created container");

        self.lease = Some(lease);
        self.container = Some(container);
        Ok(())
    }

    async fn run(
        &mut self,
        _client: &Containerd,
        stdin: BoxedReader,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<()> {
        let container = self.container.as_ref().ok_or(Error::NotCreated)?;

        // A task may survive a failed earlier attempt; reuse it if so.
        let task = match container.attach_task(TaskIo::null()).await {
            Ok(task) => {
                tracing::debug!("using existing task");
                task
            }
            Err(_) => {
                tracing::debug!("creating new task");
                container
                    .new_task(TaskIo::null())
                    .await
                    .map_err(|e| Error::CreateTask(e.to_string()))?
            }
        };
        tracing::info!(task = %task.id(), "successfully created task");

        let spec_result = self.process_spec(container.as_ref()).await;
        let exec_id = format!("{}-task", container.id());

        // The task is recorded before anything that can fail below, so
        // cleanup can delete it either way.
        self.task = Some(task);
        let Some(task) = self.task.as_ref() else {
            return Err(Error::NotCreated);
        };
        let process_spec = spec_result?;

        let process = task
            .exec(
                &exec_id,
                process_spec,
                TaskIo::streams(stdin, stdout, stderr),
            )
            .await
            .map_err(|e| Error::ExecProcess(e.to_string()))?;
        tracing::info!(process = %process.id(), "successfully created process");

        // Subscribing after start risks missing the exit event entirely.
        let exit_rx = process
            .wait()
            .await
            .map_err(|e| Error::WaitProcess(e.to_string()))?;

        process
            .start()
            .await
            .map_err(|e| Error::StartProcess(e.to_string()))?;
        tracing::info!(process = %process.id(), "successfully started process");

        self.exit_rx = Some(exit_rx);
        self.process = Some(process);
        Ok(())
    }

    async fn wait(&mut self, _client: &Containerd) -> Result<i64> {
        let outcome = self.wait_for_exit().await;

        // Cleanup runs no matter how the wait ended; its failures must not
        // mask the exit outcome.
        if let Err(e) = self.cleanup_resources().await {
            tracing::warn!(error = %e, "cleanup after wait failed");
        }

        outcome
    }

    async fn kill(&mut self, _client: &Containerd) -> Result<()> {
        self.cleanup_resources().await
    }

    async fn cleanup(&mut self, _client: &Containerd) -> Result<()> {
        self.cleanup_resources().await
    }

    fn set_env(&mut self, env: Vec<String>) -> Result<()> {
        if !self.opts.env.is_empty() {
            return Err(Error::EnvAlreadySet);
        }
        self.opts.env = env;
        Ok(())
    }

    fn set_dir(&mut self, dir: String) -> Result<()> {
        if !self.opts.working_dir.is_empty() {
            return Err(Error::WorkingDirAlreadySet);
        }
        self.opts.working_dir = dir;
        Ok(())
    }

    fn id(&self) -> &str {
        self.container.as_ref().map(|c| c.id()).unwrap_or("")
    }
}

impl CreateTask {
    fn labels(&self, expiration: Duration) -> HashMap<String, String> {
        let details = &self.opts.command_details;
        let deadline = chrono::Utc::now()
            + chrono::Duration::from_std(expiration).unwrap_or_else(|_| chrono::Duration::zero());
        HashMap::from([
            (OWNER_LABEL.to_string(), OWNER_VALUE.to_string()),
            (EXECUTOR_LABEL.to_string(), details.executor_id.to_string()),
            (
                CHAIN_EXECUTOR_LABEL.to_string(),
                details.chain_executor_id.to_string(),
            ),
            (RESULT_LABEL.to_string(), details.result_id.to_string()),
            (DEADLINE_LABEL.to_string(), deadline.to_rfc3339()),
        ])
    }

    /// Derive the exec'd process's spec from the container's: same
    /// environment and capabilities, our command, cwd, and uid.
    async fn process_spec(&self, container: &dyn Container) -> Result<ProcessSpec> {
        let mut container_spec = container
            .spec()
            .await
            .map_err(|e| Error::ProcessSpec(e.to_string()))?;

        let mut process = container_spec
            .process
            .take()
            .ok_or_else(|| Error::ProcessSpec("container spec has no process".to_string()))?;

        process.args = self.cmd.clone();
        if !self.opts.working_dir.is_empty() {
            process.cwd = self.opts.working_dir.clone();
        }
        if let Ok(uid) = self.opts.user.parse::<u32>() {
            process.user.uid = uid;
        }
        Ok(process)
    }

    async fn wait_for_exit(&mut self) -> Result<i64> {
        let exit_rx = self.exit_rx.take().ok_or(Error::NotAttached)?;

        let received = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, exit_rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::warn!("deadline exceeded before process completed");
                    return Err(Error::Cancelled);
                }
            },
            None => exit_rx.await,
        };

        match received {
            Err(_) => Err(Error::WaitProcess("exit channel closed".to_string())),
            Ok(ExitStatus {
                error: Some(message),
                ..
            }) => Err(Error::WaitProcess(message)),
            Ok(ExitStatus { code, .. }) => {
                tracing::info!(code, "received exit status");
                Ok(code)
            }
        }
    }

    /// Delete the task and container, swallowing NotFound, and release the
    /// lease whatever happens to the deletes.
    async fn cleanup_resources(&mut self) -> Result<()> {
        let lease = self.lease.take();
        let result = self.delete_runtime_objects().await;
        if let Some(lease) = lease {
            lease.release().await;
        }
        result
    }

    async fn delete_runtime_objects(&mut self) -> Result<()> {
        if let Some(task) = self.task.as_ref() {
            match task.delete(true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(Error::DeleteTask(e.to_string())),
            }
        }

        if let Some(container) = self.container.as_ref() {
            match container.delete(true).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(Error::DeleteContainer(e.to_string())),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::containerd::spec::{Root, Spec, User};
    use crate::backend::containerd::{ApiError, ApiResult};
    use std::sync::{Arc, Mutex};

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    fn test_client() -> Containerd {
        let channel =
            tonic::transport::Endpoint::from_static("http://[::1]:50051").connect_lazy();
        Containerd::new(channel, "unit-test")
    }

    fn sample_spec() -> Spec {
        Spec {
            oci_version: "1.1.0".to_string(),
            process: Some(ProcessSpec::default()),
            root: Some(Root {
                path: "rootfs".to_string(),
                readonly: false,
            }),
            mounts: Vec::new(),
            linux: None,
            extra: serde_json::Map::new(),
        }
    }

    #[derive(Clone, Default)]
    struct MockBehavior {
        has_existing_task: bool,
        task_delete_not_found: bool,
        task_delete_error: Option<&'static str>,
        container_delete_not_found: bool,
    }

    struct MockContainer {
        log: CallLog,
        behavior: MockBehavior,
    }

    #[async_trait]
    impl Container for MockContainer {
        fn id(&self) -> &str {
            "unit-test"
        }

        async fn spec(&self) -> ApiResult<Spec> {
            self.log.lock().unwrap().push("spec");
            Ok(sample_spec())
        }

        async fn attach_task(&self, _io: TaskIo) -> ApiResult<Box<dyn Task>> {
            self.log.lock().unwrap().push("attach_task");
            if self.behavior.has_existing_task {
                Ok(Box::new(MockTask {
                    log: self.log.clone(),
                    behavior: self.behavior.clone(),
                }))
            } else {
                Err(ApiError::NotFound("no task".to_string()))
            }
        }

        async fn new_task(&self, _io: TaskIo) -> ApiResult<Box<dyn Task>> {
            self.log.lock().unwrap().push("new_task");
            Ok(Box::new(MockTask {
                log: self.log.clone(),
                behavior: self.behavior.clone(),
            }))
        }

        async fn delete(&self, _cleanup_snapshot: bool) -> ApiResult<()> {
            self.log.lock().unwrap().push("container_delete");
            if self.behavior.container_delete_not_found {
                Err(ApiError::NotFound("gone".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct MockTask {
        log: CallLog,
        behavior: MockBehavior,
    }

    #[async_trait]
    impl Task for MockTask {
        fn id(&self) -> &str {
            "unit-test"
        }

        async fn exec(
            &self,
            _exec_id: &str,
            spec: ProcessSpec,
            _io: TaskIo,
        ) -> ApiResult<Box<dyn Process>> {
            self.log.lock().unwrap().push("exec");
            Ok(Box::new(MockProcess {
                log: self.log.clone(),
                spec,
                exit_tx: Mutex::new(None),
            }))
        }

        async fn delete(&self, _kill: bool) -> ApiResult<()> {
            self.log.lock().unwrap().push("task_delete");
            if let Some(message) = self.behavior.task_delete_error {
                return Err(ApiError::Other(message.to_string()));
            }
            if self.behavior.task_delete_not_found {
                return Err(ApiError::NotFound("gone".to_string()));
            }
            Ok(())
        }
    }

    struct MockProcess {
        log: CallLog,
        #[allow(dead_code)]
        spec: ProcessSpec,
        // Kept alive so the exit channel stays pending.
        exit_tx: Mutex<Option<oneshot::Sender<ExitStatus>>>,
    }

    #[async_trait]
    impl Process for MockProcess {
        fn id(&self) -> &str {
            "unit-test-task"
        }

        async fn wait(&self) -> ApiResult<oneshot::Receiver<ExitStatus>> {
            self.log.lock().unwrap().push("wait");
            let (tx, rx) = oneshot::channel();
            *self.exit_tx.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn start(&self) -> ApiResult<()> {
            self.log.lock().unwrap().push("start");
            Ok(())
        }
    }

    fn strategy_with_container(behavior: MockBehavior) -> (CreateTask, CallLog) {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let mut strategy = by_creating_task(CreateTaskOptions::default());
        strategy.container = Some(Box::new(MockContainer {
            log: log.clone(),
            behavior,
        }));
        (strategy, log)
    }

    fn null_stdio() -> (BoxedReader, OutputSink, OutputSink) {
        (
            Box::new(tokio::io::empty()),
            OutputSink::discard(),
            OutputSink::discard(),
        )
    }

    #[tokio::test]
    async fn run_subscribes_to_exit_before_start() {
        let (mut strategy, log) = strategy_with_container(MockBehavior::default());
        let (stdin, stdout, stderr) = null_stdio();

        strategy
            .run(&test_client(), stdin, stdout, stderr)
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        let wait_at = calls.iter().position(|c| *c == "wait").unwrap();
        let start_at = calls.iter().position(|c| *c == "start").unwrap();
        let exec_at = calls.iter().position(|c| *c == "exec").unwrap();
        assert!(exec_at < wait_at, "exec must precede wait: {calls:?}");
        assert!(wait_at < start_at, "wait must precede start: {calls:?}");

        assert!(strategy.task.is_some());
        assert!(strategy.process.is_some());
        assert!(strategy.exit_rx.is_some());
    }

    #[tokio::test]
    async fn run_attaches_to_existing_task() {
        let (mut strategy, log) = strategy_with_container(MockBehavior {
            has_existing_task: true,
            ..Default::default()
        });
        let (stdin, stdout, stderr) = null_stdio();

        strategy
            .run(&test_client(), stdin, stdout, stderr)
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        assert!(calls.contains(&"attach_task"));
        assert!(!calls.contains(&"new_task"), "{calls:?}");
    }

    #[tokio::test]
    async fn run_without_create_is_rejected() {
        let mut strategy = by_creating_task(CreateTaskOptions::default());
        let (stdin, stdout, stderr) = null_stdio();
        let result = strategy.run(&test_client(), stdin, stdout, stderr).await;
        assert!(matches!(result, Err(Error::NotCreated)));
    }

    #[tokio::test]
    async fn process_spec_applies_command_cwd_and_uid() {
        let (mut strategy, _log) = strategy_with_container(MockBehavior::default());
        strategy.cmd = vec![
            "java".to_string(),
            "-jar".to_string(),
            "data-prep-cli.jar".to_string(),
        ];
        strategy.opts.user = "61000".to_string();
        strategy.opts.working_dir = "/work/src".to_string();

        let container = strategy.container.as_ref().unwrap();
        let process = strategy.process_spec(container.as_ref()).await.unwrap();
        assert_eq!(process.args, strategy.cmd);
        assert_eq!(process.cwd, "/work/src");
        assert_eq!(process.user.uid, 61000);
    }

    #[tokio::test]
    async fn process_spec_keeps_image_cwd_when_dir_unset() {
        let (mut strategy, _log) = strategy_with_container(MockBehavior::default());
        strategy.cmd = vec!["true".to_string()];

        let container = strategy.container.as_ref().unwrap();
        let process = strategy.process_spec(container.as_ref()).await.unwrap();
        assert_eq!(process.cwd, ProcessSpec::default().cwd);
        assert_eq!(process.user.uid, User::default().uid);
    }

    #[tokio::test]
    async fn cleanup_swallows_not_found_from_task_delete() {
        let (mut strategy, log) = strategy_with_container(MockBehavior {
            task_delete_not_found: true,
            ..Default::default()
        });
        let (stdin, stdout, stderr) = null_stdio();
        strategy
            .run(&test_client(), stdin, stdout, stderr)
            .await
            .unwrap();

        strategy.cleanup(&test_client()).await.unwrap();

        let calls = log.lock().unwrap().clone();
        assert!(calls.contains(&"task_delete"));
        assert!(calls.contains(&"container_delete"), "{calls:?}");
    }

    #[tokio::test]
    async fn cleanup_short_circuits_on_task_delete_error() {
        let (mut strategy, log) = strategy_with_container(MockBehavior {
            task_delete_error: Some("unit test"),
            ..Default::default()
        });
        let (stdin, stdout, stderr) = null_stdio();
        strategy
            .run(&test_client(), stdin, stdout, stderr)
            .await
            .unwrap();

        let result = strategy.cleanup(&test_client()).await;
        assert!(matches!(result, Err(Error::DeleteTask(ref m)) if m.contains("unit test")));

        let calls = log.lock().unwrap().clone();
        assert!(
            !calls.contains(&"container_delete"),
            "container delete must not run after a task delete failure: {calls:?}"
        );
    }

    #[tokio::test]
    async fn cleanup_swallows_not_found_from_container_delete() {
        let (mut strategy, _log) = strategy_with_container(MockBehavior {
            container_delete_not_found: true,
            ..Default::default()
        });
        strategy.cleanup(&test_client()).await.unwrap();
    }

    #[tokio::test]
    async fn wait_returns_the_exit_code() {
        let mut strategy = by_creating_task(CreateTaskOptions::default());
        let (tx, rx) = oneshot::channel();
        strategy.exit_rx = Some(rx);
        tx.send(ExitStatus {
            code: 2,
            error: None,
        })
        .unwrap();

        assert_eq!(strategy.wait(&test_client()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn wait_propagates_transport_errors() {
        let mut strategy = by_creating_task(CreateTaskOptions::default());
        let (tx, rx) = oneshot::channel();
        strategy.exit_rx = Some(rx);
        tx.send(ExitStatus {
            code: -1,
            error: Some("connection reset".to_string()),
        })
        .unwrap();

        let result = strategy.wait(&test_client()).await;
        assert!(matches!(result, Err(Error::WaitProcess(ref m)) if m.contains("connection reset")));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_cancels_at_the_deadline() {
        let (mut strategy, _log) = strategy_with_container(MockBehavior::default());
        let (stdin, stdout, stderr) = null_stdio();
        strategy
            .run(&test_client(), stdin, stdout, stderr)
            .await
            .unwrap();
        // The mock keeps the exit channel pending; only the deadline can end
        // the wait.
        strategy.deadline = Some(Instant::now() + Duration::from_secs(60));

        let result = strategy.wait(&test_client()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn set_env_and_dir_are_first_writer_wins() {
        let mut strategy = by_creating_task(CreateTaskOptions::default());
        strategy.set_env(vec!["A=1".to_string()]).unwrap();
        assert!(matches!(
            strategy.set_env(vec!["B=2".to_string()]),
            Err(Error::EnvAlreadySet)
        ));

        strategy.set_dir("/work".to_string()).unwrap();
        assert!(matches!(
            strategy.set_dir("/other".to_string()),
            Err(Error::WorkingDirAlreadySet)
        ));
    }

    #[test]
    fn id_is_empty_until_a_container_exists() {
        let strategy = by_creating_task(CreateTaskOptions::default());
        assert_eq!(strategy.id(), "");

        let (strategy, _log) = strategy_with_container(MockBehavior::default());
        assert_eq!(strategy.id(), "unit-test");
    }

    #[test]
    fn labels_carry_owner_identity_and_deadline() {
        let mut strategy = by_creating_task(CreateTaskOptions::default());
        strategy.opts.command_details = CommandDetails {
            executor_id: 2,
            chain_executor_id: -1,
            result_id: 3,
        };

        let labels = strategy.labels(Duration::from_secs(300));
        assert_eq!(labels.get(OWNER_LABEL).map(String::as_str), Some("chains"));
        assert_eq!(labels.get(EXECUTOR_LABEL).map(String::as_str), Some("2"));
        assert_eq!(
            labels.get(CHAIN_EXECUTOR_LABEL).map(String::as_str),
            Some("-1")
        );
        assert_eq!(labels.get(RESULT_LABEL).map(String::as_str), Some("3"));
        let deadline = labels.get(DEADLINE_LABEL).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(deadline).is_ok());
    }
}
