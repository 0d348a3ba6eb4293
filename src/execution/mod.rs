// ABOUTME: The polymorphic execution strategy contract behind every command.
// ABOUTME: Parametrised over the backend handle so strategies cannot cross runtimes.

mod container;
mod task;

pub use container::{by_creating_container, CreateContainer, CreateContainerOptions};
pub use task::{by_creating_task, CreateTask, CreateTaskOptions};

use async_trait::async_trait;

use crate::error::Result;
use crate::stream::{BoxedReader, OutputSink};

pub(crate) mod sealed {
    /// Prevents external backend handles; only the two runtime handles this
    /// crate ships can parameterise a strategy.
    pub trait Sealed {}
}

/// Marker for backend client handles a strategy can execute against.
pub trait ContainerClient: sealed::Sealed + Clone + Send + Sync + 'static {}

/// How a command is executed on a backend.
///
/// A strategy instance belongs to exactly one command and is not reusable.
/// The client is passed into every call rather than stored, so a strategy
/// holds only its own runtime-side resources.
#[async_trait]
pub trait Execution<C: ContainerClient>: Send {
    /// Prepare the container (and, for the namespaced backend, the lease and
    /// snapshot) that will run `cmd`.
    async fn create(&mut self, client: &C, cmd: Vec<String>) -> Result<()>;

    /// Attach the streams and start execution. Must follow `create`.
    async fn run(
        &mut self,
        client: &C,
        stdin: BoxedReader,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<()>;

    /// Block until the process terminates and return its exit code.
    async fn wait(&mut self, client: &C) -> Result<i64>;

    /// Force-terminate a running command.
    async fn kill(&mut self, client: &C) -> Result<()>;

    /// Release every runtime-side resource this strategy created.
    async fn cleanup(&mut self, client: &C) -> Result<()>;

    /// First-writer-wins environment setter.
    fn set_env(&mut self, env: Vec<String>) -> Result<()>;

    /// First-writer-wins working-directory setter.
    fn set_dir(&mut self, dir: String) -> Result<()>;

    /// Backend-assigned identifier, empty until `create` succeeds.
    fn id(&self) -> &str;
}
