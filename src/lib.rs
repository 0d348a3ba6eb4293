// ABOUTME: Library root for kivotos - run commands in ephemeral containers
// ABOUTME: with local-subprocess semantics over Docker or containerd.

pub mod backend;
pub mod command;
pub mod config;
pub mod error;
pub mod execution;
mod factory;
mod naming;
pub mod stats;
mod stream;

pub use backend::{Containerd, Docker};
pub use backend::containerd::spec::OciMount;
pub use command::{Cmd, GenericCmd};
pub use config::{CommandDetails, Config, ContainerConfig, Mount, NetworkConfig, TaskConfig};
pub use error::{Error, ExitError, Result};
pub use execution::{
    by_creating_container, by_creating_task, CreateContainerOptions, CreateTaskOptions,
};
pub use factory::{command, Client};
pub use stats::{get_stats, Stats};
pub use stream::{OutputSink, PipeReader, PipeWriter};
