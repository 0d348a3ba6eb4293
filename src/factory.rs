// ABOUTME: Factory: inspect the client, pick the default strategy, build the command.
// ABOUTME: Tagged dispatch over the closed client enum; other runtimes are unrepresentable.

use bollard::models::{ContainerCreateBody, HostConfig};

use crate::backend::{Containerd, Docker};
use crate::command::{Cmd, GenericCmd};
use crate::config::{self, Config};
use crate::execution::{
    by_creating_container, by_creating_task, CreateContainerOptions, CreateTaskOptions,
};

/// A client handle for one of the supported runtimes.
pub enum Client {
    Docker(Docker),
    Containerd(Containerd),
}

impl From<Docker> for Client {
    fn from(client: Docker) -> Self {
        Client::Docker(client)
    }
}

impl From<Containerd> for Client {
    fn from(client: Containerd) -> Self {
        Client::Containerd(client)
    }
}

impl From<bollard::Docker> for Client {
    fn from(client: bollard::Docker) -> Self {
        Client::Docker(Docker::new(client))
    }
}

/// Build a command for `config` with the default strategy for the client's
/// runtime.
///
/// # Panics
///
/// Panics when a containerd client has an empty default namespace; commands
/// cannot be scoped without one, and this is a programming error rather than
/// a runtime condition.
pub fn command(client: impl Into<Client>, config: Config) -> Box<dyn Cmd> {
    match client.into() {
        Client::Docker(docker) => Box::new(docker_command(docker, config)),
        Client::Containerd(containerd) => {
            if containerd.default_namespace().is_empty() {
                panic!("containerd client must have a default namespace set");
            }
            Box::new(containerd_command(containerd, config))
        }
    }
}

fn docker_command(client: Docker, config: Config) -> GenericCmd<Docker> {
    let mounts = config::daemon_mounts(&config.container.mounts);

    let body = ContainerCreateBody {
        image: Some(config.container.image),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        user: non_empty(config.container.user),
        env: non_empty_vec(config.container.env),
        host_config: Some(HostConfig {
            dns: non_empty_vec(config.network.dns),
            dns_search: non_empty_vec(config.network.dns_search),
            dns_options: non_empty_vec(config.network.dns_options),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            ..Default::default()
        }),
        ..Default::default()
    };

    let strategy = by_creating_container(CreateContainerOptions {
        config: body,
        name: None,
    });
    GenericCmd::new(
        client,
        Box::new(strategy),
        config.task.executable,
        config.task.args,
    )
}

fn containerd_command(client: Containerd, config: Config) -> GenericCmd<Containerd> {
    let strategy = by_creating_task(CreateTaskOptions {
        image: config.container.image,
        mounts: config::oci_mounts(&config.container.mounts),
        user: config.container.user,
        env: config.container.env,
        command_timeout: config.task.timeout,
        working_dir: config.task.working_dir,
        command_details: config.command_details,
    });
    GenericCmd::new(
        client,
        Box::new(strategy),
        config.task.executable,
        config.task.args,
    )
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn non_empty_vec(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() { None } else { Some(values) }
}
