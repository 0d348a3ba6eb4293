// ABOUTME: Daemon-container execution strategy over the Docker Engine API.
// ABOUTME: Lifecycle: create container, start, attach streams, wait, force-remove.

use async_trait::async_trait;
use bollard::container::{AttachContainerResults, LogOutput};
use bollard::errors::Error as BollardError;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    AttachContainerOptions, RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use crate::backend::Docker;
use crate::error::{Error, Result};
use crate::stream::{BoxedReader, OutputSink};

use super::Execution;

/// Options for the daemon-container strategy: the create body the container
/// will be built from, plus an optional name.
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOptions {
    pub config: ContainerCreateBody,
    pub name: Option<String>,
}

/// Execution strategy that creates a fresh container per command.
///
/// The container is created and started by `start` and removed before `wait`
/// returns, on every path.
pub fn by_creating_container(opts: CreateContainerOptions) -> CreateContainer {
    CreateContainer {
        opts,
        id: String::new(),
        attachment: None,
    }
}

pub struct CreateContainer {
    opts: CreateContainerOptions,
    /// Created container id; empty until `create` succeeds.
    id: String,
    attachment: Option<Attachment>,
}

/// The stream copy tasks bridging caller stdio and the attach socket.
/// Joining them signals that all copies finished.
struct Attachment {
    copiers: Vec<JoinHandle<std::io::Result<()>>>,
}

#[async_trait]
impl Execution<Docker> for CreateContainer {
    async fn create(&mut self, client: &Docker, cmd: Vec<String>) -> Result<()> {
        if self
            .opts
            .config
            .cmd
            .as_ref()
            .is_some_and(|c| !c.is_empty())
        {
            return Err(Error::CmdAlreadySet);
        }
        if self
            .opts
            .config
            .entrypoint
            .as_ref()
            .is_some_and(|e| !e.is_empty())
        {
            return Err(Error::EntrypointAlreadySet);
        }

        let mut config = self.opts.config.clone();
        config.attach_stdin = Some(true);
        config.attach_stdout = Some(true);
        config.attach_stderr = Some(true);
        config.open_stdin = Some(true);
        config.stdin_once = Some(true);
        config.cmd = None;
        config.entrypoint = Some(cmd);

        let options = self.opts.name.clone().map(|name| {
            bollard::query_parameters::CreateContainerOptions {
                name: Some(name),
                ..Default::default()
            }
        });

        let response = client
            .api()
            .create_container(options, config)
            .await
            .map_err(|e| Error::CreateContainer(e.to_string()))?;

        tracing::info!(container = %response.id, "created container");
        self.id = response.id;
        Ok(())
    }

    async fn run(
        &mut self,
        client: &Docker,
        stdin: BoxedReader,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::NotCreated);
        }

        client
            .api()
            .start_container(
                &self.id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
            .map_err(|e| Error::StartContainer(e.to_string()))?;

        // logs=true folds in anything the container printed before the
        // attachment landed.
        let options = AttachContainerOptions {
            stream: true,
            stdin: true,
            stdout: true,
            stderr: true,
            logs: true,
            ..Default::default()
        };

        let AttachContainerResults {
            mut output,
            mut input,
        } = client
            .api()
            .attach_container(&self.id, Some(options))
            .await
            .map_err(|e| Error::Attach(e.to_string()))?;

        let stdin_copier = tokio::spawn(async move {
            let mut stdin = stdin;
            let copied = tokio::io::copy(&mut stdin, &mut input).await;
            // StdinOnce: closing our end tells the daemon stdin is done.
            let _ = input.shutdown().await;
            copied.map(|_| ())
        });

        let output_copier = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut stderr = stderr;
            while let Some(frame) = output.next().await {
                match frame {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.write_all(&message).await?;
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.write_all(&message).await?;
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => return Err(std::io::Error::other(e.to_string())),
                }
            }
            stdout.flush().await?;
            stderr.flush().await?;
            Ok(())
        });

        self.attachment = Some(Attachment {
            copiers: vec![stdin_copier, output_copier],
        });
        Ok(())
    }

    async fn wait(&mut self, client: &Docker) -> Result<i64> {
        let outcome = self.wait_for_exit(client).await;

        // The container is removed on every path; a removal failure only
        // surfaces when the wait itself succeeded.
        let removal = self.remove(client).await;
        match outcome {
            Ok(code) => {
                removal?;
                Ok(code)
            }
            Err(e) => Err(e),
        }
    }

    async fn kill(&mut self, client: &Docker) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(1),
            signal: None,
        };
        match client.api().stop_container(&self.id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone or already stopped: nothing left to kill.
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 304,
                ..
            }) => Ok(()),
            Err(e) => Err(Error::StopContainer(e.to_string())),
        }
    }

    async fn cleanup(&mut self, client: &Docker) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(1),
            signal: None,
        };
        match client.api().stop_container(&self.id, Some(options)).await {
            // No such container: nothing else to do.
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(()),
            // Not running is fine, it still needs removing.
            Ok(())
            | Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(Error::StopContainer(e.to_string())),
        }

        client
            .api()
            .remove_container(&self.id, None::<RemoveContainerOptions>)
            .await
            .map_err(|e| Error::RemoveContainer(e.to_string()))?;
        Ok(())
    }

    fn set_env(&mut self, env: Vec<String>) -> Result<()> {
        if self
            .opts
            .config
            .env
            .as_ref()
            .is_some_and(|e| !e.is_empty())
        {
            return Err(Error::EnvAlreadySet);
        }
        self.opts.config.env = Some(env);
        Ok(())
    }

    fn set_dir(&mut self, dir: String) -> Result<()> {
        if self
            .opts
            .config
            .working_dir
            .as_ref()
            .is_some_and(|d| !d.is_empty())
        {
            return Err(Error::WorkingDirAlreadySet);
        }
        self.opts.config.working_dir = Some(dir);
        Ok(())
    }

    fn id(&self) -> &str {
        &self.id
    }
}

impl CreateContainer {
    async fn wait_for_exit(&mut self, client: &Docker) -> Result<i64> {
        let attachment = self.attachment.take().ok_or(Error::NotAttached)?;

        for copier in attachment.copiers {
            copier
                .await
                .map_err(|e| Error::Attach(e.to_string()))?
                .map_err(|e| Error::Attach(e.to_string()))?;
        }

        let mut wait_stream = client
            .api()
            .wait_container(&self.id, None::<WaitContainerOptions>);
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits through its error type; that is
            // still a normal exit for us.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::WaitContainer(e.to_string())),
            None => Err(Error::WaitContainer(
                "wait stream closed without a status".to_string(),
            )),
        }
    }

    async fn remove(&self, client: &Docker) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        client
            .api()
            .remove_container(&self.id, Some(options))
            .await
            .map_err(|e| Error::RemoveContainer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy_with(config: ContainerCreateBody) -> CreateContainer {
        by_creating_container(CreateContainerOptions {
            config,
            name: None,
        })
    }

    #[test]
    fn set_env_refuses_overwrite() {
        let mut strategy = strategy_with(ContainerCreateBody {
            env: Some(vec!["A=1".to_string()]),
            ..Default::default()
        });
        assert!(matches!(
            strategy.set_env(vec!["B=2".to_string()]),
            Err(Error::EnvAlreadySet)
        ));

        let mut strategy = strategy_with(ContainerCreateBody::default());
        strategy.set_env(vec!["B=2".to_string()]).unwrap();
        assert_eq!(strategy.opts.config.env, Some(vec!["B=2".to_string()]));
    }

    #[test]
    fn set_dir_refuses_overwrite() {
        let mut strategy = strategy_with(ContainerCreateBody {
            working_dir: Some("/srv".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            strategy.set_dir("/tmp".to_string()),
            Err(Error::WorkingDirAlreadySet)
        ));
    }

    #[tokio::test]
    async fn create_rejects_preset_cmd_and_entrypoint() {
        let client = Docker::connect_unix("/var/run/docker.sock", 5).unwrap();

        let mut strategy = strategy_with(ContainerCreateBody {
            cmd: Some(vec!["echo".to_string()]),
            ..Default::default()
        });
        assert!(matches!(
            strategy.create(&client, vec!["true".to_string()]).await,
            Err(Error::CmdAlreadySet)
        ));

        let mut strategy = strategy_with(ContainerCreateBody {
            entrypoint: Some(vec!["sh".to_string()]),
            ..Default::default()
        });
        assert!(matches!(
            strategy.create(&client, vec!["true".to_string()]).await,
            Err(Error::EntrypointAlreadySet)
        ));
    }

    #[tokio::test]
    async fn run_before_create_is_rejected() {
        let client = Docker::connect_unix("/var/run/docker.sock", 5).unwrap();
        let mut strategy = strategy_with(ContainerCreateBody::default());
        let result = strategy
            .run(
                &client,
                Box::new(tokio::io::empty()),
                OutputSink::discard(),
                OutputSink::discard(),
            )
            .await;
        assert!(matches!(result, Err(Error::NotCreated)));
    }

    #[tokio::test]
    async fn wait_before_attach_is_rejected() {
        let client = Docker::connect_unix("/var/run/docker.sock", 5).unwrap();
        let mut strategy = strategy_with(ContainerCreateBody::default());
        // No attachment yet; the wait fails before touching the daemon for
        // the exit code, though the removal attempt is still made.
        let result = strategy.wait_for_exit(&client).await;
        assert!(matches!(result, Err(Error::NotAttached)));
    }
}
