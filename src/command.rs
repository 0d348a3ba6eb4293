// ABOUTME: The runtime-agnostic command object and its local-subprocess contract.
// ABOUTME: Delegates lifecycle verbs to the bound execution strategy.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, ExitError, Result};
use crate::execution::{ContainerClient, Execution};
use crate::stream::{self, CaptureBuffer, CloseAfterWait, OutputSink, PipeReader, PipeWriter};

/// A command prepared to run inside an ephemeral container.
///
/// The surface mirrors a local subprocess: configure stdio, `start`, `wait`.
/// A command is not reusable after `run`, `output`, or `combined_output`.
///
/// Two deliberate departures from local-subprocess conventions: the writer
/// returned by `stdin_pipe` must be closed by the caller, and `wait` does not
/// release caller-supplied stream resources.
#[async_trait]
pub trait Cmd: Send {
    /// Start the command without waiting for completion.
    async fn start(&mut self) -> Result<()>;

    /// Wait for the started command to exit. A non-zero exit code surfaces
    /// as [`Error::Exit`]. Writers created by `stdout_pipe`/`stderr_pipe`
    /// are closed before this returns, on every path.
    async fn wait(&mut self) -> Result<()>;

    /// `start` then `wait`.
    async fn run(&mut self) -> Result<()>;

    /// Run the command and return its captured stdout. If stderr was unset,
    /// it is captured too and attached to any resulting [`ExitError`].
    async fn output(&mut self) -> Result<Vec<u8>>;

    /// Run the command and return stdout and stderr interleaved in one
    /// buffer. The runtime multiplexes the two streams asynchronously, so no
    /// ordering between them is guaranteed.
    async fn combined_output(&mut self) -> Result<Vec<u8>>;

    /// Pipe connected to the command's stdin. The caller owns the returned
    /// writer and must close it to deliver EOF.
    fn stdin_pipe(&mut self) -> Result<PipeWriter>;

    /// Pipe connected to the command's stdout; EOF arrives once `wait`
    /// observes the exit and closes the write end.
    fn stdout_pipe(&mut self) -> Result<PipeReader>;

    /// Pipe connected to the command's stderr; closes like `stdout_pipe`.
    fn stderr_pipe(&mut self) -> Result<PipeReader>;

    /// Supply the command's stdin. When unset, the process reads EOF.
    fn set_stdin(&mut self, reader: Box<dyn AsyncRead + Send + Unpin>);

    /// Supply the command's stdout sink. When unset, output is discarded.
    /// Caller-supplied sinks are never closed by the library.
    fn set_stdout(&mut self, writer: Box<dyn AsyncWrite + Send + Unpin>);

    /// Supply the command's stderr sink; same ownership rules as stdout.
    fn set_stderr(&mut self, writer: Box<dyn AsyncWrite + Send + Unpin>);

    /// Set the working directory forwarded to the strategy at start.
    fn set_dir(&mut self, dir: &str);

    /// Set the environment forwarded to the strategy at start.
    fn set_env(&mut self, env: Vec<String>);

    /// Force-terminate a started command; a no-op otherwise.
    async fn kill(&mut self) -> Result<()>;

    /// Release runtime-side resources. Idempotent; safe after `wait`.
    async fn cleanup(&mut self) -> Result<()>;

    /// Backend-assigned identifier of the running command (a container or
    /// task id, not an OS pid). Empty before a successful start.
    fn pid(&self) -> String;
}

/// The one [`Cmd`] implementation, generic over the backend client.
pub struct GenericCmd<C: ContainerClient> {
    path: String,
    args: Vec<String>,
    env: Option<Vec<String>>,
    dir: Option<String>,
    stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stdout: Option<OutputSink>,
    stderr: Option<OutputSink>,
    /// Set once, before the first runtime call of `start`.
    started: bool,
    /// Set only when create and run both succeeded; gates `wait`.
    launched: bool,
    close_after_wait: CloseAfterWait,
    method: Box<dyn Execution<C>>,
    client: C,
}

impl<C: ContainerClient> GenericCmd<C> {
    /// Bind a strategy to a client and a command line. Strategies are
    /// single-use; build a fresh one per command.
    pub fn new(
        client: C,
        method: Box<dyn Execution<C>>,
        path: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            path: path.into(),
            args,
            env: None,
            dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
            started: false,
            launched: false,
            close_after_wait: CloseAfterWait::default(),
            method,
            client,
        }
    }
}

#[async_trait]
impl<C: ContainerClient> Cmd for GenericCmd<C> {
    async fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted);
        }

        if let Some(dir) = self.dir.take() {
            self.method.set_dir(dir)?;
        }
        if let Some(env) = self.env.take() {
            self.method.set_env(env)?;
        }

        self.started = true;

        let stdin = self
            .stdin
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::empty()));
        let stdout = self.stdout.take().unwrap_or_else(OutputSink::discard);
        let stderr = self.stderr.take().unwrap_or_else(OutputSink::discard);

        let mut cmd = Vec::with_capacity(1 + self.args.len());
        cmd.push(self.path.clone());
        cmd.extend(self.args.iter().cloned());

        self.method.create(&self.client, cmd).await?;
        self.method.run(&self.client, stdin, stdout, stderr).await?;
        self.launched = true;
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        if !self.launched {
            self.close_after_wait.close_all().await;
            return Err(Error::NotStarted);
        }

        let outcome = self.method.wait(&self.client).await;
        // Unblocks any reader parked on a stdout/stderr pipe.
        self.close_after_wait.close_all().await;

        let code = outcome?;
        if code != 0 {
            return Err(ExitError::new(code).into());
        }
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    async fn output(&mut self) -> Result<Vec<u8>> {
        if self.stdout.is_some() {
            return Err(Error::StdoutAlreadySet);
        }
        let stdout = CaptureBuffer::new();
        self.stdout = Some(OutputSink::new(stdout.clone()));

        let captured_stderr = if self.stderr.is_none() {
            let stderr = CaptureBuffer::new();
            self.stderr = Some(OutputSink::new(stderr.clone()));
            Some(stderr)
        } else {
            None
        };

        match self.run().await {
            Ok(()) => Ok(stdout.take()),
            Err(Error::Exit(mut exit)) => {
                if let Some(stderr) = captured_stderr {
                    exit.stderr = Some(stderr.take());
                }
                Err(exit.into())
            }
            Err(e) => Err(e),
        }
    }

    async fn combined_output(&mut self) -> Result<Vec<u8>> {
        if self.stdout.is_some() {
            return Err(Error::StdoutAlreadySet);
        }
        if self.stderr.is_some() {
            return Err(Error::StderrAlreadySet);
        }

        let combined = CaptureBuffer::new();
        self.stdout = Some(OutputSink::new(combined.clone()));
        self.stderr = Some(OutputSink::new(combined.clone()));

        self.run().await?;
        Ok(combined.take())
    }

    fn stdin_pipe(&mut self) -> Result<PipeWriter> {
        if self.stdin.is_some() {
            return Err(Error::StdinAlreadySet);
        }
        let (reader, writer) = stream::pipe();
        self.stdin = Some(Box::new(reader));
        Ok(writer)
    }

    fn stdout_pipe(&mut self) -> Result<PipeReader> {
        if self.stdout.is_some() {
            return Err(Error::StdoutAlreadySet);
        }
        let (reader, writer) = stream::pipe();
        let sink = OutputSink::new(writer);
        self.stdout = Some(sink.clone());
        self.close_after_wait.push(sink);
        Ok(reader)
    }

    fn stderr_pipe(&mut self) -> Result<PipeReader> {
        if self.stderr.is_some() {
            return Err(Error::StderrAlreadySet);
        }
        let (reader, writer) = stream::pipe();
        let sink = OutputSink::new(writer);
        self.stderr = Some(sink.clone());
        self.close_after_wait.push(sink);
        Ok(reader)
    }

    fn set_stdin(&mut self, reader: Box<dyn AsyncRead + Send + Unpin>) {
        self.stdin = Some(reader);
    }

    fn set_stdout(&mut self, writer: Box<dyn AsyncWrite + Send + Unpin>) {
        self.stdout = Some(OutputSink::new(writer));
    }

    fn set_stderr(&mut self, writer: Box<dyn AsyncWrite + Send + Unpin>) {
        self.stderr = Some(OutputSink::new(writer));
    }

    fn set_dir(&mut self, dir: &str) {
        self.dir = Some(dir.to_string());
    }

    fn set_env(&mut self, env: Vec<String>) {
        self.env = Some(env);
    }

    async fn kill(&mut self) -> Result<()> {
        if self.started {
            return self.method.kill(&self.client).await;
        }
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.method.cleanup(&self.client).await
    }

    fn pid(&self) -> String {
        if self.started {
            self.method.id().to_string()
        } else {
            String::new()
        }
    }
}
