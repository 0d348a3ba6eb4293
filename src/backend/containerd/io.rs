// ABOUTME: FIFO-based stdio plumbing between caller streams and containerd tasks.
// ABOUTME: Creates per-process FIFO sets and pumps bytes until the shim closes its ends.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

use crate::stream::{BoxedReader, OutputSink};

/// Stdio bundle handed to task/exec creation.
///
/// The init task of a container gets `null()` (the library never starts it);
/// the exec'd process gets `streams()` with the caller's stdio.
pub(crate) struct TaskIo {
    streams: Option<Streams>,
}

pub(crate) struct Streams {
    pub stdin: BoxedReader,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl TaskIo {
    pub(crate) fn null() -> Self {
        Self { streams: None }
    }

    pub(crate) fn streams(stdin: BoxedReader, stdout: OutputSink, stderr: OutputSink) -> Self {
        Self {
            streams: Some(Streams {
                stdin,
                stdout,
                stderr,
            }),
        }
    }

    pub(crate) fn into_streams(self) -> Option<Streams> {
        self.streams
    }
}

/// The three named pipes backing one process's stdio. The temp directory is
/// kept alive for as long as the shim may hold the FIFOs open.
pub(crate) struct FifoSet {
    dir: tempfile::TempDir,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl FifoSet {
    pub(crate) fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("kivotos-io-").tempdir()?;
        let stdin = dir.path().join("stdin");
        let stdout = dir.path().join("stdout");
        let stderr = dir.path().join("stderr");
        for path in [&stdin, &stdout, &stderr] {
            mkfifo(path.as_path(), Mode::S_IRUSR | Mode::S_IWUSR)
                .map_err(|e| io::Error::other(format!("mkfifo {}: {e}", path.display())))?;
        }
        Ok(Self {
            dir,
            stdin,
            stdout,
            stderr,
        })
    }

    pub(crate) fn path_str(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }
}

/// Running copy tasks for one process's stdio.
pub(crate) struct IoPumps {
    stdout: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
    stdin: Option<JoinHandle<()>>,
    _fifos: Option<tempfile::TempDir>,
}

impl IoPumps {
    pub(crate) fn none() -> Self {
        Self {
            stdout: None,
            stderr: None,
            stdin: None,
            _fifos: None,
        }
    }

    /// Spawn the three pumps. Must be called after the runtime has been told
    /// about the FIFO paths, so the shim's ends are (or are about to be) open.
    pub(crate) fn spawn(fifos: FifoSet, streams: Streams) -> Self {
        let FifoSet {
            dir,
            stdin,
            stdout,
            stderr,
        } = fifos;

        let stdout_pump = tokio::spawn(pump_out(stdout, streams.stdout));
        let stderr_pump = tokio::spawn(pump_out(stderr, streams.stderr));
        let stdin_pump = tokio::spawn(pump_in(stdin, streams.stdin));

        Self {
            stdout: Some(stdout_pump),
            stderr: Some(stderr_pump),
            stdin: Some(stdin_pump),
            _fifos: Some(dir),
        }
    }

    /// Wait for the output pumps to hit EOF and stop feeding stdin. Called
    /// once the process has exited so captured output is complete.
    pub(crate) async fn drain(&mut self) {
        if let Some(handle) = self.stdout.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.stderr.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.stdin.take() {
            handle.abort();
        }
    }
}

async fn pump_out(path: PathBuf, mut sink: OutputSink) {
    let mut source = match pipe::OpenOptions::new().open_receiver(&path) {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to open output fifo");
            return;
        }
    };
    if let Err(e) = tokio::io::copy(&mut source, &mut sink).await {
        tracing::debug!(path = %path.display(), error = %e, "output pump ended");
    }
    let _ = sink.flush().await;
}

async fn pump_in(path: PathBuf, mut source: BoxedReader) {
    // A FIFO cannot be opened for writing until the shim opens the read end;
    // retry briefly instead of failing the exec.
    let mut dest = None;
    for _ in 0..100 {
        match pipe::OpenOptions::new().open_sender(&path) {
            Ok(sender) => {
                dest = Some(sender);
                break;
            }
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to open stdin fifo");
                return;
            }
        }
    }
    let Some(mut dest) = dest else {
        tracing::warn!(path = %path.display(), "stdin fifo never opened for reading");
        return;
    };
    if let Err(e) = tokio::io::copy(&mut source, &mut dest).await {
        tracing::debug!(path = %path.display(), error = %e, "stdin pump ended");
    }
    // Dropping the sender delivers EOF to the process's stdin.
}
