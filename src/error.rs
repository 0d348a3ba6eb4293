// ABOUTME: Public error taxonomy for kivotos.
// ABOUTME: Misuse sentinels, ExitError, cancellation, and stage-wrapped runtime errors.

use thiserror::Error;

/// Errors surfaced by commands, strategies, and the factory.
///
/// Misuse variants report caller contract violations and never trigger
/// cleanup. Transport variants wrap the underlying runtime API failure with
/// the stage that failed; cleanup is still attempted where the lifecycle
/// demands it.
#[derive(Debug, Error)]
pub enum Error {
    // Caller contract violations.
    #[error("command already started")]
    AlreadyStarted,

    #[error("command not started")]
    NotStarted,

    #[error("stdout already set")]
    StdoutAlreadySet,

    #[error("stderr already set")]
    StderrAlreadySet,

    #[error("stdin already set")]
    StdinAlreadySet,

    #[error("container command already set")]
    CmdAlreadySet,

    #[error("container entrypoint already set")]
    EntrypointAlreadySet,

    #[error("environment already set")]
    EnvAlreadySet,

    #[error("working directory already set")]
    WorkingDirAlreadySet,

    #[error("container not created")]
    NotCreated,

    #[error("container not attached")]
    NotAttached,

    // The command ran and exited non-zero.
    #[error(transparent)]
    Exit(#[from] ExitError),

    // The strategy's deadline expired before the process exited.
    #[error("command cancelled before completion")]
    Cancelled,

    // Transport / runtime failures, prefixed with the failing stage.
    #[error("error connecting to runtime: {0}")]
    Connect(String),

    #[error("error creating container: {0}")]
    CreateContainer(String),

    #[error("error starting container: {0}")]
    StartContainer(String),

    #[error("error attaching to container: {0}")]
    Attach(String),

    #[error("error waiting for container: {0}")]
    WaitContainer(String),

    #[error("error stopping container: {0}")]
    StopContainer(String),

    #[error("error removing container: {0}")]
    RemoveContainer(String),

    #[error("error creating lease: {0}")]
    CreateLease(String),

    #[error("error getting image {name} from namespace {namespace}: {message}")]
    GetImage {
        name: String,
        namespace: String,
        message: String,
    },

    #[error("error creating task: {0}")]
    CreateTask(String),

    #[error("error creating process spec: {0}")]
    ProcessSpec(String),

    #[error("error creating process: {0}")]
    ExecProcess(String),

    #[error("error waiting for process: {0}")]
    WaitProcess(String),

    #[error("error starting process: {0}")]
    StartProcess(String),

    #[error("error deleting task: {0}")]
    DeleteTask(String),

    #[error("error deleting container: {0}")]
    DeleteContainer(String),

    #[error("error collecting stats: {0}")]
    Stats(String),
}

/// The container exited with a non-zero code.
///
/// `stderr` is populated only by `output()` when the library owned the
/// stderr capture buffer.
#[derive(Debug, Error)]
#[error("exit status {code}")]
pub struct ExitError {
    /// Exit code reported by the runtime.
    pub code: i64,
    /// Captured stderr, when the library allocated the buffer.
    pub stderr: Option<Vec<u8>>,
}

impl ExitError {
    pub fn new(code: i64) -> Self {
        Self { code, stderr: None }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_error_display() {
        let err = ExitError::new(2);
        assert_eq!(err.to_string(), "exit status 2");
    }

    #[test]
    fn transport_errors_carry_stage_prefix() {
        let err = Error::CreateTask("socket closed".to_string());
        assert!(err.to_string().starts_with("error creating task"));

        let err = Error::GetImage {
            name: "alpine:3".to_string(),
            namespace: "work".to_string(),
            message: "not found".to_string(),
        };
        assert!(err.to_string().contains("alpine:3"));
        assert!(err.to_string().contains("work"));
    }

    #[test]
    fn exit_error_converts_into_error() {
        let err: Error = ExitError::new(1).into();
        assert!(matches!(err, Error::Exit(ExitError { code: 1, .. })));
    }
}
