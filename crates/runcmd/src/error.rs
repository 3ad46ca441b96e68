//! Error types for runcmd

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while building, starting or waiting on a command
#[derive(Error, Debug, Clone)]
pub enum RunError {
    /// Empty or malformed command
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Connection establishment timed out
    #[error("connection timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Process spawn error
    #[error("failed to spawn `{command}`: {source}")]
    SpawnError {
        /// Command line that could not be spawned
        command: String,
        /// Underlying OS error
        #[source]
        source: Arc<io::Error>,
    },

    /// Remote session could not be opened or the command not dispatched
    #[error("can't create ssh session: {0}")]
    SessionError(String),

    /// `start` called on a worker that was already started
    #[error("command already started")]
    AlreadyStarted,

    /// `wait` called on a worker that is not running
    #[error("command not started")]
    NotStarted,

    /// Pipe requested at the wrong time or for a stream already bound
    #[error("pipe error: {0}")]
    PipeError(String),

    /// Command ran and failed
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Remote session close failed after an otherwise successful command
    #[error("can't close ssh session: {0}")]
    SessionClose(String),

    /// Reading or writing one of the command's streams failed
    #[error("I/O error on {stream}: {source}")]
    Stream {
        /// Stream that failed
        stream: StreamKind,
        /// Underlying I/O error
        #[source]
        source: Arc<io::Error>,
    },
}

impl RunError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RunError::ConnectionFailed(_) | RunError::Timeout { .. }
        )
    }

    /// Exit code of the failed command, if the error carries one
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunError::Execution(err) => err.exit_code(),
            _ => None,
        }
    }

    pub(crate) fn stream(stream: StreamKind, source: io::Error) -> Self {
        RunError::Stream {
            stream,
            source: Arc::new(source),
        }
    }
}

/// One of the three standard streams of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard input
    Stdin,
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Stdin => "stdin",
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        })
    }
}

/// Why a process or remote session did not finish cleanly
#[derive(Error, Debug, Clone)]
pub enum ExitFailure {
    /// Non-zero exit status
    #[error("exit status {0}")]
    Status(i32),

    /// Terminated by a signal
    #[error("terminated by signal {0}")]
    Signal(String),

    /// Remote session closed without reporting an exit status
    #[error("session closed without exit status")]
    MissingStatus,

    /// Transport failed while the command was running
    #[error("transport error: {0}")]
    Transport(String),

    /// Waiting on the local process failed
    #[error("wait failed: {0}")]
    Wait(#[source] Arc<io::Error>),
}

impl ExitFailure {
    /// Exit code, when the failure is a plain non-zero exit
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitFailure::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// A failed command together with whatever output it produced
///
/// Rendered as "`<command>` failed: <failure>", with any captured output
/// appended after the primary message.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    failure: ExitFailure,
    args: Vec<String>,
    output: Vec<u8>,
    close_error: Option<String>,
    stream_error: Option<String>,
}

impl ExecutionError {
    /// Create a new execution error
    pub fn new(failure: ExitFailure, args: Vec<String>, output: Vec<u8>) -> Self {
        Self {
            failure,
            args,
            output,
            close_error: None,
            stream_error: None,
        }
    }

    /// Merge a session teardown failure into this error
    #[must_use]
    pub fn with_close_error(mut self, close_error: Option<String>) -> Self {
        self.close_error = close_error;
        self
    }

    /// Attach an output or input stream failure seen alongside the exit failure
    #[must_use]
    pub fn with_stream_error(mut self, stream_error: Option<&RunError>) -> Self {
        self.stream_error = stream_error.map(ToString::to_string);
        self
    }

    /// Underlying exit or transport failure
    pub fn failure(&self) -> &ExitFailure {
        &self.failure
    }

    /// Argument vector of the failed command
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Argument vector joined with spaces
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }

    /// Captured stdout/stderr bytes
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Captured output decoded as UTF-8, lossily
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    /// Session close failure merged into this error, if any
    pub fn close_error(&self) -> Option<&str> {
        self.close_error.as_deref()
    }

    /// Stream failure attached to this error, if any
    pub fn stream_error(&self) -> Option<&str> {
        self.stream_error.as_deref()
    }

    /// Exit code of the failed command
    pub fn exit_code(&self) -> Option<i32> {
        self.failure.code()
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` failed: {}", self.command_line(), self.failure)?;

        if let Some(close_error) = &self.close_error {
            write!(f, "; can't close ssh session: {close_error}")?;
        }

        if let Some(stream_error) = &self.stream_error {
            write!(f, "; {stream_error}")?;
        }

        let output = self.output_lossy();
        if !output.trim().is_empty() {
            write!(f, ", output:\n{}", output.trim_end_matches('\n'))?;
        }

        Ok(())
    }
}

impl std::error::Error for ExecutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.failure)
    }
}
