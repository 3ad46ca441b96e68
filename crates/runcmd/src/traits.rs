//! Runner and worker traits

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RunError;
use crate::result::CommandOutput;

/// Writable end bound to a command's input, or a sink for its output
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Readable source for a command's input, or a pipe from its output
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

/// Creates workers bound to a command
pub trait Runner: Send + Sync {
    /// Create a worker for `name` with `args`
    ///
    /// # Errors
    /// Returns `RunError::InvalidCommand` for an empty command name
    fn command(&self, name: &str, args: &[&str]) -> Result<Box<dyn CmdWorker>, RunError>;

    /// Get runner type name
    fn runner_type(&self) -> &'static str;
}

/// One executable command, local or remote
///
/// A worker is single-use: `start` and `wait` run once. Pipes and sinks
/// must be bound before `start`; pipe handles are valid until `wait`
/// returns.
#[async_trait]
pub trait CmdWorker: Send {
    /// Create the process or session and begin executing
    async fn start(&mut self) -> Result<(), RunError>;

    /// Block until the command terminates
    ///
    /// Closes any still-open stdin pipe first. A non-zero exit becomes
    /// `RunError::Execution` carrying the output captured from bound sinks.
    async fn wait(&mut self) -> Result<(), RunError>;

    /// Run to completion and return combined stdout/stderr split into lines
    async fn run(&mut self) -> Result<Vec<String>, RunError> {
        crate::run::run(self).await
    }

    /// Run to completion and return stdout and stderr separately
    async fn output(&mut self) -> Result<CommandOutput, RunError> {
        crate::run::output(self).await
    }

    /// Writable handle to the command's stdin
    ///
    /// # Errors
    /// Fails when called after `start` or when stdin is already bound
    fn stdin_pipe(&mut self) -> Result<Sink, RunError>;

    /// Readable handle to the command's stdout
    ///
    /// # Errors
    /// Fails when called after `start` or when stdout is already bound
    fn stdout_pipe(&mut self) -> Result<Source, RunError>;

    /// Readable handle to the command's stderr
    ///
    /// # Errors
    /// Fails when called after `start` or when stderr is already bound
    fn stderr_pipe(&mut self) -> Result<Source, RunError>;

    /// Read the command's stdin from `source`
    fn set_stdin(&mut self, source: Source);

    /// Write the command's stdout into `sink`
    fn set_stdout(&mut self, sink: Sink);

    /// Write the command's stderr into `sink`
    fn set_stderr(&mut self, sink: Sink);

    /// Whether stdout is already bound to a sink or pipe
    fn has_stdout(&self) -> bool;

    /// Whether stderr is already bound to a sink or pipe
    fn has_stderr(&self) -> bool;

    /// Original argument vector
    fn args(&self) -> &[String];

    /// Command line as it is executed
    fn command_line(&self) -> String;
}
