//! Local command execution using `tokio::process`

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::error::{ExecutionError, ExitFailure, RunError, StreamKind};
use crate::pipe::PipeSlot;
use crate::stream::{Capture, InputBinding, OutputBinding, claim_pipe, drain, join_stream};
use crate::traits::{CmdWorker, Runner, Sink, Source};

/// Local command runner
///
/// Creates workers that spawn processes on the local machine. Arguments are
/// passed as a vector; no shell is involved.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner;

impl LocalRunner {
    /// Create a new local runner
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Runner for LocalRunner {
    fn command(&self, name: &str, args: &[&str]) -> Result<Box<dyn CmdWorker>, RunError> {
        Ok(Box::new(LocalCmd::new(name, args)?))
    }

    fn runner_type(&self) -> &'static str {
        "local"
    }
}

/// A process being prepared or running
struct Running {
    child: Child,
    stdin_pipe: Option<PipeSlot<ChildStdin>>,
    stdin_task: Option<JoinHandle<io::Result<()>>>,
    stdout_pipe: Option<PipeSlot<ChildStdout>>,
    stderr_pipe: Option<PipeSlot<ChildStderr>>,
    drains: Vec<(StreamKind, JoinHandle<io::Result<()>>)>,
}

/// Local command worker
pub struct LocalCmd {
    args: Vec<String>,
    stdin: InputBinding<PipeSlot<ChildStdin>>,
    stdout: OutputBinding<PipeSlot<ChildStdout>>,
    stderr: OutputBinding<PipeSlot<ChildStderr>>,
    started: bool,
    running: Option<Running>,
    capture: Capture,
}

impl std::fmt::Debug for LocalCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCmd")
            .field("args", &self.args)
            .field("started", &self.started)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl LocalCmd {
    /// Create a worker for `name` with `args`
    ///
    /// # Errors
    /// Returns `RunError::InvalidCommand` if `name` is empty
    pub fn new<S: AsRef<str>>(name: &str, args: &[S]) -> Result<Self, RunError> {
        if name.trim().is_empty() {
            return Err(RunError::InvalidCommand("command cannot be empty".to_string()));
        }

        let args = std::iter::once(name.to_string())
            .chain(args.iter().map(|arg| arg.as_ref().to_string()))
            .collect();

        Ok(Self {
            args,
            stdin: InputBinding::Unbound,
            stdout: OutputBinding::Unbound,
            stderr: OutputBinding::Unbound,
            started: false,
            running: None,
            capture: Capture::default(),
        })
    }

    fn spawn(&self) -> Result<Child, RunError> {
        let mut command = Command::new(&self.args[0]);
        command
            .args(&self.args[1..])
            .stdin(stdio(self.stdin.is_bound()))
            .stdout(stdio(self.stdout.is_bound()))
            .stderr(stdio(self.stderr.is_bound()));

        command.spawn().map_err(|e| RunError::SpawnError {
            command: self.command_line(),
            source: Arc::new(e),
        })
    }

    fn close_pending_pipes(&mut self) {
        if let InputBinding::Pipe(slot) = &self.stdin {
            slot.close();
        }
        if let OutputBinding::Pipe(slot) = &self.stdout {
            slot.close();
        }
        if let OutputBinding::Pipe(slot) = &self.stderr {
            slot.close();
        }
    }

    fn failure(&self, failure: ExitFailure, stream_error: Option<RunError>) -> RunError {
        error!(command = %self.command_line(), failure = %failure, "command failed");
        if let Some(e) = &stream_error {
            warn!(command = %self.command_line(), error = %e, "stream failed alongside exit failure");
        }
        ExecutionError::new(failure, self.args.clone(), self.capture.snapshot())
            .with_stream_error(stream_error.as_ref())
            .into()
    }
}

fn stdio(bound: bool) -> Stdio {
    if bound { Stdio::piped() } else { Stdio::null() }
}

fn exit_failure(status: ExitStatus) -> ExitFailure {
    if let Some(code) = status.code() {
        return ExitFailure::Status(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitFailure::Signal(signal.to_string());
        }
    }

    ExitFailure::Signal(status.to_string())
}

#[async_trait]
impl CmdWorker for LocalCmd {
    #[instrument(skip(self), fields(command = %self.command_line()), level = "debug")]
    async fn start(&mut self) -> Result<(), RunError> {
        if self.started {
            return Err(RunError::AlreadyStarted);
        }
        self.started = true;

        debug!("spawning local command");

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.close_pending_pipes();
                return Err(e);
            }
        };

        let mut stdin_pipe = None;
        let mut stdin_task = None;
        match (std::mem::take(&mut self.stdin), child.stdin.take()) {
            (InputBinding::Pipe(slot), Some(stdin)) => {
                slot.open(stdin);
                stdin_pipe = Some(slot);
            }
            (InputBinding::Source(mut source), Some(mut stdin)) => {
                stdin_task = Some(tokio::spawn(async move {
                    tokio::io::copy(&mut source, &mut stdin).await?;
                    stdin.shutdown().await
                }));
            }
            _ => {}
        }

        let mut drains = Vec::new();

        let mut stdout_pipe = None;
        match (std::mem::take(&mut self.stdout), child.stdout.take()) {
            (OutputBinding::Pipe(slot), Some(stdout)) => {
                slot.open(stdout);
                stdout_pipe = Some(slot);
            }
            (OutputBinding::Sink(sink), Some(stdout)) => {
                let task = tokio::spawn(drain(stdout, sink, self.capture.clone()));
                drains.push((StreamKind::Stdout, task));
            }
            _ => {}
        }

        let mut stderr_pipe = None;
        match (std::mem::take(&mut self.stderr), child.stderr.take()) {
            (OutputBinding::Pipe(slot), Some(stderr)) => {
                slot.open(stderr);
                stderr_pipe = Some(slot);
            }
            (OutputBinding::Sink(sink), Some(stderr)) => {
                let task = tokio::spawn(drain(stderr, sink, self.capture.clone()));
                drains.push((StreamKind::Stderr, task));
            }
            _ => {}
        }

        debug!(pid = ?child.id(), "local command started");

        self.running = Some(Running {
            child,
            stdin_pipe,
            stdin_task,
            stdout_pipe,
            stderr_pipe,
            drains,
        });
        Ok(())
    }

    #[instrument(skip(self), fields(command = %self.command_line()), level = "debug")]
    async fn wait(&mut self) -> Result<(), RunError> {
        let Some(mut running) = self.running.take() else {
            return Err(RunError::NotStarted);
        };

        // An open stdin the child is still reading would block exit forever
        if let Some(stdin) = running.stdin_pipe.take() {
            stdin.close();
        }

        let status = running.child.wait().await;

        let mut stream_error = None;
        if let Some(task) = running.stdin_task.take() {
            if task.is_finished() {
                match task.await {
                    Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => {
                        stream_error = Some(RunError::stream(StreamKind::Stdin, e));
                    }
                    Err(e) => {
                        stream_error = Some(RunError::stream(
                            StreamKind::Stdin,
                            io::Error::other(e.to_string()),
                        ));
                    }
                    _ => {}
                }
            } else {
                // Nothing left to feed once the process is gone
                task.abort();
            }
        }

        for (kind, task) in running.drains.drain(..) {
            if let Err(e) = join_stream(kind, task).await {
                stream_error.get_or_insert(e);
            }
        }

        if let Some(slot) = running.stdout_pipe.take() {
            slot.close();
        }
        if let Some(slot) = running.stderr_pipe.take() {
            slot.close();
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => return Err(self.failure(ExitFailure::Wait(Arc::new(e)), stream_error)),
        };
        if !status.success() {
            return Err(self.failure(exit_failure(status), stream_error));
        }

        if let Some(e) = stream_error {
            return Err(e);
        }

        debug!(status = ?status.code(), "command completed");
        Ok(())
    }

    fn stdin_pipe(&mut self) -> Result<Sink, RunError> {
        claim_pipe(StreamKind::Stdin, self.started, self.stdin.is_bound())?;
        let slot = PipeSlot::new();
        let end = slot.end();
        self.stdin = InputBinding::Pipe(slot);
        Ok(Box::new(end))
    }

    fn stdout_pipe(&mut self) -> Result<Source, RunError> {
        claim_pipe(StreamKind::Stdout, self.started, self.stdout.is_bound())?;
        let slot = PipeSlot::new();
        let end = slot.end();
        self.stdout = OutputBinding::Pipe(slot);
        Ok(Box::new(end))
    }

    fn stderr_pipe(&mut self) -> Result<Source, RunError> {
        claim_pipe(StreamKind::Stderr, self.started, self.stderr.is_bound())?;
        let slot = PipeSlot::new();
        let end = slot.end();
        self.stderr = OutputBinding::Pipe(slot);
        Ok(Box::new(end))
    }

    fn set_stdin(&mut self, source: Source) {
        if let InputBinding::Pipe(slot) =
            std::mem::replace(&mut self.stdin, InputBinding::Source(source))
        {
            slot.close();
        }
    }

    fn set_stdout(&mut self, sink: Sink) {
        if let OutputBinding::Pipe(slot) =
            std::mem::replace(&mut self.stdout, OutputBinding::Sink(sink))
        {
            slot.close();
        }
    }

    fn set_stderr(&mut self, sink: Sink) {
        if let OutputBinding::Pipe(slot) =
            std::mem::replace(&mut self.stderr, OutputBinding::Sink(sink))
        {
            slot.close();
        }
    }

    fn has_stdout(&self) -> bool {
        self.stdout.is_bound()
    }

    fn has_stderr(&self) -> bool {
        self.stderr.is_bound()
    }

    fn args(&self) -> &[String] {
        &self.args
    }

    fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

impl Drop for LocalCmd {
    fn drop(&mut self) {
        self.close_pending_pipes();
    }
}
