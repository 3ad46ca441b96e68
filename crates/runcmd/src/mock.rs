//! Mock runner for testing code that depends on [`Runner`]

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{RunError, StreamKind};
use crate::stream::claim_pipe;
use crate::traits::{CmdWorker, Runner, Sink, Source};

/// Callback invoked with every worker a [`MockRunner`] creates
pub type OnCommand = Arc<dyn Fn(&mut MockWorker) + Send + Sync>;

/// Runner returning canned output instead of executing anything
#[derive(Clone, Default)]
pub struct MockRunner {
    /// Bytes written to the stdout sink
    pub stdout: Vec<u8>,
    /// Bytes written to the stderr sink
    pub stderr: Vec<u8>,
    /// Error returned by `start`/`wait`
    pub error: Option<RunError>,
    /// Called on each new worker so tests can inspect or alter it
    pub on_command: Option<OnCommand>,
}

impl std::fmt::Debug for MockRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRunner")
            .field("stdout", &String::from_utf8_lossy(&self.stdout))
            .field("stderr", &String::from_utf8_lossy(&self.stderr))
            .field("error", &self.error)
            .field("on_command", &self.on_command.is_some())
            .finish()
    }
}

impl MockRunner {
    /// Create a runner with empty output and no error
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set mocked stdout
    #[must_use]
    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Set mocked stderr
    #[must_use]
    pub fn with_stderr(mut self, stderr: impl Into<Vec<u8>>) -> Self {
        self.stderr = stderr.into();
        self
    }

    /// Fail every command with `error`
    #[must_use]
    pub fn with_error(mut self, error: RunError) -> Self {
        self.error = Some(error);
        self
    }

    /// Register a callback for new workers
    #[must_use]
    pub fn on_command(mut self, callback: impl Fn(&mut MockWorker) + Send + Sync + 'static) -> Self {
        self.on_command = Some(Arc::new(callback));
        self
    }

    /// Create a concrete mock worker
    #[must_use]
    pub fn worker(&self, name: &str, args: &[&str]) -> MockWorker {
        let mut worker = MockWorker {
            args: std::iter::once(name)
                .chain(args.iter().copied())
                .map(str::to_string)
                .collect(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            error: self.error.clone(),
            stdin_source: None,
            stdout_sink: None,
            stderr_sink: None,
            stdin_taken: false,
            stdout_taken: false,
            stderr_taken: false,
            stream_error: None,
            started: false,
        };

        if let Some(callback) = &self.on_command {
            callback(&mut worker);
        }

        worker
    }
}

impl Runner for MockRunner {
    fn command(&self, name: &str, args: &[&str]) -> Result<Box<dyn CmdWorker>, RunError> {
        Ok(Box::new(self.worker(name, args)))
    }

    fn runner_type(&self) -> &'static str {
        "mock"
    }
}

/// Worker created by [`MockRunner`]
pub struct MockWorker {
    /// Argument vector, command name first
    pub args: Vec<String>,
    /// Bytes written to the stdout sink
    pub stdout: Vec<u8>,
    /// Bytes written to the stderr sink
    pub stderr: Vec<u8>,
    /// Error returned by `start`/`wait`
    pub error: Option<RunError>,
    stdin_source: Option<Source>,
    stdout_sink: Option<Sink>,
    stderr_sink: Option<Sink>,
    stdin_taken: bool,
    stdout_taken: bool,
    stderr_taken: bool,
    stream_error: Option<RunError>,
    started: bool,
}

impl std::fmt::Debug for MockWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWorker")
            .field("args", &self.args)
            .field("error", &self.error)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl MockWorker {
    async fn communicate(&mut self) -> Result<(), RunError> {
        if let Some(mut source) = self.stdin_source.take() {
            let mut discard = Vec::new();
            source
                .read_to_end(&mut discard)
                .await
                .map_err(|e| RunError::stream(StreamKind::Stdin, e))?;
        }

        if let Some(mut sink) = self.stdout_sink.take() {
            write_all(&mut sink, &self.stdout)
                .await
                .map_err(|e| RunError::stream(StreamKind::Stdout, e))?;
        }

        if let Some(mut sink) = self.stderr_sink.take() {
            write_all(&mut sink, &self.stderr)
                .await
                .map_err(|e| RunError::stream(StreamKind::Stderr, e))?;
        }

        Ok(())
    }

    fn result(&self) -> Result<(), RunError> {
        if let Some(e) = &self.stream_error {
            return Err(e.clone());
        }
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

async fn write_all(sink: &mut Sink, bytes: &[u8]) -> std::io::Result<()> {
    sink.write_all(bytes).await?;
    sink.flush().await
}

#[async_trait]
impl CmdWorker for MockWorker {
    async fn start(&mut self) -> Result<(), RunError> {
        if self.started {
            return Err(RunError::AlreadyStarted);
        }
        self.started = true;

        debug!(command = %self.command_line(), "mock command started");

        if let Err(e) = self.communicate().await {
            self.stream_error = Some(e);
        }
        self.result()
    }

    async fn wait(&mut self) -> Result<(), RunError> {
        if !self.started {
            return Err(RunError::NotStarted);
        }
        self.result()
    }

    fn stdin_pipe(&mut self) -> Result<Sink, RunError> {
        let bound = self.stdin_taken || self.stdin_source.is_some();
        claim_pipe(StreamKind::Stdin, self.started, bound)?;
        self.stdin_taken = true;
        Ok(Box::new(tokio::io::sink()))
    }

    fn stdout_pipe(&mut self) -> Result<Source, RunError> {
        claim_pipe(StreamKind::Stdout, self.started, self.has_stdout())?;
        self.stdout_taken = true;
        Ok(Box::new(Cursor::new(self.stdout.clone())))
    }

    fn stderr_pipe(&mut self) -> Result<Source, RunError> {
        claim_pipe(StreamKind::Stderr, self.started, self.has_stderr())?;
        self.stderr_taken = true;
        Ok(Box::new(Cursor::new(self.stderr.clone())))
    }

    fn set_stdin(&mut self, source: Source) {
        self.stdin_source = Some(source);
    }

    fn set_stdout(&mut self, sink: Sink) {
        self.stdout_sink = Some(sink);
    }

    fn set_stderr(&mut self, sink: Sink) {
        self.stderr_sink = Some(sink);
    }

    fn has_stdout(&self) -> bool {
        self.stdout_taken || self.stdout_sink.is_some()
    }

    fn has_stderr(&self) -> bool {
        self.stderr_taken || self.stderr_sink.is_some()
    }

    fn args(&self) -> &[String] {
        &self.args
    }

    fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::stream::OutputBuffer;

    #[tokio::test]
    async fn test_returns_stdout_and_stderr() {
        let runner = MockRunner::new()
            .with_stdout("some stdout")
            .with_stderr("some stderr");

        let mut command = runner.command("test", &[]).unwrap();
        let output = command.output().await.unwrap();

        assert_eq!(output.stdout, b"some stdout");
        assert_eq!(output.stderr, b"some stderr");
    }

    #[tokio::test]
    async fn test_reads_input_stream() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"hello").await.unwrap();
        drop(writer);

        let mut command = MockRunner::new().command("test", &[]).unwrap();
        command.set_stdin(Box::new(reader));

        command.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_output_streams() {
        let runner = MockRunner::new()
            .with_stdout("some stdout")
            .with_stderr("some stderr");
        let stdout = OutputBuffer::new();
        let stderr = OutputBuffer::new();

        let mut command = runner.command("test", &[]).unwrap();
        command.set_stdout(Box::new(stdout.clone()));
        command.set_stderr(Box::new(stderr.clone()));
        command.run().await.unwrap();

        assert_eq!(stdout.contents(), b"some stdout");
        assert_eq!(stderr.contents(), b"some stderr");
    }

    #[tokio::test]
    async fn test_returns_configured_error() {
        let runner = MockRunner::new().with_error(RunError::ConfigError("test error".to_string()));

        let mut command = runner.command("test", &[]).unwrap();
        let err = command.run().await.unwrap_err();

        assert!(matches!(err, RunError::ConfigError(msg) if msg == "test error"));
    }

    #[tokio::test]
    async fn test_run_splits_lines() {
        let runner = MockRunner::new().with_stdout("one\ntwo\n");

        let lines = runner.command("ls", &[]).unwrap().run().await.unwrap();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_pipes_return_configured_bytes() {
        let mut command = MockRunner::new().with_stdout("piped").worker("cat", &[]);

        let mut pipe = command.stdout_pipe().unwrap();
        let mut stdin = command.stdin_pipe().unwrap();
        stdin.write_all(b"ignored").await.unwrap();

        let mut read = String::new();
        pipe.read_to_string(&mut read).await.unwrap();
        assert_eq!(read, "piped");
        assert!(command.has_stdout());
    }

    #[tokio::test]
    async fn test_pipe_requested_after_start() {
        let mut command = MockRunner::new().worker("test", &[]);
        command.start().await.unwrap();

        assert!(matches!(command.stdin_pipe(), Err(RunError::PipeError(_))));
        assert!(matches!(command.stdout_pipe(), Err(RunError::PipeError(_))));
        assert!(matches!(command.stderr_pipe(), Err(RunError::PipeError(_))));
    }

    #[test]
    fn test_pipe_requested_twice() {
        let mut command = MockRunner::new().worker("test", &[]);

        let _stdin = command.stdin_pipe().unwrap();
        let _stderr = command.stderr_pipe().unwrap();
        assert!(matches!(command.stdin_pipe(), Err(RunError::PipeError(_))));
        assert!(matches!(command.stderr_pipe(), Err(RunError::PipeError(_))));

        command.set_stdout(Box::new(OutputBuffer::new()));
        assert!(matches!(command.stdout_pipe(), Err(RunError::PipeError(_))));
    }

    #[test]
    fn test_on_command_sees_args() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let runner = MockRunner::new().on_command(move |worker| {
            record.lock().unwrap().push(worker.args.clone());
        });

        let command = runner.command("git", &["status", "--short"]).unwrap();

        assert_eq!(command.args(), ["git", "status", "--short"]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![vec!["git".to_string(), "status".to_string(), "--short".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_on_command_can_alter_worker() {
        let runner = MockRunner::new().on_command(|worker| {
            if worker.args.get(1).map(String::as_str) == Some("fail") {
                worker.error = Some(RunError::InvalidCommand("fail".to_string()));
            }
        });

        assert!(runner.command("x", &["ok"]).unwrap().run().await.is_ok());
        assert!(runner.command("x", &["fail"]).unwrap().run().await.is_err());
    }

    #[tokio::test]
    async fn test_wait_before_start() {
        let mut command = MockRunner::new().worker("test", &[]);

        assert!(matches!(command.wait().await, Err(RunError::NotStarted)));
    }
}
