//! Buffered run/output helpers shared by every worker

use tracing::debug;

use crate::error::RunError;
use crate::result::{CommandOutput, split_lines};
use crate::stream::OutputBuffer;
use crate::traits::CmdWorker;

/// Start `worker`, wait for it and return its combined output as lines
///
/// stdout and stderr share one buffer unless the caller already bound
/// them. The trailing line terminator is trimmed.
///
/// # Errors
/// Returns the worker's start error, or its wait error which carries the
/// captured output when the command failed
pub async fn run<W>(worker: &mut W) -> Result<Vec<String>, RunError>
where
    W: CmdWorker + ?Sized,
{
    let buffer = OutputBuffer::new();

    if !worker.has_stdout() {
        worker.set_stdout(Box::new(buffer.clone()));
    }
    if !worker.has_stderr() {
        worker.set_stderr(Box::new(buffer.clone()));
    }

    worker.start().await?;
    worker.wait().await?;

    let lines = split_lines(&buffer.take());
    debug!(command = %worker.command_line(), lines = lines.len(), "run finished");

    Ok(lines)
}

/// Start `worker`, wait for it and return stdout and stderr separately
///
/// A stream the caller already bound is left alone and comes back empty.
///
/// # Errors
/// Same as [`run`]
pub async fn output<W>(worker: &mut W) -> Result<CommandOutput, RunError>
where
    W: CmdWorker + ?Sized,
{
    let stdout = OutputBuffer::new();
    let stderr = OutputBuffer::new();

    if !worker.has_stdout() {
        worker.set_stdout(Box::new(stdout.clone()));
    }
    if !worker.has_stderr() {
        worker.set_stderr(Box::new(stderr.clone()));
    }

    worker.start().await?;
    worker.wait().await?;

    Ok(CommandOutput {
        stdout: stdout.take(),
        stderr: stderr.take(),
    })
}
