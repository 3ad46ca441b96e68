//! Result types for command execution

use serde::{Deserialize, Serialize};

/// Separately captured output of a command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// stdout bytes
    pub stdout: Vec<u8>,
    /// stderr bytes
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// stdout decoded as UTF-8, lossily
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stderr decoded as UTF-8, lossily
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout split into lines
    #[must_use]
    pub fn stdout_lines(&self) -> Vec<String> {
        split_lines(&self.stdout)
    }
}

/// Split captured output into lines
///
/// A single trailing `\n` is dropped so `"a\nb\n"` yields `["a", "b"]`.
/// Empty output yields no lines.
pub fn split_lines(output: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(output);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    if text.is_empty() {
        return Vec::new();
    }

    text.split('\n').map(ToString::to_string).collect()
}
