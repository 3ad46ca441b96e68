//! runcmd: Command execution abstraction
//!
//! Provides one worker contract for commands executed as local processes or
//! over an authenticated SSH connection

pub mod config;
pub mod deadline;
pub mod error;
pub mod keys;
pub mod local;
pub mod mock;
mod pipe;
pub mod result;
pub mod run;
pub mod ssh;
pub mod stream;
pub mod traits;

pub use config::{ConnectionInfo, Timeouts};
pub use error::{ExecutionError, ExitFailure, RunError, StreamKind};
pub use keys::{Credential, KeyError, KeySource};
pub use local::{LocalCmd, LocalRunner};
pub use mock::{MockRunner, MockWorker};
pub use result::{CommandOutput, split_lines};
pub use ssh::{Remote, RemoteCmd, escape_argument, join_arguments};
pub use stream::OutputBuffer;
pub use traits::{CmdWorker, Runner, Sink, Source};
