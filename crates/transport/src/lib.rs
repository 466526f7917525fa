//! zbackup-transport: command execution
//!
//! Runs chains of external processes locally or over ssh, with readonly
//! (dry-run) support and exit code validation.

pub mod error;
pub mod node;
pub mod pipeline;
pub mod shell;
pub mod ssh;

pub use error::{ExecuteError, ExitCodes};
pub use node::{ExecuteNode, Input, RunOptions, RunOutput, Runner};
pub use pipeline::{CmdItem, CmdPipe, PipeOutcome, PipeReport, StageReport};
pub use shell::{Arg, CmdLine, quote};
pub use ssh::{SshTarget, SshTargetError};
