//! Error types for host operations

use zbackup_core::{ConfigError, PlanError, ScheduleError, SelectionError};
use zbackup_transport::ExecuteError;

#[derive(Debug, thiserror::Error)]
pub enum ZfsError {
    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no source datasets selected, set {property}=true on the datasets you want to back up")]
    NothingSelected { property: String },

    #[error("{dataset} doesn't exist after receive")]
    MissingAfterReceive { dataset: String },

    #[error("unexpected output from {command}: {line:?}")]
    UnexpectedOutput { command: String, line: String },
}

impl From<ScheduleError> for ZfsError {
    fn from(err: ScheduleError) -> Self {
        Self::Config(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ZfsError>;
