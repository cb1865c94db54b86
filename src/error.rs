use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid stream definition: {0}")]
    Validation(String),
    #[error("stream {0} not found")]
    NotFound(String),
    #[error("stream {0} is already running")]
    AlreadyRunning(String),
    #[error("stream {0} is not running")]
    NotRunning(String),
    #[error("stream {0} is busy with another control operation")]
    Busy(String),
    #[error("failed to launch transcoder for stream {id}: {reason}")]
    LaunchFailure { id: String, reason: String },
    #[error("transcoder for stream {id} (pid {pid}) did not exit after forced termination")]
    TerminationTimeout { id: String, pid: u32 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SupervisorError {
    pub fn launch<T: ToString>(id: &str, reason: T) -> Self {
        SupervisorError::LaunchFailure {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// 对外暴露的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::Validation(_) => "validation",
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::AlreadyRunning(_) => "already_running",
            SupervisorError::NotRunning(_) => "not_running",
            SupervisorError::Busy(_) => "busy",
            SupervisorError::LaunchFailure { .. } => "launch_failure",
            SupervisorError::TerminationTimeout { .. } => "termination_timeout",
            SupervisorError::Store(_) => "store",
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
