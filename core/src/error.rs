use thiserror::Error;

use crate::simple_id::SimpleId;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn `{command}`: {error}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },
    #[error("no tracked process matches `{reference}`")]
    NotFound { reference: String },
    #[error("process {simple_id} is not interactive")]
    NotInteractive { simple_id: SimpleId },
    #[error("process {simple_id} (pid {pid}) did not exit after forced termination")]
    TerminateTimeout { simple_id: SimpleId, pid: u32 },
    #[error("log I/O failed: {error}")]
    Io {
        #[from]
        #[source]
        error: std::io::Error,
    },
}

impl SupervisorError {
    pub(crate) fn spawn(command: impl Into<String>, error: std::io::Error) -> Self {
        Self::Spawn {
            command: command.into(),
            error,
        }
    }

    pub(crate) fn not_found(reference: impl Into<String>) -> Self {
        Self::NotFound {
            reference: reference.into(),
        }
    }
}
