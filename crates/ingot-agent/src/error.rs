use std::{io, time::Duration};

use ingot_process::{ErrorCode, Outcome, Severity};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RconError {
    #[error("rcon authentication rejected")]
    AuthRejected,

    #[error("rcon transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("rcon protocol violation: {0}")]
    Malformed(String),

    #[error("rcon command too long ({0} bytes)")]
    CommandTooLong(usize),

    #[error("no rcon response within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{0}")]
    Configuration(String),

    #[error("instance '{0}' is already managed")]
    AlreadyManaged(String),

    #[error("instance '{0}' is not managed (already stopped)")]
    NotManaged(String),

    #[error("instance '{name}' still alive after {waited:?}")]
    StopTimeout { name: String, waited: Duration },

    #[error("rcon error: {0}")]
    Protocol(String),

    #[error("rcon timed out after {0:?}")]
    ProtocolTimeout(Duration),

    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn fs(context: impl Into<String>, source: io::Error) -> Self {
        Self::Filesystem {
            context: context.into(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::Configuration(_) => ErrorCode::Configuration,
            SupervisorError::AlreadyManaged(_) => ErrorCode::AlreadyManaged,
            SupervisorError::NotManaged(_) => ErrorCode::NotManaged,
            SupervisorError::StopTimeout { .. } => ErrorCode::StopTimeout,
            SupervisorError::Protocol(_) => ErrorCode::Protocol,
            SupervisorError::ProtocolTimeout(_) => ErrorCode::ProtocolTimeout,
            SupervisorError::Filesystem { .. } => ErrorCode::Filesystem,
        }
    }

    /// Benign conditions are warnings so callers can branch on severity.
    pub fn severity(&self) -> Severity {
        match self {
            SupervisorError::NotManaged(_) | SupervisorError::StopTimeout { .. } => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }

    pub fn to_outcome(&self) -> Outcome {
        let message = self.to_string();
        match self.severity() {
            Severity::Warning => Outcome::warning(self.code(), message),
            _ => Outcome::error(self.code(), message),
        }
    }
}

impl From<RconError> for SupervisorError {
    fn from(value: RconError) -> Self {
        match value {
            RconError::Timeout(d) => SupervisorError::ProtocolTimeout(d),
            other => SupervisorError::Protocol(other.to_string()),
        }
    }
}
