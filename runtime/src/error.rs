//! Error taxonomy surfaced to clients as error replies.

use capsules_container_exec::BackendError;
use thiserror::Error;

use crate::protocol::Reply;

#[derive(Debug, Error)]
pub enum WardenError {
    /// The handle was never issued or its container has been destroyed.
    #[error("unknown handle")]
    UnknownHandle,

    /// The container was destroyed while the command was running.
    #[error("execution aborted")]
    ExecutionAborted,

    /// Wrong arity, unknown command or an unusable argument.
    #[error("{0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("internal error: {0}")]
    Backend(#[from] BackendError),
}

impl WardenError {
    pub fn protocol(message: impl Into<String>) -> Self {
        WardenError::Protocol(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        WardenError::Internal(message.into())
    }

    /// Failures of the daemon itself rather than of the request.
    pub fn is_internal(&self) -> bool {
        matches!(self, WardenError::Internal(_) | WardenError::Backend(_))
    }

    pub fn to_reply(&self) -> Reply {
        Reply::error(self.to_string())
    }
}

pub type WardenResult<T> = Result<T, WardenError>;
