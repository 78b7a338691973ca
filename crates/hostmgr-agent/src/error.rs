use hostmgr_session::{SessionId, SessionStatus, SlotId};
use tonic::Status;

use crate::error_payload;
use crate::runtime::RuntimeError;

/// Controller failure. [`SessionError::is_permanent`] decides whether the
/// message bus may redeliver the command.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
    #[error("slot {slot} is occupied by session {session}")]
    SlotOccupied { slot: SlotId, session: SessionId },
    #[error("container name {0} is already in use")]
    NameConflict(String),
    #[error("image {image} is unavailable: {message}")]
    ImageUnavailable { image: String, message: String },
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {id} is {status}, not running")]
    NotRunning { id: SessionId, status: SessionStatus },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    pub fn is_permanent(&self) -> bool {
        match self {
            SessionError::DuplicateSession(_)
            | SessionError::SlotOccupied { .. }
            | SessionError::NameConflict(_)
            | SessionError::ImageUnavailable { .. }
            | SessionError::NotFound(_)
            | SessionError::NotRunning { .. }
            | SessionError::Invalid(_) => true,
            SessionError::Runtime(RuntimeError::Api { status, .. }) => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            SessionError::Timeout(_)
            | SessionError::Cancelled
            | SessionError::Runtime(_)
            | SessionError::Io(_)
            | SessionError::Internal(_) => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SessionError::DuplicateSession(_) => "duplicate_session",
            SessionError::SlotOccupied { .. } => "slot_occupied",
            SessionError::NameConflict(_) => "name_conflict",
            SessionError::ImageUnavailable { .. } => "image_unavailable",
            SessionError::NotFound(_) => "session_not_found",
            SessionError::NotRunning { .. } => "session_not_running",
            SessionError::Invalid(_) => "invalid_request",
            SessionError::Timeout(_) => "timeout",
            SessionError::Cancelled => "cancelled",
            SessionError::Runtime(_) => "runtime_error",
            SessionError::Io(_) => "io_error",
            SessionError::Internal(_) => "internal",
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            SessionError::SlotOccupied { .. } | SessionError::NameConflict(_) => {
                Some("Resend the start command with force=true to replace it.".to_string())
            }
            SessionError::ImageUnavailable { .. } => {
                Some("Check the image reference and registry credentials.".to_string())
            }
            _ => None,
        }
    }

    pub fn to_status(&self) -> Status {
        let message = error_payload::encode(self.code(), self.to_string(), !self.is_permanent(), self.hint());
        match self {
            SessionError::DuplicateSession(_) | SessionError::NameConflict(_) => {
                Status::already_exists(message)
            }
            SessionError::SlotOccupied { .. } | SessionError::NotRunning { .. } => {
                Status::failed_precondition(message)
            }
            SessionError::ImageUnavailable { .. } | SessionError::Invalid(_) => {
                Status::invalid_argument(message)
            }
            SessionError::NotFound(_) => Status::not_found(message),
            SessionError::Timeout(_) => Status::deadline_exceeded(message),
            SessionError::Cancelled => Status::cancelled(message),
            SessionError::Runtime(_) if self.is_permanent() => {
                Status::failed_precondition(message)
            }
            SessionError::Runtime(_) => Status::unavailable(message),
            SessionError::Io(_) | SessionError::Internal(_) => Status::internal(message),
        }
    }
}

impl From<SessionError> for Status {
    fn from(value: SessionError) -> Self {
        value.to_status()
    }
}
