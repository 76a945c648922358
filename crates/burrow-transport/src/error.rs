use thiserror::Error;

/// Session errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type SessionResult<T> = Result<T, SessionError>;
