use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("{action} failed: {message}")]
    Action {
        action: &'static str,
        message: String,
    },
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("session cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether the underlying browser can no longer be trusted. Fatal
    /// errors force the session out of the pool; everything else leaves it
    /// reusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Launch(_) | SessionError::Protocol(_) | SessionError::Cancelled
        )
    }
}

impl From<tokio::task::JoinError> for SessionError {
    fn from(err: tokio::task::JoinError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}
