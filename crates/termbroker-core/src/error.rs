use std::fmt;
use thiserror::Error;

/// Stable error categories. Callers branch on these, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad session id, name, size or path.
    Validation,
    /// Unknown session.
    NotFound,
    /// Executable resolution or OS spawn failure.
    Spawn,
    /// Malformed or unknown wire frame.
    Protocol,
    /// Filesystem failure while reading or writing session state.
    Persistence,
    /// Signal delivery failure.
    Process,
    /// A deadline elapsed (request, connect, exit wait).
    Timeout,
    /// Control socket connect/send failure.
    Connection,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Spawn => "SPAWN_FAILED",
            ErrorKind::Protocol => "PROTOCOL_ERROR",
            ErrorKind::Persistence => "PERSISTENCE_ERROR",
            ErrorKind::Process => "PROCESS_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Connection => "CONNECTION_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// The single error type surfaced by every termbroker component.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct BrokerError {
    kind: ErrorKind,
    message: String,
    session_id: Option<String>,
}

impl BrokerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session_id: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(session_id: impl Into<String>) -> Self {
        let id = session_id.into();
        Self::new(ErrorKind::NotFound, format!("session not found: {id}")).with_session(id)
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Spawn, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Process, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    /// Attach the originating session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::protocol(format!("json: {e}"))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_and_session_attached() {
        let err = BrokerError::not_found("abc");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.session_id(), Some("abc"));
        assert_eq!(err.to_string(), "NOT_FOUND: session not found: abc");
    }

    #[test]
    fn with_session_overrides() {
        let err = BrokerError::spawn("no such file").with_session("s1");
        assert_eq!(err.session_id(), Some("s1"));
        assert_eq!(err.message(), "no such file");
    }
}
