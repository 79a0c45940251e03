use thiserror::Error;

/// Errors surfaced by the realtime session layer.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Credential fetch, signalling or transport establishment failed.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A network step did not finish within its upper bound.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// An inbound message could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Microphone or output device unavailable.
    #[error("Media error: {0}")]
    Media(String),

    /// The caller asked for something the current state does not allow.
    #[error("Invalid operation: {0}")]
    Misuse(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The task owning the session has stopped.
    #[error("Session client closed")]
    ClientClosed,
}

impl RealtimeError {
    /// Whether this error belongs to the connection-failure class.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for RealtimeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::Connection(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RealtimeError::Connection("credential endpoint returned 500".to_string());
        assert_eq!(
            err.to_string(),
            "Connection failed: credential endpoint returned 500"
        );
        assert_eq!(RealtimeError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_connection_failure_class() {
        assert!(RealtimeError::Timeout("signalling".into()).is_connection_failure());
        assert!(RealtimeError::Connection("x".into()).is_connection_failure());
        assert!(!RealtimeError::Misuse("x".into()).is_connection_failure());
        assert!(!RealtimeError::Media("x".into()).is_connection_failure());
    }

    #[test]
    fn test_from_serde_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RealtimeError = parse_err.into();
        assert!(matches!(err, RealtimeError::Serialization(_)));
    }
}
