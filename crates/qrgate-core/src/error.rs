//! Error types for QRGate

use thiserror::Error;

/// Main error type for handshake operations
///
/// Every variant maps to a stable message key that the UI can localize;
/// the formatted text is only meant for logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The creation request failed before reaching the issuer or was refused
    #[error("Network error: {0}")]
    Network(String),

    /// The creation request did not resolve in time and was cancelled
    #[error("Session creation timed out after {0} ms")]
    CreationTimeout(u64),

    #[error("Channel connection error: {0}")]
    Connection(String),

    /// Malformed or out-of-sequence channel traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Missing or structurally invalid credential
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Session already completed")]
    AlreadyCompleted,

    #[error("Session is in a terminal state")]
    TerminalState,

    #[error("Session not found")]
    NotFound,

    #[error("Session capacity exhausted")]
    Resource,
}

/// Result type alias using QRGate's Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Message key shown to the user for this error
    pub fn message_key(&self) -> &'static str {
        match self {
            Error::Network(_) => "qr_generation_failed",
            Error::CreationTimeout(_) => "qr_request_timed_out",
            Error::Connection(_) => "websocket_connection_failed",
            Error::Protocol(_) => "websocket_error",
            Error::Auth(_) => "qr_auth_missing_session",
            // Issuer-side failures are shown as a generic failure; the client
            // never retries a specific token after them.
            Error::AlreadyCompleted
            | Error::TerminalState
            | Error::NotFound
            | Error::Resource => "failed_to_generate_qr",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::CreationTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_has_specific_message() {
        let err = Error::CreationTimeout(5000);
        assert!(err.is_timeout());
        assert_eq!(err.message_key(), "qr_request_timed_out");
        assert_ne!(
            err.message_key(),
            Error::Network("refused".into()).message_key()
        );
    }

    #[test]
    fn test_issuer_errors_collapse() {
        assert_eq!(Error::NotFound.message_key(), Error::Resource.message_key());
        assert_eq!(
            Error::TerminalState.message_key(),
            Error::AlreadyCompleted.message_key()
        );
    }
}
