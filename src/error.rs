use thiserror::Error;

/// Reader-wide error type
///
/// The `Display` form of each variant is the human-readable message that is
/// published to the host through [`crate::events::ReaderEvent::Error`].
#[derive(Error, Debug)]
pub enum AppError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("access denied")]
    AccessDenied,

    #[error("stream not found")]
    NotFound,

    /// Error message reported by the server in a 400 response body
    #[error("{0}")]
    ServerReported(String),

    #[error("bad status code {0}")]
    UnexpectedStatus(u16),

    #[error("negotiation setup failed: {0}")]
    NegotiationSetup(String),

    /// Peer connection reached `failed` or `closed` without a local close
    #[error("peer connection closed")]
    TransportTerminated,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("WebRTC error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Map a WHEP status code shared by the offer and trickle endpoints
    ///
    /// Returns `None` for codes that need endpoint-specific handling.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(Self::AuthenticationFailed),
            403 => Some(Self::AccessDenied),
            404 => Some(Self::NotFound),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(AppError::NotFound.to_string(), "stream not found");
        assert_eq!(AppError::UnexpectedStatus(500).to_string(), "bad status code 500");
        assert_eq!(
            AppError::ServerReported("bad offer".to_string()).to_string(),
            "bad offer"
        );
        assert_eq!(AppError::TransportTerminated.to_string(), "peer connection closed");
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            AppError::from_status(401),
            Some(AppError::AuthenticationFailed)
        ));
        assert!(matches!(AppError::from_status(403), Some(AppError::AccessDenied)));
        assert!(matches!(AppError::from_status(404), Some(AppError::NotFound)));
        assert!(AppError::from_status(400).is_none());
        assert!(AppError::from_status(500).is_none());
    }
}
