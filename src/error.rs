//! # Error Handling
//!
//! Error types for the relay and how they're surfaced over HTTP.
//!
//! ## Error Taxonomy:
//! - **Transport**: a client's socket failed; only that client is disconnected
//! - **Protocol**: malformed JSON or an unknown command; logged and answered, never fatal
//! - **MaxClientsExceeded**: connection limit reached; the client gets a close code
//! - **Engine**: push/flush/interrupt on the synthesis engine failed; the pump continues
//! - **Encode**: a frame could not be encoded; that frame is skipped
//! - **Config**: invalid configuration; fatal at startup
//!
//! Only initialization failures propagate out of `main`; everything else is
//! recovered where it happens.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the relay.
///
/// ## Usage Example:
/// ```ignore
/// return Err(RelayError::Protocol("missing command".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// The session registry is full
    MaxClientsExceeded { limit: usize },

    /// Client sent something the relay cannot interpret
    Protocol(String),

    /// Sending to or receiving from a client failed
    Transport(String),

    /// The synthesis engine rejected or failed a call
    Engine(String),

    /// A frame could not be serialized for the wire
    Encode(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// Anything else that should not happen
    Internal(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::MaxClientsExceeded { limit } => {
                write!(f, "Maximum number of clients ({}) reached", limit)
            }
            RelayError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            RelayError::Transport(msg) => write!(f, "Transport error: {}", msg),
            RelayError::Engine(msg) => write!(f, "Engine error: {}", msg),
            RelayError::Encode(msg) => write!(f, "Encode error: {}", msg),
            RelayError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RelayError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    /// Machine-readable code used in JSON error bodies and websocket error notices.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::MaxClientsExceeded { .. } => "max_clients",
            RelayError::Protocol(_) => "protocol_error",
            RelayError::Transport(_) => "transport_error",
            RelayError::Engine(_) => "engine_error",
            RelayError::Encode(_) => "encode_error",
            RelayError::Config(_) => "config_error",
            RelayError::Internal(_) => "internal_error",
        }
    }
}

/// Converts relay errors into HTTP responses for the health/stats endpoints.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "max_clients",
///     "message": "Maximum number of clients (10) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for RelayError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            RelayError::MaxClientsExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Protocol(_) => StatusCode::BAD_REQUEST,
            RelayError::Engine(_) => StatusCode::BAD_GATEWAY,
            RelayError::Transport(_)
            | RelayError::Encode(_)
            | RelayError::Config(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.code(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault.
impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<image::ImageError> for RelayError {
    fn from(err: image::ImageError) -> Self {
        RelayError::Encode(err.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Encode(err.to_string())
    }
}

/// Shorthand for `Result<T, RelayError>`.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::MaxClientsExceeded { limit: 1 };
        assert_eq!(err.to_string(), "Maximum number of clients (1) reached");
        assert_eq!(err.code(), "max_clients");
    }

    #[test]
    fn test_json_error_is_protocol_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: RelayError = parse_err.into();
        assert!(matches!(err, RelayError::Protocol(_)));
    }
}
