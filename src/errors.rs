use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Request failed validation (missing fields, out-of-range knobs)
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Requested resource does not exist or is not visible to the caller
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// Router exhausted every candidate for the request
    #[error("No model available to serve request for {requested}")]
    NoModelAvailable { requested: String },

    /// Provider returned a non-retriable failure
    #[error("Upstream error from {model}: {message}")]
    Upstream { model: String, message: String },

    /// Provider exceeded the configured dispatch timeout
    #[error("Upstream {model} timed out after {timeout_ms}ms")]
    UpstreamTimeout { model: String, timeout_ms: u64 },

    /// Per-endpoint or per-owner rate limit hit
    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    /// Caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// Invariant violation
    #[error("Internal error: {operation}")]
    Internal { operation: String },
}

/// Machine-readable error kind, recorded in usage analytics and surfaced to
/// the framing layer for HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    NotFound,
    NoModelAvailable,
    UpstreamError,
    UpstreamTimeout,
    RateLimited,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NoModelAvailable => "no_model_available",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidRequest { message: message.into() }
    }

    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    pub fn internal(operation: impl Into<String>) -> Self {
        Error::Internal {
            operation: operation.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::NoModelAvailable { .. } => ErrorKind::NoModelAvailable,
            Error::Upstream { .. } => ErrorKind::UpstreamError,
            Error::UpstreamTimeout { .. } => ErrorKind::UpstreamTimeout,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the router may swallow this error and try the next candidate.
    pub fn is_candidate_retriable(&self) -> bool {
        matches!(self, Error::Upstream { .. } | Error::UpstreamTimeout { .. })
    }
}

/// Type alias for gateway operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(Error::Cancelled.kind().to_string(), "cancelled");
        assert_eq!(
            Error::invalid("bad temperature").kind().to_string(),
            "invalid_request"
        );
        assert_eq!(
            Error::UpstreamTimeout {
                model: "openai/gpt-4o".to_string(),
                timeout_ms: 5000,
            }
            .kind()
            .to_string(),
            "upstream_timeout"
        );
    }

    #[test]
    fn test_candidate_retriability() {
        assert!(Error::Upstream {
            model: "m".to_string(),
            message: "boom".to_string()
        }
        .is_candidate_retriable());
        assert!(Error::UpstreamTimeout {
            model: "m".to_string(),
            timeout_ms: 1,
        }
        .is_candidate_retriable());
        assert!(!Error::Cancelled.is_candidate_retriable());
        assert!(!Error::invalid("nope").is_candidate_retriable());
    }
}
