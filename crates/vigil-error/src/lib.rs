#![warn(missing_docs)]

//! Typed error types for the collaborators Vigil consumes.
//!
//! Provides [`IpfsError`] for IPFS directory fetches and [`TransportError`]
//! for the blocking HTTP transport behind the `HttpClient` capability.

use thiserror::Error;

/// Errors from fetching a file out of an IPFS directory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IpfsError {
    /// The IPFS gateway answered with a non-success HTTP status.
    #[error("ipfs gateway returned HTTP {status}")]
    Http {
        /// The HTTP status code returned by the gateway.
        status: u16,
    },

    /// The IPFS gateway answered successfully but with an empty body.
    #[error("ipfs gateway returned an empty response")]
    EmptyResponse,

    /// The request never produced a response (DNS, connect, TLS, timeout).
    #[error("ipfs transport failure: {0}")]
    Transport(String),
}

impl IpfsError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Http { .. } => "IPFS_HTTP_ERROR",
            Self::EmptyResponse => "IPFS_EMPTY_RESPONSE",
            Self::Transport(_) => "IPFS_TRANSPORT_ERROR",
        }
    }

    /// Whether this error means "the file is not there" rather than a failure.
    ///
    /// Scripts see such errors as an absent value instead of an exception.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404 } | Self::EmptyResponse)
    }
}

/// Errors from the blocking HTTP transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The request could not be built (bad URL, bad method, bad header).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request timed out.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The request failed before a response was received.
    #[error("request failed: {0}")]
    Request(String),

    /// The response body could not be read as text.
    #[error("failed to read response body: {0}")]
    Body(String),
}

impl TransportError {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Request(_) => "REQUEST_FAILED",
            Self::Body(_) => "BODY_UNREADABLE",
        }
    }

    /// Returns whether retrying the same request could succeed.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Request(_) => true,
            Self::InvalidRequest(_) | Self::Body(_) => false,
        }
    }

    /// Convert to a structured JSON error object.
    pub fn to_structured_error(&self) -> serde_json::Value {
        serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_covers_404_and_empty_body() {
        assert!(IpfsError::Http { status: 404 }.is_not_found());
        assert!(IpfsError::EmptyResponse.is_not_found());
        assert!(!IpfsError::Http { status: 502 }.is_not_found());
        assert!(!IpfsError::Transport("connection refused".into()).is_not_found());
    }

    #[test]
    fn ipfs_codes_are_stable() {
        assert_eq!(IpfsError::Http { status: 500 }.code(), "IPFS_HTTP_ERROR");
        assert_eq!(IpfsError::EmptyResponse.code(), "IPFS_EMPTY_RESPONSE");
        assert_eq!(
            IpfsError::Transport("x".into()).code(),
            "IPFS_TRANSPORT_ERROR"
        );
    }

    #[test]
    fn transport_structured_error_has_required_fields() {
        let err = TransportError::Timeout { timeout_ms: 1500 };
        let json = err.to_structured_error();
        assert_eq!(json["error"], true);
        assert_eq!(json["code"], "TIMEOUT");
        assert_eq!(json["retryable"], true);
        assert!(json["message"].as_str().unwrap().contains("1500ms"));
    }

    #[test]
    fn invalid_request_is_not_retryable() {
        assert!(!TransportError::InvalidRequest("bad url".into()).retryable());
        assert!(TransportError::Request("reset".into()).retryable());
    }
}
