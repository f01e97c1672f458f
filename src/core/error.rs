//! Error kinds shared across the core, and the retryable-error classifier
//! the SSH manager uses to decide whether a failed dial is worth another
//! attempt.

use thiserror::Error;

/// A typed error kind, matching the taxonomy the HTTP and WS layers
/// translate into status codes / close codes.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream authentication failed: {0}")]
    UpstreamAuth(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP status code a proxy shim should respond with.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::InvalidInput(_) => 400,
            CoreError::Forbidden(_) => 403,
            CoreError::NotFound(_) => 404,
            CoreError::Unavailable(_) => 503,
            CoreError::UpstreamUnreachable(_)
            | CoreError::UpstreamAuth(_)
            | CoreError::UpstreamTimeout(_)
            | CoreError::UpstreamProtocol(_) => 502,
            CoreError::Internal(_) => 500,
        }
    }

    /// WebSocket close code for connect-time failures.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            CoreError::UpstreamAuth(_) => 4401,
            CoreError::UpstreamTimeout(_) => 4504,
            CoreError::UpstreamUnreachable(_) | CoreError::UpstreamProtocol(_) => 4502,
            _ => 1011,
        }
    }

    /// Detail string truncated for the `{detail:"..."}` JSON body.
    pub fn detail(&self) -> String {
        self.to_string()
    }
}

/// Keywords that mark an SSH/network error as authentication-related and
/// therefore NOT worth retrying.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "auth fail",
    "no supported authentication methods",
    "unable to authenticate",
];

/// Keywords that mark an error as a transient network condition worth
/// retrying (dial, reconnect, health-driven reconnection).
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timed out",
    "timeout",
    "broken pipe",
    "host unreachable",
    "network unreachable",
    "no route to host",
    "eof",
    "temporary failure",
];

/// Classify a lowercased error message as retryable. Authentication
/// failures always win over a retryable-sounding substring: a message
/// like "authentication failed: connection reset" must not retry.
pub fn is_retryable_error(error: &str) -> bool {
    let lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|kw| lower.contains(kw)) {
        return false;
    }

    RETRYABLE_ERRORS.iter().any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_network_errors() {
        assert!(is_retryable_error("Connection refused"));
        assert!(is_retryable_error("dial tcp: i/o timeout"));
        assert!(is_retryable_error("broken pipe"));
    }

    #[test]
    fn auth_errors_are_not_retryable() {
        assert!(!is_retryable_error("Permission denied (publickey)"));
        assert!(!is_retryable_error(
            "authentication failed: connection reset"
        ));
    }

    #[test]
    fn unrecognized_errors_are_not_retryable() {
        assert!(!is_retryable_error("disk full"));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(CoreError::NotFound("x".into()).http_status(), 404);
        assert_eq!(CoreError::UpstreamAuth("x".into()).ws_close_code(), 4401);
        assert_eq!(CoreError::UpstreamTimeout("x".into()).ws_close_code(), 4504);
    }
}
