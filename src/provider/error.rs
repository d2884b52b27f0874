//! Provider error types with retry classification.
//!
//! Distinguishes transient errors (retry with backoff) from permanent ones
//! (fail the task). The executor's retry policy is driven entirely by
//! `is_transient`.

use std::time::Duration;

/// Error from a provider API call.
#[derive(Debug, Clone)]
pub struct ProviderError {
    /// The kind of error.
    pub kind: ProviderErrorKind,
    /// HTTP status code, if applicable.
    pub status_code: Option<u16>,
    /// Error message.
    pub message: String,
    /// Suggested retry delay (from a Retry-After header).
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited,
            status_code: Some(429),
            message: message.into(),
            retry_after,
        }
    }

    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::ServerError,
            status_code: Some(status_code),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn client_error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::ClientError,
            status_code: Some(status_code),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::NetworkError,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::ParseError,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Unsupported capability (e.g. embeddings on a chat-only provider).
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::ClientError,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Whether this error is transient and warrants a retry.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ProviderError::network_error(e.to_string())
        } else if e.is_decode() {
            ProviderError::parse_error(e.to_string())
        } else if let Some(status) = e.status() {
            match classify_http_status(status.as_u16()) {
                ProviderErrorKind::RateLimited => ProviderError::rate_limited(e.to_string(), None),
                ProviderErrorKind::ClientError => {
                    ProviderError::client_error(status.as_u16(), e.to_string())
                }
                _ => ProviderError::server_error(status.as_u16(), e.to_string()),
            }
        } else {
            ProviderError::network_error(e.to_string())
        }
    }
}

/// Classification of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Rate limited (429). Transient.
    RateLimited,
    /// Server error (500, 502, 503, 504, 529). Transient.
    ServerError,
    /// Client error (400, 401, 403, 404). Permanent.
    ClientError,
    /// Connection failed or timed out. Transient.
    NetworkError,
    /// Response did not match the expected shape. Permanent.
    ParseError,
}

impl ProviderErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::ServerError
                | ProviderErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderErrorKind::RateLimited => write!(f, "rate limited"),
            ProviderErrorKind::ServerError => write!(f, "server error"),
            ProviderErrorKind::ClientError => write!(f, "client error"),
            ProviderErrorKind::NetworkError => write!(f, "network error"),
            ProviderErrorKind::ParseError => write!(f, "parse error"),
        }
    }
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimited,
        500 | 502 | 503 | 504 | 529 => ProviderErrorKind::ServerError,
        400..=499 => ProviderErrorKind::ClientError,
        _ => ProviderErrorKind::ServerError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderErrorKind::RateLimited.is_transient());
        assert!(ProviderErrorKind::ServerError.is_transient());
        assert!(ProviderErrorKind::NetworkError.is_transient());
        assert!(!ProviderErrorKind::ClientError.is_transient());
        assert!(!ProviderErrorKind::ParseError.is_transient());
    }

    #[test]
    fn http_status_classification() {
        assert_eq!(classify_http_status(429), ProviderErrorKind::RateLimited);
        assert_eq!(classify_http_status(500), ProviderErrorKind::ServerError);
        assert_eq!(classify_http_status(529), ProviderErrorKind::ServerError);
        assert_eq!(classify_http_status(400), ProviderErrorKind::ClientError);
        assert_eq!(classify_http_status(404), ProviderErrorKind::ClientError);
    }

    #[test]
    fn retry_after_carried_through() {
        let err = ProviderError::rate_limited("slow down", Some(Duration::from_secs(30)));
        assert!(err.is_transient());
        assert_eq!(err.retry_after, Some(Duration::from_secs(30)));
    }
}
