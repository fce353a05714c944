//! API error taxonomy and retry classification.

use std::sync::OnceLock;

use regex::Regex;

/// Default retry-after when the server declares a rate limit without a
/// usable duration.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    RateLimit,
    Server,
    Network,
    Auth,
    InvalidRequest,
    Parse,
    Unknown,
}

/// A classified upstream error.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    pub status: Option<u16>,
    /// Server-declared delay for rate limits, in seconds.
    pub retry_after: Option<u64>,
}

impl ApiError {
    /// Classify an upstream failure from its status code, error message
    /// and (for 429s) the `retry-after` header.
    pub fn from_response(message: &str, status: u16, retry_after_header: Option<&str>) -> Self {
        let mut error = Self {
            kind: ApiErrorKind::Unknown,
            message: message.to_owned(),
            status: (status != 0).then_some(status),
            retry_after: None,
        };

        if status == 429 || message.contains("rate limit") {
            error.kind = ApiErrorKind::RateLimit;
            error.retry_after = Some(
                retry_after_header
                    .and_then(|h| h.trim().parse().ok())
                    .or_else(|| retry_after_from_message(message))
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
            );
        } else if message.contains("Overloaded") {
            error.kind = ApiErrorKind::Server;
        } else if status == 401 {
            error.kind = ApiErrorKind::Auth;
        } else if status >= 500 {
            error.kind = ApiErrorKind::Server;
        } else if status >= 400 {
            error.kind = ApiErrorKind::InvalidRequest;
        } else if message.contains("network error") || message.contains("connection") {
            error.kind = ApiErrorKind::Network;
        } else if message.contains("JSON parse error") {
            error.kind = ApiErrorKind::Parse;
        }

        error
    }

    /// Whether a retry can plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::RateLimit | ApiErrorKind::Server | ApiErrorKind::Network
        )
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Extract "retry after N seconds" from an error message body.
fn retry_after_from_message(message: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"retry after (\d+) seconds").unwrap());
    re.captures(message)?.get(1)?.as_str().parse().ok()
}
