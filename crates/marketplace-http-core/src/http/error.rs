//! HTTP error classification
//!
//! Maps a response status (or a transport failure) to one of five error
//! kinds plus kind-specific metadata. The same classification drives the
//! errors raised to callers and is what callers match on.
//!
//! | Status              | Kind           |
//! |---------------------|----------------|
//! | 401, 403            | Authentication |
//! | 404                 | NotFound       |
//! | 429                 | RateLimited    |
//! | 500-599             | Retryable      |
//! | network / timeout   | Retryable      |
//! | anything else non-2xx | Generic      |

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::http::headers::{self, RateLimitHeaders};
use crate::http::transport::{FailureKind, TransportError};
use crate::types::HttpResponse;

/// Longest body excerpt kept on an error
const BODY_EXCERPT_LIMIT: usize = 512;

/// Closed classification of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 401 or 403: credentials missing, invalid, expired, or insufficient
    Authentication,
    /// 404: the resource does not exist
    NotFound,
    /// 429: the provider's quota was exceeded
    RateLimited,
    /// 5xx, transport failures, and exhausted retries
    Retryable,
    /// Any other non-success status
    Generic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Retryable => "retryable",
            ErrorKind::Generic => "generic",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hint about which part of authentication failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthFailure {
    /// The token expired or was revoked
    Token,
    /// The credentials are wrong
    Credentials,
    /// No credentials were sent or configured
    Missing,
    /// Authenticated, but not allowed to do this (403)
    Permissions,
}

/// Kind-specific metadata
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ErrorDetails {
    #[default]
    None,
    Authentication {
        auth_type: Option<AuthFailure>,
    },
    NotFound {
        resource: Option<String>,
    },
    RateLimited {
        retry_after: Option<Duration>,
        limit: Option<u64>,
        remaining: Option<u64>,
    },
    Generic {
        body_excerpt: String,
        provider_code: Option<String>,
    },
}

/// A classified call failure
#[derive(Debug, Clone)]
pub struct HttpError {
    /// Error classification
    pub kind: ErrorKind,
    /// HTTP status code if a response was received
    pub status_code: Option<u16>,
    /// Human-readable message
    pub message: String,
    /// Transport failure kind if no response was received
    pub failure: Option<FailureKind>,
    /// Kind-specific metadata
    pub details: ErrorDetails,
    /// Physical attempts made before giving up, when known
    pub attempts: Option<u32>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl HttpError {
    /// Create an error with no status, metadata or cause
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
            failure: None,
            details: ErrorDetails::None,
            attempts: None,
            cause: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Attach the error that caused this one
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// The nested cause, if any
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Classify a response; `None` for 2xx
    ///
    /// `url` is the request URL and is only used to name the missing
    /// resource on a 404.
    pub fn from_response(response: &HttpResponse, url: Option<&Url>) -> Option<Self> {
        let kind = classify_status(response.status)?;
        let status = response.status;
        let body = response.text();
        let (provider_code, provider_message) = extract_provider_error(&body);
        let suffix = provider_message
            .as_deref()
            .filter(|m| !m.is_empty())
            .map(|m| format!(": {}", m))
            .unwrap_or_default();

        let error = match kind {
            ErrorKind::Authentication if status == 403 => {
                HttpError::new(kind, format!("Insufficient permissions: HTTP 403{}", suffix))
                    .with_details(ErrorDetails::Authentication {
                        auth_type: Some(AuthFailure::Permissions),
                    })
            }
            ErrorKind::Authentication => {
                HttpError::new(kind, format!("Authentication failed: HTTP {}{}", status, suffix))
                    .with_details(ErrorDetails::Authentication {
                        auth_type: auth_hint(response),
                    })
            }
            ErrorKind::NotFound => {
                let resource = url.and_then(resource_from_url);
                let message = match &resource {
                    Some(id) => format!("Resource not found: {}", id),
                    None => format!("Resource not found: HTTP 404{}", suffix),
                };
                HttpError::new(kind, message).with_details(ErrorDetails::NotFound { resource })
            }
            ErrorKind::RateLimited => {
                // Best effort: a malformed quota header must not hide the 429
                let quota = RateLimitHeaders::parse(&response.headers).unwrap_or_default();
                let retry_after = headers::retry_after(&response.headers);
                let message = match retry_after {
                    Some(wait) => format!("Rate limit exceeded, retry after {}s", wait.as_secs()),
                    None => "Rate limit exceeded".to_string(),
                };
                HttpError::new(kind, message).with_details(ErrorDetails::RateLimited {
                    retry_after,
                    limit: quota.limit,
                    remaining: quota.remaining,
                })
            }
            ErrorKind::Retryable => {
                HttpError::new(kind, format!("Server error: HTTP {}{}", status, suffix))
            }
            ErrorKind::Generic => {
                HttpError::new(kind, format!("HTTP error {}{}", status, suffix)).with_details(
                    ErrorDetails::Generic {
                        body_excerpt: excerpt(&body),
                        provider_code,
                    },
                )
            }
        };

        Some(error.with_status(status))
    }

    /// Retry-After hint carried by a rate-limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match &self.details {
            ErrorDetails::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<TransportError> for HttpError {
    fn from(error: TransportError) -> Self {
        let kind = classify_failure(error.kind);
        let mut http = HttpError::new(kind, error.to_string());
        http.failure = Some(error.kind);
        http.with_cause(error)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HTTP Error [{}]: {} (kind: {})",
            self.status_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            self.message,
            self.kind
        )?;
        if let Some(attempts) = self.attempts {
            write!(f, " after {} attempt(s)", attempts)?;
        }
        Ok(())
    }
}

impl std::error::Error for HttpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Classify a status code; `None` means success
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ErrorKind::Authentication),
        404 => Some(ErrorKind::NotFound),
        429 => Some(ErrorKind::RateLimited),
        500..=599 => Some(ErrorKind::Retryable),
        _ => Some(ErrorKind::Generic),
    }
}

/// Classify a transport failure
pub fn classify_failure(kind: FailureKind) -> ErrorKind {
    if kind.is_transient() {
        ErrorKind::Retryable
    } else {
        ErrorKind::Generic
    }
}

fn auth_hint(response: &HttpResponse) -> Option<AuthFailure> {
    let challenge = response.header("www-authenticate")?.to_ascii_lowercase();
    if challenge.contains("invalid_token") || challenge.contains("expired") {
        Some(AuthFailure::Token)
    } else if challenge.contains("invalid_client") || challenge.contains("invalid_grant") {
        Some(AuthFailure::Credentials)
    } else {
        None
    }
}

fn resource_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(|segment| segment.to_string())
}

/// Pull a code and message out of the common JSON error shapes
fn extract_provider_error(body: &str) -> (Option<String>, Option<String>) {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        let trimmed = body.trim();
        return (None, (!trimmed.is_empty()).then(|| excerpt(trimmed)));
    };

    // {"error": {"code": ..., "message": ...}} or {"error": "..."}
    if let Some(error) = json.get("error") {
        if let Some(message) = error.as_str() {
            return (None, Some(message.to_string()));
        }
        let code = error
            .get("code")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string());
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string());
        return (code, message);
    }

    // Amazon SP-API: {"errors": [{"code": ..., "message": ...}]}
    if let Some(first) = json.get("errors").and_then(|e| e.get(0)) {
        let code = first
            .get("code")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string());
        let message = first
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string());
        return (code, message);
    }

    let message = json
        .get("message")
        .and_then(|m| m.as_str())
        .map(|s| s.to_string());
    (None, message)
}

fn excerpt(body: &str) -> String {
    match body.char_indices().nth(BODY_EXCERPT_LIMIT) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
