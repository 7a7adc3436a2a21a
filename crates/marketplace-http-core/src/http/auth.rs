//! Request signing
//!
//! Signing happens inside the pipeline, once per physical attempt, so every
//! retry carries fresh credentials (timestamps, nonces, refreshed tokens).
//! Supported out of the box:
//! - Bearer tokens
//! - Fixed header sets with `${ENV:VAR}` expansion
//!
//! Anything else (OAuth 1.0a, AWS SigV4) plugs in through [`RequestSigner`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use tracing::{debug, warn};

use crate::http::error::{AuthFailure, ErrorDetails, ErrorKind, HttpError};
use crate::http::logging::{sanitize_url, Logger};
use crate::http::middleware::{priority, Middleware};
use crate::http::transport::{HttpTransport, SharedTransport};
use crate::types::{HttpRequest, HttpResponse, RequestOptions};
use crate::{Error, Result};

const ENV_PATTERN: &str = r"\$\{ENV:([^}]+)\}";

/// Authentication errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("Signing failed: {0}")]
    Signing(String),
}

impl AuthError {
    fn failure(&self) -> AuthFailure {
        match self {
            AuthError::MissingCredentials(_) | AuthError::EnvVarNotFound(_) => AuthFailure::Missing,
            AuthError::InvalidHeader { .. } | AuthError::Signing(_) => AuthFailure::Credentials,
        }
    }
}

/// Computes authentication headers for one outgoing request
pub trait RequestSigner: Send + Sync {
    /// Headers to set on `request`; existing values under the same names are replaced
    fn sign(&self, request: &HttpRequest) -> std::result::Result<HeaderMap, AuthError>;

    /// Check that the credentials are usable before any request is sent
    fn validate(&self) -> std::result::Result<(), AuthError>;
}

/// `Authorization: Bearer <token>`
#[derive(Clone)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Read the token from an environment variable
    pub fn from_env(var: &str) -> std::result::Result<Self, AuthError> {
        std::env::var(var)
            .map(Self::new)
            .map_err(|_| AuthError::EnvVarNotFound(var.to_string()))
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("token", &"<redacted>")
            .finish()
    }
}

impl RequestSigner for BearerToken {
    fn sign(&self, _request: &HttpRequest) -> std::result::Result<HeaderMap, AuthError> {
        self.validate()?;
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token)).map_err(|e| {
            AuthError::InvalidHeader {
                name: AUTHORIZATION.to_string(),
                reason: e.to_string(),
            }
        })?;
        value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    fn validate(&self) -> std::result::Result<(), AuthError> {
        if self.token.trim().is_empty() {
            return Err(AuthError::MissingCredentials("bearer token is empty".to_string()));
        }
        Ok(())
    }
}

/// A fixed set of headers whose values may reference `${ENV:VAR}`
#[derive(Clone)]
pub struct StaticHeaders {
    headers: BTreeMap<String, String>,
    env_pattern: Regex,
}

impl StaticHeaders {
    pub fn new(headers: BTreeMap<String, String>) -> std::result::Result<Self, AuthError> {
        let env_pattern = Regex::new(ENV_PATTERN).map_err(|e| AuthError::Signing(e.to_string()))?;
        for name in headers.keys() {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| AuthError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(Self {
            headers,
            env_pattern,
        })
    }

    /// Expand environment variables in a header value
    fn expand_env_vars(&self, value: &str) -> std::result::Result<String, AuthError> {
        let mut result = value.to_string();
        for cap in self.env_pattern.captures_iter(value) {
            let var_name = &cap[1];
            let env_value = std::env::var(var_name)
                .map_err(|_| AuthError::EnvVarNotFound(var_name.to_string()))?;
            result = result.replace(&cap[0], &env_value);
        }
        Ok(result)
    }
}

impl fmt::Debug for StaticHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticHeaders")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RequestSigner for StaticHeaders {
    fn sign(&self, _request: &HttpRequest) -> std::result::Result<HeaderMap, AuthError> {
        let mut signed = HeaderMap::new();
        for (name, value) in &self.headers {
            let expanded = self.expand_env_vars(value)?;
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| AuthError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let mut header_value =
                HeaderValue::from_str(&expanded).map_err(|e| AuthError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            header_value.set_sensitive(true);
            signed.insert(header_name, header_value);
        }
        Ok(signed)
    }

    fn validate(&self) -> std::result::Result<(), AuthError> {
        for value in self.headers.values() {
            self.expand_env_vars(value)?;
        }
        Ok(())
    }
}

/// Middleware unit signing every physical attempt
#[derive(Clone)]
pub struct AuthMiddleware {
    signer: Arc<dyn RequestSigner>,
    logger: Logger,
    priority: i32,
}

impl AuthMiddleware {
    /// Create the unit; credentials are validated here
    pub fn new(signer: Arc<dyn RequestSigner>, logger: Logger) -> Result<Self> {
        signer.validate().map_err(|e| Error::Configuration {
            message: format!("Invalid credentials: {}", e),
            source: Some(e.into()),
        })?;
        Ok(Self {
            signer,
            logger,
            priority: priority::AUTH,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for AuthMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMiddleware")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "auth"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn wrap(&self, inner: SharedTransport) -> SharedTransport {
        Arc::new(AuthTransport {
            inner,
            signer: self.signer.clone(),
            logger: self.logger.clone(),
        })
    }
}

struct AuthTransport {
    inner: SharedTransport,
    signer: Arc<dyn RequestSigner>,
    logger: Logger,
}

#[async_trait]
impl HttpTransport for AuthTransport {
    async fn send(&self, mut request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        match self.signer.sign(&request) {
            Ok(headers) => {
                self.logger.in_scope(|| {
                    debug!(
                        url = %sanitize_url(&request.url),
                        headers = headers.len(),
                        "Request signed"
                    )
                });
                request.headers.extend(headers);
                self.inner.send(request).await
            }
            Err(err) => {
                self.logger.in_scope(|| {
                    warn!(
                        url = %sanitize_url(&request.url),
                        error = %err,
                        "Request signing failed"
                    )
                });
                Err(HttpError::new(
                    ErrorKind::Authentication,
                    format!("Authentication failed: {}", err),
                )
                .with_details(ErrorDetails::Authentication {
                    auth_type: Some(err.failure()),
                })
                .with_cause(err))
            }
        }
    }

    fn with_options(&self, options: RequestOptions) -> SharedTransport {
        Arc::new(AuthTransport {
            inner: self.inner.with_options(options),
            signer: self.signer.clone(),
            logger: self.logger.clone(),
        })
    }
}
