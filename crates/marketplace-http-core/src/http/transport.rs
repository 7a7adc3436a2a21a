//! Transport contract and the reqwest-backed base transport
//!
//! A transport sends exactly one request and returns exactly one response.
//! Middleware units are transports themselves, wrapping an inner one, so a
//! fully assembled pipeline is again just a [`SharedTransport`].
//!
//! Transport-level failures are reported with an explicit [`FailureKind`]
//! so that retry eligibility never depends on the wording of an error
//! message.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect;
use serde::{Deserialize, Serialize};

use crate::http::error::HttpError;
use crate::types::{HttpRequest, HttpResponse, RequestOptions};
use crate::{Error, Result};

/// A transport shared between the layers of a pipeline
pub type SharedTransport = Arc<dyn HttpTransport>;

/// Executes one request and returns one response
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a single request
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError>;

    /// An equivalent transport with `options` merged into its defaults
    fn with_options(&self, options: RequestOptions) -> SharedTransport;
}

/// Why a request never produced a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Connection could not be established
    Connect,
    /// The attempt exceeded its timeout
    Timeout,
    /// The connection broke while sending or receiving
    Network,
    /// The response body could not be read
    Body,
    /// Redirect limit exceeded or redirect loop
    Redirect,
    /// The request could not be built (bad URL, bad header)
    InvalidRequest,
    /// Anything else
    Other,
}

impl FailureKind {
    pub const ALL: [FailureKind; 7] = [
        FailureKind::Connect,
        FailureKind::Timeout,
        FailureKind::Network,
        FailureKind::Body,
        FailureKind::Redirect,
        FailureKind::InvalidRequest,
        FailureKind::Other,
    ];

    /// Failures that usually go away on their own
    ///
    /// Drives both the error classification and the default retry set.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::Connect | FailureKind::Timeout | FailureKind::Network | FailureKind::Body
        )
    }

    /// Every transient kind
    pub fn transient() -> impl Iterator<Item = FailureKind> {
        Self::ALL.into_iter().filter(|kind| kind.is_transient())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connect => "connect",
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::Body => "body",
            FailureKind::Redirect => "redirect",
            FailureKind::InvalidRequest => "invalid_request",
            FailureKind::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request that failed below the HTTP layer
#[derive(Debug, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct TransportError {
    pub kind: FailureKind,
    pub message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    /// Create a transport error without an underlying source
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying error
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Classify a reqwest error
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            FailureKind::Timeout
        } else if error.is_connect() {
            FailureKind::Connect
        } else if error.is_redirect() {
            FailureKind::Redirect
        } else if error.is_builder() {
            FailureKind::InvalidRequest
        } else if error.is_body() || error.is_decode() {
            FailureKind::Body
        } else if error.is_request() {
            FailureKind::Network
        } else {
            FailureKind::Other
        };

        // URLs may carry credentials in their query string
        let error = error.without_url();
        Self::new(kind, error.to_string()).with_source(error)
    }
}

/// Settings for the reqwest-backed transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Maximum number of redirects to follow
    pub max_redirects: usize,
    /// User-Agent header sent with every request
    pub user_agent: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 3,
            user_agent: None,
        }
    }
}

/// Base transport performing real network calls through reqwest
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    defaults: RequestOptions,
}

impl ReqwestTransport {
    /// Build a transport with its own connection pool
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(redirect::Policy::limited(config.max_redirects));
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(|e| Error::Configuration {
            message: format!("Failed to create HTTP client: {}", e),
            source: Some(e.into()),
        })?;

        Ok(Self::with_client(client))
    }

    /// Reuse an existing reqwest client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            defaults: RequestOptions::default(),
        }
    }

    /// Default options applied to every request
    pub fn defaults(&self) -> &RequestOptions {
        &self.defaults
    }

    /// A copy sharing the connection pool, with `options` merged into the defaults
    pub fn merged(&self, options: &RequestOptions) -> Self {
        Self {
            client: self.client.clone(),
            defaults: self.defaults.merged_with(options),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        let request = self.defaults.apply_to(request);

        let mut builder = self
            .client
            .request(request.method.clone(), request.resolved_url())
            .headers(request.headers.clone());
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = self.defaults.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HttpError::from(TransportError::from_reqwest(e)))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| HttpError::from(TransportError::from_reqwest(e)))?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    fn with_options(&self, options: RequestOptions) -> SharedTransport {
        Arc::new(self.merged(&options))
    }
}
