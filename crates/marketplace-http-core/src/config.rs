//! Client configuration
//!
//! Loaded from JSON or built in code, validated in one place, and consumed
//! by [`crate::http::factory::ClientFactory`] when a client is assembled.
//! Every problem is reported as [`Error::Configuration`] before a single
//! request is sent.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::pipeline::TieBreak;
use crate::http::rate_limit::RateLimitConfig;
use crate::http::retry::RetryPolicy;
use crate::http::transport::TransportConfig;
use crate::{Error, Result};

/// Rate limiter key used when none is configured
pub const DEFAULT_RATE_LIMIT_KEY: &str = "general";

/// Serialize a [`Duration`] as whole milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Settings of the rate limiting unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Quota bucket the pipeline draws from
    pub key: String,
    /// Quota definitions for the limiter
    pub limits: RateLimitConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            key: DEFAULT_RATE_LIMIT_KEY.to_string(),
            limits: RateLimitConfig::default(),
        }
    }
}

/// Everything needed to assemble one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL relative request paths are resolved against
    pub base_url: Option<String>,
    /// Headers added to every request that does not set them itself
    pub default_headers: BTreeMap<String, String>,
    /// Middleware units by name; order only matters for priority ties
    pub middleware: Vec<String>,
    /// Required when `retry` is configured
    pub retry: Option<RetryPolicy>,
    /// Required when `rate_limiting` is configured without a shared limiter
    pub rate_limit: Option<RateLimitSettings>,
    /// Priority overrides by middleware name
    pub priorities: BTreeMap<String, i32>,
    /// How equal priorities are ordered
    pub tie_break: TieBreak,
    /// Per-attempt timeout
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    pub max_redirects: usize,
    pub user_agent: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: BTreeMap::new(),
            middleware: Vec::new(),
            retry: None,
            rate_limit: None,
            priorities: BTreeMap::new(),
            tie_break: TieBreak::default(),
            timeout: Duration::from_secs(30),
            max_redirects: 3,
            user_agent: None,
        }
    }
}

impl ClientConfig {
    /// Start from defaults with a base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into()),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Append a middleware name
    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middleware.push(name.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.rate_limit = Some(settings);
        self
    }

    /// Override the priority of one configured unit
    pub fn with_priority(mut self, name: impl Into<String>, priority: i32) -> Self {
        self.priorities.insert(name.into(), priority);
        self
    }

    /// Configured priority override for `name`
    pub fn priority_for(&self, name: &str) -> Option<i32> {
        self.priorities.get(name).copied()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_middleware(&self, name: &str) -> bool {
        self.middleware.iter().any(|m| m == name)
    }

    /// Parse JSON and validate the result
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json).map_err(|e| Error::Configuration {
            message: format!("Failed to parse client configuration: {}", e),
            source: Some(e.into()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::Io {
            message: format!("Failed to read {}", path.display()),
            source: e,
        })?;
        Self::from_json_str(&content)
    }

    /// Check every field; called by the factory before anything is built
    pub fn validate(&self) -> Result<()> {
        self.base_url()?;

        if self.timeout.is_zero() {
            return Err(Error::configuration("timeout must be longer than zero"));
        }

        let mut seen = HashSet::new();
        for name in &self.middleware {
            if !seen.insert(name.as_str()) {
                return Err(Error::configuration(format!(
                    "duplicate middleware name: {}",
                    name
                )));
            }
        }

        if let Some(name) = self.priorities.keys().find(|name| !self.has_middleware(name)) {
            return Err(Error::configuration(format!(
                "priority override for middleware {} which is not configured",
                name
            )));
        }

        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.key.trim().is_empty() {
                return Err(Error::configuration("rate limiter key must not be empty"));
            }
            rate_limit.limits.validate()?;
        }

        self.default_header_map()?;
        Ok(())
    }

    /// The parsed base URL, if one is configured
    pub fn base_url(&self) -> Result<Option<Url>> {
        let Some(raw) = &self.base_url else {
            return Ok(None);
        };
        let url = Url::parse(raw).map_err(|e| Error::Configuration {
            message: format!("Invalid base URL {:?}: {}", raw, e),
            source: Some(e.into()),
        })?;
        if url.cannot_be_a_base() {
            return Err(Error::configuration(format!(
                "Base URL {:?} cannot be used as a base",
                raw
            )));
        }
        Ok(Some(url))
    }

    /// Default headers as a typed header map
    pub fn default_header_map(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.default_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::Configuration {
                    message: format!("Invalid header name {:?}", name),
                    source: Some(e.into()),
                }
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| Error::Configuration {
                message: format!("Invalid value for header {}", name),
                source: Some(e.into()),
            })?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }

    /// Settings for the base transport
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: self.timeout,
            max_redirects: self.max_redirects,
            user_agent: self.user_agent.clone(),
        }
    }
}
