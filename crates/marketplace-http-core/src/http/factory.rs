//! Client assembly from configuration
//!
//! Turns a [`ClientConfig`] into middleware units, nests them around a base
//! transport and hands back a [`MarketplaceClient`]. Collaborators that
//! cannot come from a config file (the logger, a request signer, a rate
//! limiter shared between clients) are injected into the factory.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::config::{ClientConfig, DEFAULT_RATE_LIMIT_KEY};
use crate::http::auth::{AuthMiddleware, RequestSigner};
use crate::http::client::MarketplaceClient;
use crate::http::logging::{Logger, LoggingMiddleware};
use crate::http::middleware::{priority, Middleware};
use crate::http::pipeline::{Pipeline, PipelineAssembler};
use crate::http::rate_limit::{RateLimitMiddleware, RateLimiter};
use crate::http::retry::RetryMiddleware;
use crate::http::transport::{ReqwestTransport, SharedTransport};
use crate::types::RequestOptions;
use crate::{Error, Result};

/// Middleware names understood by the factory
pub const AVAILABLE_MIDDLEWARE: &[&str] = &["logging", "rate_limiting", "retry", "auth"];

/// Builds clients from configuration
#[derive(Clone, Default)]
pub struct ClientFactory {
    logger: Logger,
    signer: Option<Arc<dyn RequestSigner>>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl ClientFactory {
    /// Create a factory whose units log through `logger`
    pub fn new(logger: Logger) -> Self {
        Self {
            logger,
            ..Default::default()
        }
    }

    /// Signer used by the `auth` unit
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Share one limiter between every client this factory builds
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn available_middleware(&self) -> &'static [&'static str] {
        AVAILABLE_MIDDLEWARE
    }

    /// Instantiate the configured units, in configuration order
    pub fn middleware_for(&self, config: &ClientConfig) -> Result<Vec<Arc<dyn Middleware>>> {
        config
            .middleware
            .iter()
            .map(|name| self.unit(name, config))
            .collect()
    }

    fn unit(&self, name: &str, config: &ClientConfig) -> Result<Arc<dyn Middleware>> {
        let logger = self.logger.clone();
        let priority_or = |default: i32| config.priority_for(name).unwrap_or(default);
        let unit: Arc<dyn Middleware> = match name {
            "logging" => Arc::new(
                LoggingMiddleware::new(logger).with_priority(priority_or(priority::LOGGING)),
            ),
            "retry" => {
                let policy = config.retry.clone().ok_or_else(|| {
                    Error::configuration("middleware retry is configured without a retry policy")
                })?;
                Arc::new(
                    RetryMiddleware::new(policy, logger)?
                        .with_priority(priority_or(priority::RETRY)),
                )
            }
            "rate_limiting" => {
                let key = config
                    .rate_limit
                    .as_ref()
                    .map(|settings| settings.key.clone())
                    .unwrap_or_else(|| DEFAULT_RATE_LIMIT_KEY.to_string());
                let limiter = match (&self.rate_limiter, &config.rate_limit) {
                    (Some(shared), _) => shared.clone(),
                    (None, Some(settings)) => Arc::new(RateLimiter::new(settings.limits.clone())?),
                    (None, None) => {
                        return Err(Error::configuration(
                            "middleware rate_limiting needs rate_limit settings or a shared rate limiter",
                        ))
                    }
                };
                Arc::new(
                    RateLimitMiddleware::new(limiter, key, logger)?
                        .with_priority(priority_or(priority::RATE_LIMITING)),
                )
            }
            "auth" => {
                let signer = self.signer.clone().ok_or_else(|| {
                    Error::configuration("middleware auth is configured without a request signer")
                })?;
                Arc::new(
                    AuthMiddleware::new(signer, logger)?.with_priority(priority_or(priority::AUTH)),
                )
            }
            other => {
                return Err(Error::configuration(format!(
                    "unknown middleware {:?}, available: {}",
                    other,
                    AVAILABLE_MIDDLEWARE.join(", ")
                )))
            }
        };
        Ok(unit)
    }

    /// Validate `config` and nest its units around `base`
    pub fn build_pipeline(&self, config: &ClientConfig, base: SharedTransport) -> Result<Pipeline> {
        config.validate()?;

        let base = base.with_options(RequestOptions {
            headers: config.default_header_map()?,
            ..Default::default()
        });

        let mut assembler = PipelineAssembler::new().with_tie_break(config.tie_break);
        for unit in self.middleware_for(config)? {
            assembler.add(unit);
        }

        let pipeline = self.logger.in_scope(|| assembler.assemble(base))?;
        self.logger.in_scope(|| {
            info!(
                middleware = ?pipeline.middleware_names(),
                base_url = config.base_url.as_deref().unwrap_or(""),
                "HTTP client pipeline assembled"
            )
        });
        Ok(pipeline)
    }

    /// Build a client on top of a reqwest transport
    pub fn create(&self, config: &ClientConfig) -> Result<MarketplaceClient> {
        config.validate()?;
        let base = ReqwestTransport::new(&config.transport_config())?;
        self.create_with_transport(config, Arc::new(base))
    }

    /// Build a client on top of any transport
    pub fn create_with_transport(
        &self,
        config: &ClientConfig,
        base: SharedTransport,
    ) -> Result<MarketplaceClient> {
        let pipeline = self.build_pipeline(config, base)?;
        Ok(MarketplaceClient::new(pipeline, config.base_url()?))
    }
}

impl fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientFactory")
            .field("signer", &self.signer.is_some())
            .field("rate_limiter", &self.rate_limiter.is_some())
            .finish_non_exhaustive()
    }
}
