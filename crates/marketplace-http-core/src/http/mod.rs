//! HTTP pipeline for marketplace API calls
//!
//! This module provides:
//! - A transport contract and a reqwest-backed base transport
//! - Priority-ordered middleware assembly
//! - Retry with exponential backoff
//! - Per-key rate limiting reconciled from response headers
//! - Request logging and signing
//! - Response classification into typed errors

pub mod auth;
pub mod client;
pub mod error;
pub mod factory;
pub mod headers;
pub mod logging;
pub mod middleware;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod transport;

pub use auth::{AuthError, AuthMiddleware, BearerToken, RequestSigner, StaticHeaders};
pub use client::MarketplaceClient;
pub use error::{classify_failure, classify_status, AuthFailure, ErrorDetails, ErrorKind, HttpError};
pub use factory::ClientFactory;
pub use headers::RateLimitHeaders;
pub use logging::{Logger, LoggingMiddleware};
pub use middleware::{Middleware, MiddlewareDescriptor};
pub use pipeline::{Pipeline, PipelineAssembler, TieBreak};
pub use rate_limit::{KeyLimit, RateLimitConfig, RateLimitMiddleware, RateLimiter};
pub use retry::{RetryMiddleware, RetryPolicy};
pub use transport::{
    FailureKind, HttpTransport, ReqwestTransport, SharedTransport, TransportConfig, TransportError,
};
