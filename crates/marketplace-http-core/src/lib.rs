//! Marketplace HTTP Core - composable HTTP pipeline for marketplace APIs
//!
//! Calls to Amazon, eBay, Discogs and similar APIs go through a chain of
//! middleware units nested around one base transport.
//!
//! # Main Components
//!
//! - **Pipeline Assembly**: units sorted by priority and wrapped so that the
//!   lowest priority runs outermost
//! - **Retry**: bounded attempts with exponential backoff
//! - **Rate Limiting**: per-key quota windows, corrected from response headers
//! - **Classification**: every failed call maps to one [`ErrorKind`]
//!
//! # Example
//!
//! ```no_run
//! use marketplace_http_core::{ClientConfig, ClientFactory, Logger, RetryPolicy, Result};
//!
//! async fn example() -> Result<()> {
//!     let config = ClientConfig::new("https://api.discogs.com")
//!         .with_middleware("logging")
//!         .with_middleware("retry")
//!         .with_retry(RetryPolicy::default());
//!     let client = ClientFactory::new(Logger::current()).create(&config)?;
//!
//!     let release: serde_json::Value = client.get("releases/249504", &[]).await?;
//!     println!("{}", release["title"]);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod types;

// Re-export main types for convenience
pub use config::{ClientConfig, RateLimitSettings};
pub use error::{Error, Result};
pub use http::{
    ClientFactory, ErrorKind, HttpError, HttpTransport, Logger, MarketplaceClient, Middleware,
    Pipeline, PipelineAssembler, RateLimitConfig, RateLimiter, RetryPolicy, SharedTransport,
};
pub use types::{HttpRequest, HttpResponse, Method, RequestOptions};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
