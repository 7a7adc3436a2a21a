//! Retry controller with exponential backoff
//!
//! One logical call runs through this state machine:
//!
//! ```text
//! Attempting -> EvaluatingOutcome -> WaitingBackoff -> Attempting
//!                                 -> Succeeded
//!                                 -> ExhaustedFailure
//! ```
//!
//! The controller never sends more than `max_attempts` requests. When it
//! gives up, the raised error carries the number of attempts actually made
//! and the last status or failure.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::duration_ms;
use crate::http::error::{ErrorKind, HttpError};
use crate::http::logging::{sanitize_url, Logger};
use crate::http::middleware::{priority, Middleware};
use crate::http::transport::{FailureKind, HttpTransport, SharedTransport};
use crate::types::{HttpRequest, HttpResponse, RequestOptions};
use crate::{Error, Result};

/// Randomization applied to each delay when jitter is on: `[0.5d, 1.5d]`
const JITTER_FACTOR: f64 = 0.5;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of physical sends, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Upper bound for any single delay
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Response statuses that trigger another attempt
    pub retryable_status_codes: BTreeSet<u16>,
    /// Transport failures that trigger another attempt
    pub retryable_failures: BTreeSet<FailureKind>,
    /// Spread each delay randomly over `[0.5d, 1.5d]`, capped at `max_delay`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            retryable_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
            retryable_failures: FailureKind::transient().collect(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with custom attempt budget and default everything else
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Replace the set of retryable statuses
    pub fn with_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Replace the set of retryable transport failures
    pub fn with_failures(mut self, failures: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retryable_failures = failures.into_iter().collect();
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the policy invariants
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::configuration("retry max_attempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::configuration(format!(
                "retry multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::configuration(format!(
                "retry max_delay ({:?}) must not be below initial_delay ({:?})",
                self.max_delay, self.initial_delay
            )));
        }
        if let Some(code) = self
            .retryable_status_codes
            .iter()
            .find(|c| !(100..=599).contains(*c))
        {
            return Err(Error::configuration(format!(
                "retryable status code {} is not a valid HTTP status",
                code
            )));
        }
        Ok(())
    }

    /// Create the backoff schedule for one logical call
    pub fn create_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            max_interval: self.max_delay,
            multiplier: self.multiplier,
            max_elapsed_time: None, // Attempts are bounded by max_attempts
            ..Default::default()
        };

        backoff.randomization_factor = if self.jitter { JITTER_FACTOR } else { 0.0 };
        backoff
    }

    /// Delay after failed attempt `attempt` (1-based), without jitter
    ///
    /// `min(initial_delay * multiplier^(attempt - 1), max_delay)`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let mut backoff = self.create_backoff();
        backoff.randomization_factor = 0.0;

        let mut delay = Duration::ZERO;
        for step in 0..attempt.max(1) {
            let next = backoff.next_backoff().unwrap_or(self.max_delay);
            // Once the schedule stops growing every later delay is the same
            if step > 0 && next == delay {
                break;
            }
            delay = next;
        }
        delay.min(self.max_delay)
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    pub fn should_retry_failure(&self, failure: FailureKind) -> bool {
        self.retryable_failures.contains(&failure)
    }

    /// Whether a raised error is worth another attempt
    ///
    /// Only transport failures qualify. Errors raised by inner middleware
    /// (a signer failing, for instance) carry no failure kind.
    pub fn should_retry_error(&self, error: &HttpError) -> bool {
        error
            .failure
            .map(|failure| self.should_retry_failure(failure))
            .unwrap_or(false)
    }
}

/// Middleware unit re-sending retryable failures
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    policy: Arc<RetryPolicy>,
    logger: Logger,
    priority: i32,
}

impl RetryMiddleware {
    /// Create the unit; the policy is validated here, not at send time
    pub fn new(policy: RetryPolicy, logger: Logger) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy: Arc::new(policy),
            logger,
            priority: priority::RETRY,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn wrap(&self, inner: SharedTransport) -> SharedTransport {
        Arc::new(RetryTransport {
            inner,
            policy: self.policy.clone(),
            logger: self.logger.clone(),
        })
    }
}

struct RetryTransport {
    inner: SharedTransport,
    policy: Arc<RetryPolicy>,
    logger: Logger,
}

impl RetryTransport {
    async fn run(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let method = request.method.clone();
        let url = sanitize_url(&request.url);
        let mut backoff = self.policy.create_backoff();
        let mut attempt: u32 = 1;

        loop {
            match self.inner.send(request.clone()).await {
                Ok(response) if self.policy.should_retry_status(response.status) => {
                    if attempt >= max_attempts {
                        error!(
                            method = %method,
                            url = %url,
                            status_code = response.status,
                            attempts = attempt,
                            "HTTP request failed after all retry attempts"
                        );
                        return Err(exhausted_status(&request, &response, attempt));
                    }

                    warn!(
                        method = %method,
                        url = %url,
                        status_code = response.status,
                        attempt,
                        max_attempts,
                        "HTTP request returned retryable status code"
                    );
                }
                Ok(response) => {
                    if attempt > 1 {
                        info!(
                            method = %method,
                            url = %url,
                            status_code = response.status,
                            attempts = attempt,
                            "HTTP request completed after retries"
                        );
                    }
                    return Ok(response);
                }
                Err(err) if self.policy.should_retry_error(&err) => {
                    if attempt >= max_attempts {
                        error!(
                            method = %method,
                            url = %url,
                            error = %err,
                            attempts = attempt,
                            "HTTP request failed after all retry attempts"
                        );
                        return Err(exhausted_failure(err, attempt));
                    }

                    warn!(
                        method = %method,
                        url = %url,
                        error = %err,
                        attempt,
                        max_attempts,
                        "HTTP request failed with retryable error"
                    );
                }
                Err(err) => {
                    debug!(
                        method = %method,
                        url = %url,
                        kind = %err.kind,
                        attempt,
                        "Error is not retryable"
                    );
                    return Err(err.with_attempts(attempt));
                }
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.policy.max_delay)
                .min(self.policy.max_delay);
            debug!(
                delay_ms = delay.as_millis() as u64,
                next_attempt = attempt + 1,
                "Waiting before retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl HttpTransport for RetryTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        self.logger.scope(self.run(request)).await
    }

    fn with_options(&self, options: RequestOptions) -> SharedTransport {
        Arc::new(RetryTransport {
            inner: self.inner.with_options(options),
            policy: self.policy.clone(),
            logger: self.logger.clone(),
        })
    }
}

/// Attempts ran out while the server kept answering with a retryable status
fn exhausted_status(request: &HttpRequest, response: &HttpResponse, attempts: u32) -> HttpError {
    let status = response.status;
    let mut error = HttpError::new(
        ErrorKind::Retryable,
        format!("Request failed after {} attempts: HTTP {}", attempts, status),
    )
    .with_status(status)
    .with_attempts(attempts);

    // Keep the classified last response reachable, e.g. a 429's Retry-After
    if let Some(last) = HttpError::from_response(response, Some(&request.url)) {
        error = error.with_details(last.details.clone()).with_cause(last);
    }
    error
}

/// Attempts ran out on transport failures; the last one becomes the cause
fn exhausted_failure(last: HttpError, attempts: u32) -> HttpError {
    let mut error = HttpError::new(
        ErrorKind::Retryable,
        format!("Request failed after {} attempts: {}", attempts, last.message),
    )
    .with_attempts(attempts);
    error.failure = last.failure;
    error.with_cause(last)
}
