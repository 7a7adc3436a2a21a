//! Rate limiting with per-key quota windows
//!
//! Each key owns a fixed window: `capacity` calls per `window`. Before every
//! physical send the coordinator takes one call out of the window, waiting
//! for the window to reset when it is empty. After every send the window is
//! corrected from whatever quota telemetry the provider returned.
//!
//! Throttling is advisory. If a caller has waited `max_wait` and the window
//! is still empty, the send proceeds anyway and the provider gets to answer
//! with a 429, which is passed through untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::duration_ms;
use crate::http::error::HttpError;
use crate::http::headers::{HeaderParseError, RateLimitHeaders};
use crate::http::logging::Logger;
use crate::http::middleware::{priority, Middleware};
use crate::http::transport::{HttpTransport, SharedTransport};
use crate::types::{HttpRequest, HttpResponse, RequestOptions};
use crate::{Error, Result};

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Calls allowed per window
    pub capacity: u64,
    /// Window length
    #[serde(with = "duration_ms", rename = "window_ms")]
    pub window: Duration,
    /// Longest a single acquire may block
    #[serde(with = "duration_ms", rename = "max_wait_ms")]
    pub max_wait: Duration,
    /// Custom limits per key
    pub key_limits: BTreeMap<String, KeyLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 60,
            window: Duration::from_secs(60),
            max_wait: Duration::from_secs(60),
            key_limits: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Add a per-key override
    pub fn with_key_limit(mut self, key: impl Into<String>, limit: KeyLimit) -> Self {
        self.key_limits.insert(key.into(), limit);
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_limit("default", self.capacity, self.window)?;
        for (key, limit) in &self.key_limits {
            check_limit(key, limit.capacity, limit.window)?;
        }
        Ok(())
    }

    fn limit_for(&self, key: &str) -> KeyLimit {
        self.key_limits.get(key).copied().unwrap_or(KeyLimit {
            capacity: self.capacity,
            window: self.window,
        })
    }
}

fn check_limit(key: &str, capacity: u64, window: Duration) -> Result<()> {
    if capacity == 0 {
        return Err(Error::configuration(format!(
            "rate limit capacity for {} must be at least 1",
            key
        )));
    }
    if window.is_zero() {
        return Err(Error::configuration(format!(
            "rate limit window for {} must be longer than zero",
            key
        )));
    }
    Ok(())
}

/// Quota for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLimit {
    pub capacity: u64,
    #[serde(with = "duration_ms", rename = "window_ms")]
    pub window: Duration,
}

impl KeyLimit {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self { capacity, window }
    }
}

/// Rate limiter errors
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("unreadable rate limit headers: {0}")]
    Headers(#[from] HeaderParseError),
}

/// Result of one acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    /// Time spent blocked
    pub waited: Duration,
    /// False when `max_wait` ran out and the call proceeds over quota
    pub within_quota: bool,
}

/// Snapshot of one key's window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub capacity: u64,
    pub remaining: u64,
    pub reset_in: Duration,
}

/// Furthest point a window reset or a wait deadline is pushed out to
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, saturating at [`FAR_FUTURE`] instead of overflowing
fn later(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(FAR_FUTURE)).unwrap_or(now)
}

#[derive(Debug)]
struct Window {
    capacity: u64,
    remaining: u64,
    reset_at: Instant,
    length: Duration,
}

impl Window {
    fn fresh(limit: KeyLimit, now: Instant) -> Self {
        Self {
            capacity: limit.capacity,
            remaining: limit.capacity,
            reset_at: later(now, limit.window),
            length: limit.window,
        }
    }

    fn refresh(&mut self, now: Instant) {
        if now >= self.reset_at {
            self.remaining = self.capacity;
            self.reset_at = later(now, self.length);
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refresh(now);
        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }
}

/// Per-key quota state shared by every pipeline using the same limiter
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Create a limiter; the config is validated here
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            windows: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take one call from `key`'s window, waiting for a reset if needed
    ///
    /// Check-and-decrement happens under one lock, so concurrent callers can
    /// never take more than the window holds.
    pub async fn acquire(&self, key: &str) -> Acquisition {
        let started = Instant::now();
        let deadline = later(started, self.config.max_wait);

        loop {
            let now = Instant::now();
            let reset_at = {
                let mut windows = self.windows();
                let window = windows
                    .entry(key.to_string())
                    .or_insert_with(|| Window::fresh(self.config.limit_for(key), now));
                if window.try_take(now) {
                    return Acquisition {
                        waited: now - started,
                        within_quota: true,
                    };
                }
                window.reset_at
            };

            if now >= deadline {
                warn!(
                    key,
                    waited_ms = (now - started).as_millis() as u64,
                    "Rate limit wait exceeded max_wait, proceeding over quota"
                );
                return Acquisition {
                    waited: now - started,
                    within_quota: false,
                };
            }

            let wake_at = reset_at.min(deadline);
            debug!(
                key,
                wait_ms = (wake_at - now).as_millis() as u64,
                "Rate limit reached, waiting for window reset"
            );
            sleep_until(wake_at).await;
        }
    }

    /// Correct `key`'s window from the quota headers of `response`
    ///
    /// Returns whether anything was updated. Malformed headers leave the
    /// state untouched.
    pub fn reconcile(
        &self,
        key: &str,
        response: &HttpResponse,
    ) -> std::result::Result<bool, RateLimitError> {
        let quota = RateLimitHeaders::parse(&response.headers)?;
        let limited = response.status == 429;
        if quota.is_empty() && !limited {
            return Ok(false);
        }

        let now = Instant::now();
        let mut windows = self.windows();
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| Window::fresh(self.config.limit_for(key), now));
        window.refresh(now);

        if let Some(limit) = quota.limit.filter(|l| *l > 0) {
            window.capacity = limit;
        }
        if let Some(remaining) = quota.remaining {
            window.remaining = remaining;
            window.capacity = window.capacity.max(remaining);
        }
        if let Some(reset_after) = quota.reset_after {
            window.reset_at = later(now, reset_after);
        }

        if limited {
            window.remaining = 0;
            if let Some(retry_after) = quota.retry_after {
                window.reset_at = later(now, retry_after);
            }
        }

        debug!(
            key,
            capacity = window.capacity,
            remaining = window.remaining,
            reset_in_ms = window.reset_at.saturating_duration_since(now).as_millis() as u64,
            "Rate limit state updated from response headers"
        );
        Ok(true)
    }

    /// Current state of `key`, if it has been used
    pub fn status(&self, key: &str) -> Option<RateLimitStatus> {
        let now = Instant::now();
        let mut windows = self.windows();
        let window = windows.get_mut(key)?;
        window.refresh(now);
        Some(RateLimitStatus {
            capacity: window.capacity,
            remaining: window.remaining,
            reset_in: window.reset_at.saturating_duration_since(now),
        })
    }

    /// Forget everything about `key`
    pub fn reset(&self, key: &str) {
        self.windows().remove(key);
    }

    /// Forget every key
    pub fn reset_all(&self) {
        self.windows().clear();
    }
}

/// Middleware unit throttling each physical send under one key
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
    key: String,
    logger: Logger,
    priority: i32,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, key: impl Into<String>, logger: Logger) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::configuration("rate limiter key must not be empty"));
        }
        Ok(Self {
            limiter,
            key,
            logger,
            priority: priority::RATE_LIMITING,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limiting"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn wrap(&self, inner: SharedTransport) -> SharedTransport {
        Arc::new(RateLimitTransport {
            inner,
            limiter: self.limiter.clone(),
            key: self.key.clone(),
            logger: self.logger.clone(),
        })
    }
}

struct RateLimitTransport {
    inner: SharedTransport,
    limiter: Arc<RateLimiter>,
    key: String,
    logger: Logger,
}

#[async_trait]
impl HttpTransport for RateLimitTransport {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        let work = async {
            self.limiter.acquire(&self.key).await;

            let result = self.inner.send(request).await;
            if let Ok(response) = &result {
                if let Err(err) = self.limiter.reconcile(&self.key, response) {
                    debug!(key = %self.key, error = %err, "Ignoring rate limit headers");
                }
            }
            result
        };
        self.logger.scope(work).await
    }

    fn with_options(&self, options: RequestOptions) -> SharedTransport {
        Arc::new(RateLimitTransport {
            inner: self.inner.with_options(options),
            limiter: self.limiter.clone(),
            key: self.key.clone(),
            logger: self.logger.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn limiter(capacity: u64, window_secs: u64, max_wait_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            window: Duration::from_secs(window_secs),
            max_wait: Duration::from_secs(max_wait_secs),
            ..Default::default()
        })
        .unwrap()
    }

    fn response(status: u16, headers: &[(&'static str, &'static str)]) -> HttpResponse {
        headers.iter().fold(HttpResponse::new(status), |resp, (name, value)| {
            resp.with_header(HeaderName::from_static(*name), HeaderValue::from_static(*value))
        })
    }

    #[test]
    fn test_config_validation() {
        assert!(RateLimitConfig::default().validate().is_ok());
        assert!(RateLimitConfig {
            capacity: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        let zero_window = RateLimitConfig::default()
            .with_key_limit("ebay", KeyLimit::new(5, Duration::ZERO));
        assert!(zero_window.validate().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: RateLimitConfig = serde_json::from_str(
            r#"{"capacity": 10, "window_ms": 1000,
                "key_limits": {"discogs": {"capacity": 60, "window_ms": 60000}}}"#,
        )
        .unwrap();
        assert_eq!(config.capacity, 10);
        assert_eq!(config.window, Duration::from_secs(1));
        assert_eq!(config.max_wait, Duration::from_secs(60));
        assert_eq!(
            config.limit_for("discogs"),
            KeyLimit::new(60, Duration::from_secs(60))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_capacity_does_not_wait() {
        let limiter = limiter(3, 10, 60);
        for _ in 0..3 {
            let acquisition = limiter.acquire("amazon").await;
            assert!(acquisition.within_quota);
            assert_eq!(acquisition.waited, Duration::ZERO);
        }
        assert_eq!(limiter.status("amazon").unwrap().remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_blocks_until_window_resets() {
        let limiter = limiter(2, 10, 60);
        limiter.acquire("ebay").await;
        limiter.acquire("ebay").await;

        let started = Instant::now();
        let acquisition = limiter.acquire("ebay").await;
        assert!(acquisition.within_quota);
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_max_wait() {
        let limiter = limiter(1, 300, 2);
        limiter.acquire("ebay").await;

        let acquisition = limiter.acquire("ebay").await;
        assert!(!acquisition.within_quota);
        assert!(acquisition.waited >= Duration::from_secs(2));
        assert!(acquisition.waited < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(
            RateLimitConfig {
                capacity: 1,
                max_wait: Duration::ZERO,
                ..Default::default()
            }
            .with_key_limit("discogs", KeyLimit::new(2, Duration::from_secs(60))),
        )
        .unwrap();

        assert!(limiter.acquire("amazon").await.within_quota);
        assert!(!limiter.acquire("amazon").await.within_quota);
        assert!(limiter.acquire("discogs").await.within_quota);
        assert!(limiter.acquire("discogs").await.within_quota);
        assert_eq!(limiter.status("discogs").unwrap().capacity, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_updates_following_acquire() {
        let limiter = limiter(100, 60, 60);
        limiter.acquire("amazon").await;

        let updated = limiter
            .reconcile(
                "amazon",
                &response(
                    200,
                    &[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "5")],
                ),
            )
            .unwrap();
        assert!(updated);

        let status = limiter.status("amazon").unwrap();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_in, Duration::from_secs(5));

        let started = Instant::now();
        assert!(limiter.acquire("amazon").await.within_quota);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    struct Fixed(HttpResponse);

    #[async_trait]
    impl HttpTransport for Fixed {
        async fn send(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
            Ok(self.0.clone())
        }

        fn with_options(&self, _options: RequestOptions) -> SharedTransport {
            Arc::new(Fixed(self.0.clone()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_reset_headers_saturate() {
        let limiter = limiter(10, 60, 60);

        let huge_retry = response(429, &[("retry-after", "18446744073709551615")]);
        assert!(limiter.reconcile("amazon", &huge_retry).unwrap());
        let status = limiter.status("amazon").unwrap();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_in, FAR_FUTURE);

        let huge_reset = response(200, &[("x-ratelimit-reset", "1e300")]);
        assert!(limiter.reconcile("ebay", &huge_reset).unwrap());
        assert_eq!(limiter.status("ebay").unwrap().reset_in, FAR_FUTURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extreme_headers_do_not_fail_the_send() {
        let request = HttpRequest::get(url::Url::parse("https://api.example.com/items").unwrap());
        for answer in [
            response(429, &[("retry-after", "18446744073709551615")]),
            response(200, &[("x-ratelimit-reset", "1e300")]),
        ] {
            let limiter = Arc::new(limiter(10, 60, 0));
            let unit = RateLimitMiddleware::new(limiter, "amazon", Logger::disabled()).unwrap();
            let transport = unit.wrap(Arc::new(Fixed(answer.clone())));

            let received = transport.send(request.clone()).await.unwrap();
            assert_eq!(received.status, answer.status);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_configured_durations_saturate() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 1,
            window: Duration::from_millis(u64::MAX),
            max_wait: Duration::from_millis(u64::MAX),
            ..Default::default()
        })
        .unwrap();

        assert!(limiter.acquire("discogs").await.within_quota);
        assert_eq!(limiter.status("discogs").unwrap().reset_in, FAR_FUTURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_429_empties_window() {
        let limiter = limiter(10, 60, 60);
        limiter
            .reconcile("discogs", &response(429, &[("retry-after", "3")]))
            .unwrap();

        let status = limiter.status("discogs").unwrap();
        assert_eq!(status.remaining, 0);
        assert_eq!(status.reset_in, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_provider_headers() {
        let limiter = limiter(100, 60, 60);
        limiter
            .reconcile(
                "discogs",
                &response(
                    200,
                    &[
                        ("x-discogs-ratelimit", "60"),
                        ("x-discogs-ratelimit-remaining", "12"),
                    ],
                ),
            )
            .unwrap();

        let status = limiter.status("discogs").unwrap();
        assert_eq!(status.capacity, 60);
        assert_eq!(status.remaining, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_headers_leave_state_alone() {
        let limiter = limiter(5, 60, 60);
        limiter.acquire("ebay").await;

        let result = limiter.reconcile(
            "ebay",
            &response(200, &[("x-ratelimit-remaining", "lots")]),
        );
        assert!(matches!(result, Err(RateLimitError::Headers(_))));
        assert_eq!(limiter.status("ebay").unwrap().remaining, 4);

        assert!(!limiter.reconcile("ebay", &response(200, &[])).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_state() {
        let limiter = limiter(1, 60, 60);
        limiter.acquire("a").await;
        limiter.acquire("b").await;
        limiter.reset("a");
        assert!(limiter.status("a").is_none());
        assert!(limiter.status("b").is_some());
        limiter.reset_all();
        assert!(limiter.status("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_capacity() {
        let limiter = Arc::new(limiter(5, 60, 0));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire("shared").await.within_quota })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
    }
}
