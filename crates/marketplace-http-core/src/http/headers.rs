//! Rate-limit telemetry carried in response headers
//!
//! Marketplaces report quota state under different header names. Amazon
//! SP-API uses `x-amzn-ratelimit-*`, Discogs `x-discogs-ratelimit*`, and most
//! others the de-facto `x-ratelimit-*` family. All of them are folded into one
//! [`RateLimitHeaders`] value here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};

const LIMIT_HEADERS: &[&str] = &[
    "x-ratelimit-limit",
    "x-amzn-ratelimit-limit",
    "x-discogs-ratelimit",
];

const REMAINING_HEADERS: &[&str] = &[
    "x-ratelimit-remaining",
    "x-amzn-ratelimit-remaining",
    "x-discogs-ratelimit-remaining",
];

const RESET_HEADERS: &[&str] = &["x-ratelimit-reset"];

/// Reset values above this are unix timestamps rather than delta seconds
const EPOCH_THRESHOLD: f64 = 1_000_000_000.0;

/// Header parsing errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HeaderParseError {
    #[error("header {header} is not valid UTF-8")]
    NotUtf8 { header: String },

    #[error("malformed {header} header: {value:?}")]
    Malformed { header: String, value: String },
}

/// Quota telemetry extracted from one response
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitHeaders {
    /// Quota size for the current window
    pub limit: Option<u64>,
    /// Calls left in the current window
    pub remaining: Option<u64>,
    /// Time until the window resets
    pub reset_after: Option<Duration>,
    /// Server-requested pause before the next call
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    /// Parse every known rate-limit header family
    ///
    /// Missing headers are not an error; a present but unparsable value is.
    pub fn parse(headers: &HeaderMap) -> Result<Self, HeaderParseError> {
        Self::parse_at(headers, Utc::now())
    }

    /// Same as [`RateLimitHeaders::parse`] with an explicit wall clock
    pub fn parse_at(headers: &HeaderMap, now: DateTime<Utc>) -> Result<Self, HeaderParseError> {
        let limit = first_count(headers, LIMIT_HEADERS)?;
        let remaining = first_count(headers, REMAINING_HEADERS)?;

        let reset_after = match first_value(headers, RESET_HEADERS)? {
            Some((name, raw)) => {
                let value = parse_number(name, raw)?;
                let secs = if value > EPOCH_THRESHOLD {
                    (value - now.timestamp() as f64).max(0.0)
                } else {
                    value
                };
                Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
            }
            None => None,
        };

        let retry_after = match first_value(headers, &["retry-after"])? {
            Some((name, raw)) => Some(parse_retry_after_at(raw, now).ok_or_else(|| {
                HeaderParseError::Malformed {
                    header: name.to_string(),
                    value: raw.to_string(),
                }
            })?),
            None => None,
        };

        Ok(Self {
            limit,
            remaining,
            reset_after,
            retry_after,
        })
    }

    /// True when no rate-limit header was present at all
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.remaining.is_none()
            && self.reset_after.is_none()
            && self.retry_after.is_none()
    }
}

/// Lenient `Retry-After` lookup; malformed values yield `None`
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| parse_retry_after_at(raw, Utc::now()))
}

/// Parse a `Retry-After` value: delta seconds or an HTTP-date
pub fn parse_retry_after_at(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let date = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = date.with_timezone(&Utc) - now;
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

fn first_value<'a>(
    headers: &'a HeaderMap,
    names: &[&'static str],
) -> Result<Option<(&'static str, &'a str)>, HeaderParseError> {
    for name in names {
        if let Some(value) = headers.get(*name) {
            let text = value.to_str().map_err(|_| HeaderParseError::NotUtf8 {
                header: name.to_string(),
            })?;
            return Ok(Some((*name, text)));
        }
    }
    Ok(None)
}

fn first_count(
    headers: &HeaderMap,
    names: &[&'static str],
) -> Result<Option<u64>, HeaderParseError> {
    match first_value(headers, names)? {
        // Amazon reports fractional rates such as 0.5; round up to whole calls
        Some((name, raw)) => Ok(Some(parse_number(name, raw)?.ceil() as u64)),
        None => Ok(None),
    }
}

fn parse_number(name: &str, raw: &str) -> Result<f64, HeaderParseError> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(HeaderParseError::Malformed {
            header: name.to_string(),
            value: raw.to_string(),
        }),
    }
}
