//! Request and response values flowing through a transport pipeline
//!
//! Both are plain owned data. A request is built once per logical call and
//! cloned for every physical attempt; layers that need to add headers (the
//! signer, the client facade) produce a modified copy instead of mutating a
//! shared value. A response may be inspected by any number of layers on its
//! way back out.

use std::borrow::Cow;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use crate::Result;

pub use reqwest::header;
pub use reqwest::Method;

/// An outbound HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP verb
    pub method: Method,
    /// Target URL, without the query parameters held in `query`
    pub url: Url,
    /// Header map; names are case-insensitive
    pub headers: HeaderMap,
    /// Optional body bytes
    pub body: Option<Vec<u8>>,
    /// Query parameters merged into the URL before dispatch
    pub query: Vec<(String, String)>,
}

impl HttpRequest {
    /// Create a request without headers, body or query
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            query: Vec::new(),
        }
    }

    /// Create a GET request
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Set a header, replacing any previous values under the same name
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set every header in `headers`, replacing previous values per name
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Attach a raw body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach a JSON body and the matching content type
    pub fn with_json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(self
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body))
    }

    /// Append a query parameter
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// First value of a header, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The URL that goes on the wire, with `query` appended
    pub fn resolved_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        url
    }
}

/// An HTTP response as seen by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Header map; a name may carry several values
    pub headers: HeaderMap,
    /// Full body bytes
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Create an empty response with the given status
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Append a header value, keeping previous values under the same name
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// First value of a header, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All UTF-8 values of a header, in arrival order
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Body decoded as UTF-8, lossily
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Body decoded as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Default options merged into every request sent through a transport
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Headers added when the request does not already carry them
    pub headers: HeaderMap,
    /// Query parameters added when the request does not already carry the key
    pub query: Vec<(String, String)>,
    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Merge `overrides` on top of `self`; values in `overrides` win
    pub fn merged_with(&self, overrides: &RequestOptions) -> RequestOptions {
        let mut headers = self.headers.clone();
        headers.extend(overrides.headers.clone());

        let mut query: Vec<(String, String)> = self
            .query
            .iter()
            .filter(|(key, _)| !overrides.query.iter().any(|(k, _)| k == key))
            .cloned()
            .collect();
        query.extend(overrides.query.iter().cloned());

        RequestOptions {
            headers,
            query,
            timeout: overrides.timeout.or(self.timeout),
        }
    }

    /// Fill in defaults the request does not set itself
    pub fn apply_to(&self, mut request: HttpRequest) -> HttpRequest {
        for name in self.headers.keys() {
            if !request.headers.contains_key(name) {
                for value in self.headers.get_all(name) {
                    request.headers.append(name.clone(), value.clone());
                }
            }
        }

        let defaults: Vec<(String, String)> = self
            .query
            .iter()
            .filter(|(key, _)| !request.query.iter().any(|(k, _)| k == key))
            .cloned()
            .collect();
        if !defaults.is_empty() {
            let mut query = defaults;
            query.append(&mut request.query);
            request.query = query;
        }

        request
    }
}
