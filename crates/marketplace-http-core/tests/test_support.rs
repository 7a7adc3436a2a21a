//! Shared test support utilities for integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use marketplace_http_core::http::auth::{AuthError, RequestSigner};
use marketplace_http_core::http::transport::{FailureKind, TransportError};
use marketplace_http_core::types::header::{HeaderMap, HeaderName, HeaderValue};
use marketplace_http_core::{
    HttpError, HttpRequest, HttpResponse, HttpTransport, Middleware, RequestOptions,
    SharedTransport,
};
use tokio::time::Instant;

pub type Outcome = Result<HttpResponse, HttpError>;

/// One request seen by [`ScriptedTransport`]
#[derive(Debug, Clone)]
pub struct Recorded {
    pub request: HttpRequest,
    pub at: Instant,
}

#[derive(Default)]
struct ScriptState {
    outcomes: VecDeque<Outcome>,
    fallback: Option<HttpResponse>,
    calls: Vec<Recorded>,
}

/// Transport double replaying scripted outcomes and recording every call
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
    trace: Option<Trace>,
}

impl ScriptedTransport {
    pub fn new(outcomes: Vec<Outcome>) -> Self {
        let transport = Self::default();
        transport.state.lock().unwrap().outcomes = outcomes.into();
        transport
    }

    /// Answer with `response` forever once the script runs out
    pub fn always(response: HttpResponse) -> Self {
        let transport = Self::default();
        transport.state.lock().unwrap().fallback = Some(response);
        transport
    }

    /// Also push "base" to `trace` on every call
    pub fn with_trace(mut self, trace: &Trace) -> Self {
        self.trace = Some(trace.clone());
        self
    }

    pub fn shared(&self) -> SharedTransport {
        Arc::new(self.clone())
    }

    pub fn calls(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Outcome {
        if let Some(trace) = &self.trace {
            trace.push("base");
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(Recorded {
            request,
            at: Instant::now(),
        });
        match state.outcomes.pop_front() {
            Some(outcome) => outcome,
            None => Ok(state.fallback.clone().unwrap_or_else(|| HttpResponse::new(200))),
        }
    }

    fn with_options(&self, options: RequestOptions) -> SharedTransport {
        Arc::new(OptionsApplied {
            inner: self.clone(),
            options,
        })
    }
}

/// Applies default options the way a real base transport would
struct OptionsApplied {
    inner: ScriptedTransport,
    options: RequestOptions,
}

#[async_trait]
impl HttpTransport for OptionsApplied {
    async fn send(&self, request: HttpRequest) -> Outcome {
        self.inner.send(self.options.apply_to(request)).await
    }

    fn with_options(&self, options: RequestOptions) -> SharedTransport {
        Arc::new(OptionsApplied {
            inner: self.inner.clone(),
            options: self.options.merged_with(&options),
        })
    }
}

/// Ordered log of middleware entries and exits
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Middleware double recording `name>` on the way out and `<name` on the way back
pub struct RecordingMiddleware {
    pub name: String,
    pub priority: i32,
    pub trace: Trace,
}

impl RecordingMiddleware {
    pub fn new(name: &str, priority: i32, trace: &Trace) -> Self {
        Self {
            name: name.to_string(),
            priority,
            trace: trace.clone(),
        }
    }
}

impl Middleware for RecordingMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn wrap(&self, inner: SharedTransport) -> SharedTransport {
        Arc::new(RecordingTransport {
            name: self.name.clone(),
            inner,
            trace: self.trace.clone(),
        })
    }
}

struct RecordingTransport {
    name: String,
    inner: SharedTransport,
    trace: Trace,
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn send(&self, request: HttpRequest) -> Outcome {
        self.trace.push(format!("{}>", self.name));
        let outcome = self.inner.send(request).await;
        self.trace.push(format!("<{}", self.name));
        outcome
    }

    fn with_options(&self, options: RequestOptions) -> SharedTransport {
        Arc::new(RecordingTransport {
            name: self.name.clone(),
            inner: self.inner.with_options(options),
            trace: self.trace.clone(),
        })
    }
}

/// Signer stamping a running counter into `x-signature`
#[derive(Default)]
pub struct CountingSigner {
    pub calls: AtomicUsize,
}

impl CountingSigner {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RequestSigner for CountingSigner {
    fn sign(&self, _request: &HttpRequest) -> Result<HeaderMap, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-signature"),
            HeaderValue::from_str(&format!("sig-{}", n)).unwrap(),
        );
        Ok(headers)
    }

    fn validate(&self) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Response with a status, headers and a body
pub fn response(status: u16, headers: &[(&'static str, &'static str)], body: &str) -> HttpResponse {
    headers
        .iter()
        .fold(HttpResponse::new(status), |resp, (name, value)| {
            resp.with_header(HeaderName::from_static(*name), HeaderValue::from_static(*value))
        })
        .with_body(body.as_bytes().to_vec())
}

/// A transport-level timeout
pub fn timeout_failure() -> HttpError {
    TransportError::new(FailureKind::Timeout, "operation timed out").into()
}
