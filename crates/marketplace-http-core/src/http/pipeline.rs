//! Pipeline assembly
//!
//! Units are sorted by priority, highest first, and each one in turn wraps
//! everything built so far. The unit wrapped last encloses all the others,
//! which means:
//!
//! - the LOWEST priority unit is OUTERMOST: it runs first on the way out and
//!   last on the way back;
//! - the HIGHEST priority unit is INNERMOST: it runs right before the base
//!   transport and sees the raw response first.
//!
//! So to read "what happens first when sending", read priorities in
//! ascending order. With the default priorities a retry unit (50) encloses
//! logging (100), rate limiting (200) and signing (300), and every retry
//! attempt is logged, throttled and re-signed on its own.
//!
//! Assembly happens once. A [`Pipeline`] exposes no way to add or remove
//! units afterwards.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::error::HttpError;
use crate::http::middleware::{Middleware, MiddlewareDescriptor};
use crate::http::transport::{HttpTransport, SharedTransport};
use crate::types::{HttpRequest, HttpResponse, RequestOptions};
use crate::{Error, Result};

/// How units with equal priority are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Configuration order: among equal priorities, the unit configured
    /// first is wrapped first and therefore sits further in
    #[default]
    ConfigurationOrder,
    /// Equal priorities are a configuration error
    Reject,
}

/// Orders middleware units and nests them around a base transport
#[derive(Clone, Default)]
pub struct PipelineAssembler {
    units: Vec<Arc<dyn Middleware>>,
    tie_break: TieBreak,
}

impl PipelineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose how equal priorities are handled
    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Add a unit (builder style)
    pub fn with_middleware(mut self, unit: impl Middleware + 'static) -> Self {
        self.units.push(Arc::new(unit));
        self
    }

    /// Add a shared unit
    pub fn add(&mut self, unit: Arc<dyn Middleware>) -> &mut Self {
        self.units.push(unit);
        self
    }

    /// Configured units in configuration order
    pub fn descriptors(&self) -> Vec<MiddlewareDescriptor> {
        self.units.iter().map(|u| u.descriptor()).collect()
    }

    /// The order in which units will run on the outbound path
    pub fn outbound_order(&self) -> Result<Vec<MiddlewareDescriptor>> {
        let mut order: Vec<MiddlewareDescriptor> =
            self.wrap_sequence()?.iter().map(|u| u.descriptor()).collect();
        order.reverse();
        Ok(order)
    }

    /// Nest every unit around `base`
    pub fn assemble(&self, base: SharedTransport) -> Result<Pipeline> {
        let sequence = self.wrap_sequence()?;

        let mut transport = base;
        for unit in &sequence {
            debug!(
                middleware = unit.name(),
                priority = unit.priority(),
                "Wrapping transport"
            );
            transport = unit.wrap(transport);
        }

        let outbound = sequence.iter().rev().map(|u| u.descriptor()).collect();
        Ok(Pipeline {
            transport,
            outbound,
        })
    }

    /// Units in wrap order: innermost first
    fn wrap_sequence(&self) -> Result<Vec<Arc<dyn Middleware>>> {
        self.validate()?;

        let mut sequence = self.units.clone();
        // Stable sort: ties keep configuration order
        sequence.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Ok(sequence)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut priorities = HashSet::new();

        for unit in &self.units {
            let name = unit.name();
            if name.trim().is_empty() {
                return Err(Error::configuration("middleware name must not be empty"));
            }
            if !names.insert(name.to_string()) {
                return Err(Error::configuration(format!(
                    "duplicate middleware name: {}",
                    name
                )));
            }
            if self.tie_break == TieBreak::Reject && !priorities.insert(unit.priority()) {
                return Err(Error::configuration(format!(
                    "middleware {} shares priority {} with another unit",
                    name,
                    unit.priority()
                )));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for PipelineAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineAssembler")
            .field("units", &self.descriptors())
            .field("tie_break", &self.tie_break)
            .finish()
    }
}

/// A fully composed transport with a fixed set of units
#[derive(Clone)]
pub struct Pipeline {
    transport: SharedTransport,
    outbound: Vec<MiddlewareDescriptor>,
}

impl Pipeline {
    /// Units from the outside in
    pub fn outbound_order(&self) -> &[MiddlewareDescriptor] {
        &self.outbound
    }

    /// Units from the inside out
    pub fn inbound_order(&self) -> Vec<MiddlewareDescriptor> {
        self.outbound.iter().rev().cloned().collect()
    }

    /// Names from the outside in
    pub fn middleware_names(&self) -> Vec<&str> {
        self.outbound.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outbound.iter().any(|d| d.name == name)
    }

    /// The composed transport
    pub fn transport(&self) -> SharedTransport {
        self.transport.clone()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("outbound", &self.middleware_names())
            .finish()
    }
}

#[async_trait]
impl HttpTransport for Pipeline {
    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
        self.transport.send(request).await
    }

    fn with_options(&self, options: RequestOptions) -> SharedTransport {
        Arc::new(Pipeline {
            transport: self.transport.with_options(options),
            outbound: self.outbound.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use url::Url;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: &'static str,
        priority: i32,
        trace: Trace,
    }

    struct ProbeTransport {
        name: &'static str,
        inner: SharedTransport,
        trace: Trace,
    }

    #[async_trait]
    impl HttpTransport for ProbeTransport {
        async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
            self.trace.lock().unwrap().push(format!("{}>", self.name));
            let response = self.inner.send(request).await;
            self.trace.lock().unwrap().push(format!("<{}", self.name));
            response
        }

        fn with_options(&self, options: RequestOptions) -> SharedTransport {
            Arc::new(ProbeTransport {
                name: self.name,
                inner: self.inner.with_options(options),
                trace: self.trace.clone(),
            })
        }
    }

    impl Middleware for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn wrap(&self, inner: SharedTransport) -> SharedTransport {
            Arc::new(ProbeTransport {
                name: self.name,
                inner,
                trace: self.trace.clone(),
            })
        }
    }

    struct Ok200(Trace);

    #[async_trait]
    impl HttpTransport for Ok200 {
        async fn send(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, HttpError> {
            self.0.lock().unwrap().push("base".to_string());
            Ok(HttpResponse::new(200))
        }

        fn with_options(&self, _options: RequestOptions) -> SharedTransport {
            Arc::new(Ok200(self.0.clone()))
        }
    }

    fn probe(name: &'static str, priority: i32, trace: &Trace) -> Probe {
        Probe {
            name,
            priority,
            trace: trace.clone(),
        }
    }

    fn request() -> HttpRequest {
        HttpRequest::get(Url::parse("https://api.example.com/ping").unwrap())
    }

    #[tokio::test]
    async fn test_lowest_priority_is_outermost() {
        let trace: Trace = Arc::default();
        let pipeline = PipelineAssembler::new()
            .with_middleware(probe("auth", 300, &trace))
            .with_middleware(probe("retry", 50, &trace))
            .with_middleware(probe("rate_limiting", 200, &trace))
            .with_middleware(probe("logging", 100, &trace))
            .assemble(Arc::new(Ok200(trace.clone())))
            .unwrap();

        assert_eq!(
            pipeline.middleware_names(),
            vec!["retry", "logging", "rate_limiting", "auth"]
        );

        pipeline.send(request()).await.unwrap();
        assert_eq!(
            *trace.lock().unwrap(),
            vec![
                "retry>", "logging>", "rate_limiting>", "auth>", "base", "<auth",
                "<rate_limiting", "<logging", "<retry"
            ]
        );
    }

    #[test]
    fn test_ties_follow_configuration_order() {
        let trace: Trace = Arc::default();
        let assembler = PipelineAssembler::new()
            .with_middleware(probe("first", 100, &trace))
            .with_middleware(probe("second", 100, &trace));

        let order = assembler.outbound_order().unwrap();
        // The first configured unit is wrapped first, so it sits further in
        assert_eq!(order[0].name, "second");
        assert_eq!(order[1].name, "first");
    }

    #[test]
    fn test_ties_rejected_when_requested() {
        let trace: Trace = Arc::default();
        let result = PipelineAssembler::new()
            .with_tie_break(TieBreak::Reject)
            .with_middleware(probe("first", 100, &trace))
            .with_middleware(probe("second", 100, &trace))
            .assemble(Arc::new(Ok200(trace.clone())));

        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let trace: Trace = Arc::default();
        let err = PipelineAssembler::new()
            .with_middleware(probe("logging", 100, &trace))
            .with_middleware(probe("logging", 150, &trace))
            .outbound_order()
            .unwrap_err();

        assert!(err.to_string().contains("duplicate middleware name: logging"));
    }

    #[test]
    fn test_empty_assembler_returns_base() {
        let trace: Trace = Arc::default();
        let pipeline = PipelineAssembler::new()
            .assemble(Arc::new(Ok200(trace)))
            .unwrap();
        assert!(pipeline.outbound_order().is_empty());
    }

    #[test]
    fn test_inbound_is_reverse_of_outbound() {
        let trace: Trace = Arc::default();
        let pipeline = PipelineAssembler::new()
            .with_middleware(probe("a", 1, &trace))
            .with_middleware(probe("b", 2, &trace))
            .assemble(Arc::new(Ok200(trace.clone())))
            .unwrap();

        let inbound: Vec<String> = pipeline.inbound_order().into_iter().map(|d| d.name).collect();
        assert_eq!(inbound, vec!["b", "a"]);
        assert!(pipeline.contains("a"));
        assert!(!pipeline.contains("c"));
    }
}
