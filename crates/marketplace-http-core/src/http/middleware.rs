//! Middleware unit contract
//!
//! A middleware unit is a named, prioritized decorator: given a transport it
//! returns a new transport with the same contract and one extra behavior.
//! Units hold only immutable configuration (plus shared collaborators such
//! as a rate limiter); all per-call state lives inside the transport they
//! produce.

use serde::{Deserialize, Serialize};

use crate::http::transport::SharedTransport;

/// Default priorities of the built-in units
///
/// The assembler wraps in descending priority order, so the LOWEST number
/// ends up OUTERMOST. Read these from the caller inwards: retry, then
/// logging, then rate limiting, then signing, then the network.
pub mod priority {
    pub const RETRY: i32 = 50;
    pub const LOGGING: i32 = 100;
    pub const RATE_LIMITING: i32 = 200;
    pub const AUTH: i32 = 300;
}

/// Name and priority of a configured unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MiddlewareDescriptor {
    /// Unique within one pipeline
    pub name: String,
    /// Lower numbers sit further out
    pub priority: i32,
}

impl MiddlewareDescriptor {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// A decorator adding one cross-cutting behavior to a transport
pub trait Middleware: Send + Sync {
    /// Identifier, unique within a pipeline
    fn name(&self) -> &str;

    /// Ordering key; see [`priority`]
    fn priority(&self) -> i32;

    /// Wrap `inner`, producing a transport with the same contract
    fn wrap(&self, inner: SharedTransport) -> SharedTransport;

    /// Name and priority as a value
    fn descriptor(&self) -> MiddlewareDescriptor {
        MiddlewareDescriptor::new(self.name(), self.priority())
    }
}
