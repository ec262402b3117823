//! Provider collaborators
//!
//! The engine never talks to a cloud API directly. Everything goes through a
//! [`ProviderClient`], which maps a `(service, method, params)` request onto a
//! concrete call and hands back an untyped JSON envelope.
//!
//! # Module Structure
//!
//! - [`gcp`] - Google Cloud REST provider (Compute Engine, Cloud Monitoring)
//! - [`fixture`] - In-memory provider backed by canned responses

pub mod fixture;
pub mod gcp;

use crate::error::ProviderError;
use async_trait::async_trait;
use serde_json::Value;

pub use fixture::FixtureProvider;
pub use gcp::GcpProvider;

/// A single provider request: method name plus JSON parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: String,
    pub params: Value,
}

impl RequestSpec {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            params: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_params(method: &str, params: Value) -> Self {
        let params = if params.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            params
        };
        Self {
            method: method.to_string(),
            params,
        }
    }

    /// Set a single parameter, turning `params` into an object if needed
    pub fn set_param(&mut self, key: &str, value: Value) {
        if !self.params.is_object() {
            self.params = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.params {
            map.insert(key.to_string(), value);
        }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// Blocking I/O boundary to a cloud provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Whether this provider can serve requests for `service`
    fn supports_service(&self, _service: &str) -> bool {
        true
    }

    /// Read-only call: list, describe, metric queries
    async fn fetch(&self, service: &str, request: &RequestSpec) -> Result<Value, ProviderError>;

    /// Mutating call
    async fn invoke(&self, service: &str, request: &RequestSpec) -> Result<Value, ProviderError>;
}
