//! Fixture provider
//!
//! Serves canned responses keyed by `service.method`. Used for offline policy
//! runs (`--fixtures file.json`) and throughout the test suite.
//!
//! File format:
//!
//! ```json
//! {
//!   "responses": { "compute.list_instances": { "items": [ ... ] } },
//!   "errors": { "compute.stop_instance": { "code": "409", "message": "busy" } }
//! }
//! ```

use super::{ProviderClient, RequestSpec};
use crate::error::ProviderError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

type Handler = Arc<dyn Fn(&RequestSpec) -> Result<Value, ProviderError> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct FixtureError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct FixtureFile {
    #[serde(default)]
    responses: HashMap<String, Value>,
    #[serde(default)]
    errors: HashMap<String, FixtureError>,
}

enum Entry {
    Pages(Vec<Value>),
    Error(ProviderError),
    Handler(Handler),
}

/// A recorded call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub service: String,
    pub request: RequestSpec,
    pub mutating: bool,
}

/// In-memory provider with canned responses
#[derive(Default)]
pub struct FixtureProvider {
    entries: HashMap<String, Entry>,
    cursors: Mutex<HashMap<String, usize>>,
    calls: Mutex<Vec<RecordedCall>>,
}

fn entry_key(service: &str, method: &str) -> String {
    format!("{}.{}", service, method)
}

impl FixtureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load fixtures from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture file {:?}", path))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: FixtureFile = serde_json::from_str(content).context("Invalid fixture JSON")?;
        let mut provider = Self::new();
        for (key, response) in file.responses {
            provider.entries.insert(key, Entry::Pages(vec![response]));
        }
        for (key, err) in file.errors {
            let error = ProviderError {
                code: err.code,
                message: err.message,
            };
            provider.entries.insert(key, Entry::Error(error));
        }
        Ok(provider)
    }

    pub fn with_response(self, service: &str, method: &str, response: Value) -> Self {
        self.with_pages(service, method, vec![response])
    }

    /// Successive pages; a request without `pageToken` restarts at the first
    pub fn with_pages(mut self, service: &str, method: &str, pages: Vec<Value>) -> Self {
        self.entries.insert(entry_key(service, method), Entry::Pages(pages));
        self
    }

    pub fn with_error(mut self, service: &str, method: &str, error: ProviderError) -> Self {
        self.entries.insert(entry_key(service, method), Entry::Error(error));
        self
    }

    /// Compute the response from the request
    pub fn with_handler<F>(mut self, service: &str, method: &str, handler: F) -> Self
    where
        F: Fn(&RequestSpec) -> Result<Value, ProviderError> + Send + Sync + 'static,
    {
        self.entries
            .insert(entry_key(service, method), Entry::Handler(Arc::new(handler)));
        self
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, service: &str, method: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.service == service && c.request.method == method)
            .count()
    }

    fn record(&self, service: &str, request: &RequestSpec, mutating: bool) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                service: service.to_string(),
                request: request.clone(),
                mutating,
            });
        }
    }

    fn next_page(&self, key: &str, pages: &[Value], request: &RequestSpec) -> Value {
        let mut cursors = match self.cursors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cursor = cursors.entry(key.to_string()).or_insert(0);
        if request.param_str("pageToken").is_none() {
            *cursor = 0;
        } else {
            *cursor += 1;
        }
        let idx = (*cursor).min(pages.len().saturating_sub(1));
        pages.get(idx).cloned().unwrap_or(Value::Null)
    }

    fn respond(&self, service: &str, request: &RequestSpec) -> Option<Result<Value, ProviderError>> {
        let key = entry_key(service, &request.method);
        let entry = self.entries.get(&key)?;
        Some(match entry {
            Entry::Pages(pages) => Ok(self.next_page(&key, pages, request)),
            Entry::Error(err) => Err(err.clone()),
            Entry::Handler(handler) => handler(request),
        })
    }
}

#[async_trait]
impl ProviderClient for FixtureProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch(&self, service: &str, request: &RequestSpec) -> Result<Value, ProviderError> {
        self.record(service, request, false);
        self.respond(service, request).unwrap_or_else(|| {
            Err(ProviderError::with_code(
                "NotFound",
                format!("no fixture for {}.{}", service, request.method),
            ))
        })
    }

    async fn invoke(&self, service: &str, request: &RequestSpec) -> Result<Value, ProviderError> {
        self.record(service, request, true);
        match self.respond(service, request) {
            Some(result) => result,
            // Unscripted mutations succeed with a synthetic operation
            None => Ok(json!({
                "name": format!("operation-{}", uuid::Uuid::new_v4()),
                "status": "DONE",
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_json_serves_responses_and_errors() {
        let provider = FixtureProvider::from_json(
            r#"{
                "responses": {"compute.list_disks": {"items": [{"name": "d1"}]}},
                "errors": {"compute.delete_disk": {"code": "409", "message": "in use"}}
            }"#,
        )
        .unwrap();

        let disks = provider
            .fetch("compute", &RequestSpec::new("list_disks"))
            .await
            .unwrap();
        assert_eq!(disks["items"][0]["name"], "d1");

        let err = provider
            .invoke("compute", &RequestSpec::new("delete_disk"))
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("409"));
    }

    #[tokio::test]
    async fn test_missing_fetch_fixture_errors() {
        let provider = FixtureProvider::new();
        assert!(provider
            .fetch("compute", &RequestSpec::new("list_instances"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unscripted_invoke_returns_operation() {
        let provider = FixtureProvider::new();
        let result = provider
            .invoke("compute", &RequestSpec::new("stop_instance"))
            .await
            .unwrap();
        assert!(result["name"].as_str().unwrap().starts_with("operation-"));
        assert_eq!(provider.calls().len(), 1);
        assert!(provider.calls()[0].mutating);
    }

    #[tokio::test]
    async fn test_handler_sees_request() {
        let provider = FixtureProvider::new().with_handler("monitoring", "get_metric_statistics", |req| {
            Ok(json!({"echo": req.param_str("metric")}))
        });
        let mut req = RequestSpec::new("get_metric_statistics");
        req.set_param("metric", json!("cpu"));
        let result = provider.fetch("monitoring", &req).await.unwrap();
        assert_eq!(result["echo"], "cpu");
    }
}
