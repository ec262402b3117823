//! Resource Fetcher
//!
//! Lists resources through the provider and normalizes the response envelope
//! into [`Resource`] records using the definition's `response_path`.

use super::model::{lookup_path, Resource};
use super::registry::{Registry, ResourceDef};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::provider::RequestSpec;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of paginated fetch
pub struct PaginatedResult {
    pub items: Vec<Resource>,
    pub next_token: Option<String>,
}

/// Fetches and caches resources per resource type
pub struct ResourceQueryManager {
    registry: Arc<Registry>,
    /// Full listings kept for reference lookups within one run
    listings: Mutex<HashMap<String, Arc<Vec<Resource>>>>,
}

impl ResourceQueryManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            listings: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resource_def(&self, resource_key: &str) -> Result<&ResourceDef> {
        self.registry.get(resource_key).ok_or_else(|| {
            EngineError::invalid_policy(resource_key, format!("unknown resource type: {}", resource_key))
        })
    }

    /// Fetch all resources (auto-paginate)
    pub async fn fetch(&self, ctx: &RunContext, resource_key: &str) -> Result<Vec<Resource>> {
        let mut all_items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut seen_tokens = HashSet::new();

        loop {
            let result = self
                .fetch_page(ctx, resource_key, page_token.as_deref())
                .await?;
            all_items.extend(result.items);

            match result.next_token {
                Some(token) if seen_tokens.insert(token.clone()) => page_token = Some(token),
                Some(token) => {
                    tracing::warn!("Page token {} repeated for {}, stopping", token, resource_key);
                    break;
                }
                None => break,
            }
        }

        tracing::info!("Fetched {} {}", all_items.len(), resource_key);
        Ok(all_items)
    }

    /// Fetch one page of resources
    pub async fn fetch_page(
        &self,
        ctx: &RunContext,
        resource_key: &str,
        page_token: Option<&str>,
    ) -> Result<PaginatedResult> {
        let resource_def = self.resource_def(resource_key)?;

        let mut request = RequestSpec::with_params(
            &resource_def.sdk_method,
            resource_def.sdk_method_params.clone(),
        );
        if let Some(token) = page_token {
            request.set_param("pageToken", Value::String(token.to_string()));
        }

        let response = ctx
            .fetch(&resource_def.service, &request)
            .await
            .map_err(|e| {
                e.into_engine(|source| EngineError::Fetch {
                    resource: resource_key.to_string(),
                    source,
                })
            })?;

        let items = extract_items(&response, &resource_def.response_path, &resource_def.id_field);

        let next_token = response
            .get("nextPageToken")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        Ok(PaginatedResult { items, next_token })
    }

    /// Resources of `resource_key` whose id is in `ids`.
    ///
    /// The full listing is fetched once per manager and reused.
    pub async fn get_resources(
        &self,
        ctx: &RunContext,
        resource_key: &str,
        ids: &[String],
    ) -> Result<Vec<Resource>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let listing = {
            let mut listings = self.listings.lock().await;
            match listings.get(resource_key) {
                Some(listing) => listing.clone(),
                None => {
                    let fetched = Arc::new(self.fetch(ctx, resource_key).await?);
                    listings.insert(resource_key.to_string(), fetched.clone());
                    fetched
                }
            }
        };

        Ok(listing
            .iter()
            .filter(|r| ids.iter().any(|id| *id == r.id()))
            .cloned()
            .collect())
    }
}

/// Call `detail_sdk_method` for one resource. `None` when the type has none.
pub async fn describe_resource(
    ctx: &RunContext,
    resource_def: &ResourceDef,
    resource_id: &str,
) -> Result<Option<Value>> {
    let Some(method) = resource_def.detail_sdk_method.as_deref() else {
        return Ok(None);
    };

    let mut request = RequestSpec::with_params(method, resource_def.detail_sdk_method_params.clone());
    request.set_param(&resource_def.detail_id_param, Value::String(resource_id.to_string()));

    let detail = ctx
        .fetch(&resource_def.service, &request)
        .await
        .map_err(|e| {
            e.into_engine(|source| EngineError::Fetch {
                resource: format!("{} {}", resource_def.display_name, resource_id),
                source,
            })
        })?;

    Ok(Some(detail))
}

/// Extract items from response using the response_path
pub fn extract_items(response: &Value, path: &str, id_field: &str) -> Vec<Resource> {
    let raw_items = match lookup_path(response, path) {
        Some(Value::Array(arr)) => arr.clone(),
        _ => vec![],
    };

    raw_items
        .into_iter()
        .filter_map(|item| {
            let resource = Resource::from_value(id_field, item);
            if resource.is_none() {
                tracing::debug!("Skipping non-object record at {}", path);
            }
            resource
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::provider::FixtureProvider;
    use serde_json::json;

    fn context(provider: FixtureProvider) -> RunContext {
        RunContext::new(Arc::new(provider), EngineConfig::default())
    }

    fn manager() -> ResourceQueryManager {
        ResourceQueryManager::new(Arc::new(Registry::builtin().unwrap()))
    }

    #[test]
    fn test_extract_items_nested_path() {
        let response = json!({"Disks": {"Disk": [{"DiskId": "d-1"}, {"DiskId": "d-2"}, "junk"]}});
        let items = extract_items(&response, "Disks.Disk", "DiskId");
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].id(), "d-2");
    }

    #[test]
    fn test_extract_items_empty_path_is_root_list() {
        let response = json!([{"id": "a"}]);
        assert_eq!(extract_items(&response, "", "id").len(), 1);
        assert!(extract_items(&json!({"items": {}}), "items", "id").is_empty());
    }

    #[tokio::test]
    async fn test_fetch_follows_pages() {
        let provider = FixtureProvider::new()
            .with_pages(
                "compute",
                "list_instances",
                vec![
                    json!({"items": [{"name": "vm-1"}], "nextPageToken": "p2"}),
                    json!({"items": [{"name": "vm-2"}]}),
                ],
            );
        let ctx = context(provider);
        let resources = manager().fetch(&ctx, "compute-instances").await.unwrap();
        let names: Vec<String> = resources.iter().map(|r| r.id()).collect();
        assert_eq!(names, vec!["vm-1", "vm-2"]);
    }

    #[tokio::test]
    async fn test_fetch_error_is_fatal() {
        let provider = FixtureProvider::new().with_error(
            "compute",
            "list_instances",
            crate::error::ProviderError::with_code("403", "denied"),
        );
        let ctx = context(provider);
        let err = manager().fetch(&ctx, "compute-instances").await.unwrap_err();
        assert!(matches!(err, EngineError::Fetch { .. }));
        assert!(err.to_string().contains("denied"));
    }

    #[tokio::test]
    async fn test_unknown_resource_is_validation_error() {
        let ctx = context(FixtureProvider::new());
        let err = manager().fetch(&ctx, "no-such-thing").await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_get_resources_lists_once() {
        let provider = Arc::new(FixtureProvider::new().with_response(
            "compute",
            "list_firewalls",
            json!({"items": [{"name": "fw-a"}, {"name": "fw-b"}, {"name": "fw-c"}]}),
        ));
        let ctx = RunContext::new(provider.clone(), EngineConfig::default());
        let manager = manager();

        let first = manager
            .get_resources(&ctx, "compute-firewalls", &["fw-a".to_string(), "fw-c".to_string()])
            .await
            .unwrap();
        let second = manager
            .get_resources(&ctx, "compute-firewalls", &["fw-b".to_string()])
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second[0].id(), "fw-b");
        assert_eq!(provider.call_count("compute", "list_firewalls"), 1);
    }
}
