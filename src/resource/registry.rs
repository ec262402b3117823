//! Resource Registry - Load resource definitions from JSON
//!
//! Resource types are described by JSON files embedded at compile time, plus
//! any user supplied files listed in the engine config. The registry is built
//! once at startup and passed around explicitly.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Embedded resource JSON files (compiled into the binary)
const RESOURCE_FILES: &[(&str, &str)] = &[
    ("compute.json", include_str!("../resources/compute.json")),
    ("storage.json", include_str!("../resources/storage.json")),
];

/// Implicit state filter applied before an action runs
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AttrFilter {
    pub attr: String,
    pub values: Vec<Value>,
}

/// Action definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct ActionDef {
    /// Key used as `type` in policies
    pub key: String,
    pub display_name: String,
    pub sdk_method: String,
    /// Parameter name for the resource ID
    #[serde(default = "default_id_param")]
    pub id_param: String,
    /// Static parameters merged into every request
    #[serde(default)]
    pub params: Value,
    /// Request parameters copied from resource attributes (param -> attribute path)
    #[serde(default)]
    pub resource_params: BTreeMap<String, String>,
    #[serde(default)]
    pub attr_filter: Option<AttrFilter>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Field of the call result copied onto the resource
    #[serde(default)]
    pub result_key: Option<String>,
    /// Annotation key receiving `result_key`
    #[serde(default)]
    pub annotation_key: Option<String>,
    /// Provider error codes that are logged and skipped
    #[serde(default)]
    pub ignore_error_codes: Vec<String>,
}

fn default_id_param() -> String {
    "name".to_string()
}

/// Metrics wiring for a resource type
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsDef {
    /// Provider service answering metric queries
    #[serde(default = "default_metrics_service")]
    pub service: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Resource attribute holding the dimension value
    pub dimension: String,
    /// Dimension name sent to the provider, defaults to `dimension`
    #[serde(default)]
    pub dimension_name: Option<String>,
    /// Where datapoints live in the metric response
    #[serde(default = "default_datapoints_path")]
    pub datapoints_path: String,
}

fn default_metrics_service() -> String {
    "monitoring".to_string()
}

fn default_datapoints_path() -> String {
    "Datapoints".to_string()
}

impl MetricsDef {
    pub fn dimension_name(&self) -> &str {
        self.dimension_name.as_deref().unwrap_or(&self.dimension)
    }
}

/// Field names for one rule direction
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectionFields {
    #[serde(default)]
    pub cidr_v4: Option<String>,
    #[serde(default)]
    pub cidr_v6: Option<String>,
    #[serde(default)]
    pub group_ref: Option<String>,
    #[serde(default)]
    pub group_owner: Option<String>,
}

/// Field driven rule layout covering the common "group with nested rule
/// list" shape. Only field names differ between providers.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldLayout {
    /// Path to the rule list on the resource
    pub ip_permissions_key: String,
    /// Separate list for egress rules; otherwise `direction_field` splits one list
    #[serde(default)]
    pub egress_permissions_key: Option<String>,
    #[serde(default)]
    pub direction_field: Option<String>,
    #[serde(default = "default_ingress")]
    pub ingress_value: String,
    #[serde(default = "default_egress")]
    pub egress_value: String,
    pub protocol_field: String,
    /// Port expression ("22", "22/22", "80-443", "22,80", "ALL") or the lower bound
    pub port_field: String,
    /// Upper bound field when ports are split over two numeric fields
    #[serde(default)]
    pub port_to_field: Option<String>,
    #[serde(default)]
    pub action_field: Option<String>,
    #[serde(default = "default_accept_values")]
    pub accept_values: Vec<String>,
    #[serde(default)]
    pub description_field: Option<String>,
    #[serde(default)]
    pub priority_field: Option<String>,
    /// Resource attribute holding the owner id used for group reference matching
    #[serde(default)]
    pub owner_field: Option<String>,
    #[serde(default)]
    pub ingress: DirectionFields,
    #[serde(default)]
    pub egress: DirectionFields,
}

fn default_ingress() -> String {
    "ingress".to_string()
}

fn default_egress() -> String {
    "egress".to_string()
}

fn default_accept_values() -> Vec<String> {
    vec!["accept".to_string()]
}

/// How permission rules are read off a resource
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "adapter", rename_all = "kebab-case")]
pub enum PermissionLayout {
    Fields(FieldLayout),
    GcpFirewall,
}

/// Resource definition from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceDef {
    pub display_name: String,
    pub service: String,
    pub sdk_method: String,
    #[serde(default)]
    pub sdk_method_params: Value,
    /// Path of the record list inside the response envelope
    pub response_path: String,
    pub id_field: String,
    pub name_field: String,
    /// Attribute used by age filters
    #[serde(default)]
    pub date_field: Option<String>,
    /// Hours added to naive provider timestamps
    #[serde(default)]
    pub clock_offset_hours: i64,
    #[serde(default)]
    pub metrics: Option<MetricsDef>,
    #[serde(default)]
    pub permissions: Option<PermissionLayout>,
    /// SDK method to call when fetching details for a single resource
    #[serde(default)]
    pub detail_sdk_method: Option<String>,
    /// Parameters for detail_sdk_method
    #[serde(default)]
    pub detail_sdk_method_params: Value,
    #[serde(default = "default_id_param")]
    pub detail_id_param: String,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

impl ResourceDef {
    pub fn get_action(&self, key: &str) -> Option<&ActionDef> {
        self.actions.iter().find(|a| a.key == key)
    }
}

/// Root structure of resources/*.json
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResourceConfig {
    #[serde(default)]
    pub resources: HashMap<String, ResourceDef>,
}

/// Resource type lookup table
#[derive(Debug, Clone, Default)]
pub struct Registry {
    resources: HashMap<String, ResourceDef>,
}

impl Registry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the embedded definitions
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::empty();
        for (file, content) in RESOURCE_FILES {
            registry
                .merge_str(content)
                .with_context(|| format!("Failed to parse embedded resource file {}", file))?;
        }
        Ok(registry)
    }

    /// Merge definitions from JSON text; later definitions win
    pub fn merge_str(&mut self, content: &str) -> Result<usize> {
        let partial: ResourceConfig =
            serde_json::from_str(content).context("Invalid resource definition JSON")?;
        let count = partial.resources.len();
        self.resources.extend(partial.resources);
        Ok(count)
    }

    /// Merge definitions from a file on disk
    pub fn merge_file(&mut self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read resource file {:?}", path))?;
        let count = self.merge_str(&content)?;
        tracing::info!("Loaded {} resource definitions from {:?}", count, path);
        Ok(count)
    }

    pub fn insert(&mut self, key: &str, def: ResourceDef) {
        self.resources.insert(key.to_string(), def);
    }

    /// Get a resource definition by key
    pub fn get(&self, key: &str) -> Option<&ResourceDef> {
        self.resources.get(key)
    }

    /// Get all resource keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.resources.keys().map(|s| s.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
