//! Actions - mutating operations applied to the filtered set
//!
//! Every action is data driven: the resource JSON lists the provider method,
//! the id parameter and the implicit state filter, and [`MethodAction`]
//! executes it. The registry is built per resource type before any fetch so
//! a policy naming an unknown action is rejected up front.

pub mod method;

pub use method::MethodAction;

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::resource::{Resource, ResourceDef};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of one action over a resource set
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ActionReport {
    pub action: String,
    /// Resources that passed the implicit state filter
    pub attempted: usize,
    pub succeeded: usize,
    /// Calls that failed with an ignorable error code
    pub ignored: usize,
    /// Resources dropped by the implicit state filter
    pub implicitly_filtered: usize,
    /// Ids of resources the call succeeded for
    pub resource_ids: Vec<String>,
}

#[async_trait]
pub trait Action: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Apply the action, annotating resources in place
    async fn process(&self, run: &RunContext, resources: &mut [Resource]) -> Result<ActionReport>;
}

/// Actions available for one resource type, keyed by policy `type`
pub struct ActionRegistry {
    service: String,
    actions: BTreeMap<String, crate::resource::ActionDef>,
}

impl ActionRegistry {
    pub fn for_resource(resource_def: &ResourceDef) -> Self {
        Self {
            service: resource_def.service.clone(),
            actions: resource_def
                .actions
                .iter()
                .map(|a| (a.key.clone(), a.clone()))
                .collect(),
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        self.actions.keys().map(|k| k.as_str()).collect()
    }

    /// Build an action from a policy entry: a bare string or `{type: ...}`
    pub fn build(&self, spec: &Value) -> Result<Box<dyn Action>> {
        let (name, options) = match spec {
            Value::String(name) => (name.clone(), Map::new()),
            Value::Object(map) => {
                let name = map
                    .get("type")
                    .and_then(|t| t.as_str())
                    .ok_or_else(|| EngineError::invalid_action("<unnamed>", "missing type"))?;
                (name.to_string(), map.clone())
            }
            other => {
                return Err(EngineError::invalid_action(
                    &other.to_string(),
                    "expected a string or a mapping",
                ))
            }
        };

        let def = self.actions.get(&name).ok_or_else(|| {
            EngineError::invalid_action(
                &name,
                format!("not available here (known: {})", self.keys().join(", ")),
            )
        })?;

        Ok(Box::new(MethodAction::from_spec(&self.service, def, &options)?))
    }

    pub fn build_all(&self, specs: &[Value]) -> Result<Vec<Box<dyn Action>>> {
        specs.iter().map(|spec| self.build(spec)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Registry;
    use serde_json::json;

    fn instances() -> ActionRegistry {
        let registry = Registry::builtin().unwrap();
        ActionRegistry::for_resource(registry.get("compute-instances").unwrap())
    }

    #[test]
    fn test_build_from_string_and_mapping() {
        let registry = instances();
        assert_eq!(registry.build(&json!("stop")).unwrap().name(), "stop");
        assert_eq!(registry.build(&json!({"type": "start"})).unwrap().name(), "start");
    }

    #[test]
    fn test_unknown_action_lists_known_keys() {
        let err = instances().build(&json!({"type": "snapshot"})).unwrap_err();
        assert!(err.is_validation());
        let message = err.to_string();
        assert!(message.contains("snapshot"));
        assert!(message.contains("stop"));
    }

    #[test]
    fn test_rejects_unknown_options() {
        let err = instances()
            .build(&json!({"type": "stop", "force": true}))
            .unwrap_err();
        assert!(err.to_string().contains("force"));
    }

    #[test]
    fn test_build_all_fails_on_first_invalid() {
        let specs = vec![json!("stop"), json!(42)];
        assert!(instances().build_all(&specs).is_err());
    }
}
