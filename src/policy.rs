//! Policies
//!
//! A policy names a resource type, an ordered filter list and an ordered
//! action list:
//!
//! ```yaml
//! policies:
//!   - name: stop-idle-vms
//!     resource: compute-instances
//!     filters:
//!       - status: RUNNING
//!       - type: metrics
//!         name: compute.googleapis.com/instance/cpu/utilization
//!         days: 7
//!         value: 0.05
//!     actions:
//!       - stop
//! ```
//!
//! Every policy in a file is validated before any resource is fetched.

use crate::actions::{Action, ActionRegistry, ActionReport};
use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::filters::{FilterChain, FilterContext, FilterRegistry};
use crate::resource::{Registry, ResourceQueryManager};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// One policy as written in YAML
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySpec {
    pub name: String,
    pub resource: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub filters: Vec<Value>,
    #[serde(default)]
    pub actions: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    policies: Vec<PolicySpec>,
}

/// Parse a policy file without validating filters or actions
pub fn parse_policies(content: &str) -> Result<Vec<PolicySpec>> {
    let file: PolicyFile = serde_yaml::from_str(content)
        .map_err(|e| EngineError::invalid_policy("<file>", e.to_string()))?;

    let mut names = HashSet::new();
    for spec in &file.policies {
        if spec.name.trim().is_empty() {
            return Err(EngineError::invalid_policy("<unnamed>", "name must not be empty"));
        }
        if !names.insert(spec.name.as_str()) {
            return Err(EngineError::invalid_policy(&spec.name, "duplicate policy name"));
        }
    }
    Ok(file.policies)
}

/// A validated policy, ready to run
#[derive(Debug)]
pub struct Policy {
    spec: PolicySpec,
    chain: FilterChain,
    actions: Vec<Box<dyn Action>>,
}

impl Policy {
    /// Build the filter chain and actions, rejecting the policy on any schema error
    pub fn load(spec: PolicySpec, resources: &Registry, filters: &FilterRegistry) -> Result<Self> {
        let resource_def = resources.get(&spec.resource).ok_or_else(|| {
            EngineError::invalid_policy(
                &spec.name,
                format!("unknown resource type: {}", spec.resource),
            )
        })?;

        let chain = filters.build_chain(resource_def, &spec.filters)?;
        let actions = ActionRegistry::for_resource(resource_def).build_all(&spec.actions)?;

        Ok(Self { spec, chain, actions })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn resource_type(&self) -> &str {
        &self.spec.resource
    }

    pub fn spec(&self) -> &PolicySpec {
        &self.spec
    }

    pub fn filter_kinds(&self) -> Vec<&str> {
        self.chain.kinds()
    }

    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    /// Fetch, filter, then act. Actions are skipped on a dry run.
    pub async fn run(
        &self,
        run: &RunContext,
        manager: Arc<ResourceQueryManager>,
        dry_run: bool,
    ) -> Result<PolicyReport> {
        let started = Instant::now();
        let mut report = PolicyReport::new(&self.spec, dry_run);
        tracing::info!(policy = %self.spec.name, resource = %self.spec.resource, run_id = %report.run_id, "Running policy");

        let ctx = FilterContext::new(run.clone(), manager.clone(), &self.spec.resource)?;
        let fetched = manager.fetch(run, &self.spec.resource).await?;
        report.fetched = fetched.len();

        let mut matched = self.chain.apply(&ctx, fetched).await?;
        report.matched = matched.len();
        report.matched_ids = matched.iter().map(|r| r.id()).collect();
        tracing::info!(policy = %self.spec.name, fetched = report.fetched, matched = report.matched, "Filters applied");

        if dry_run {
            if !self.actions.is_empty() {
                tracing::info!(policy = %self.spec.name, "Dry run, skipping {} actions", self.actions.len());
            }
        } else {
            for action in &self.actions {
                run.check_cancelled()?;
                let outcome = action.process(run, &mut matched).await?;
                report.actions.push(outcome);
            }
        }

        report.resources = matched.into_iter().map(|r| r.into_value()).collect();
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }
}

/// Result of one policy run
#[derive(Debug, Clone, Serialize)]
pub struct PolicyReport {
    pub run_id: String,
    pub policy: String,
    pub resource: String,
    pub started_at: String,
    pub dry_run: bool,
    pub fetched: usize,
    pub matched: usize,
    pub matched_ids: Vec<String>,
    pub actions: Vec<ActionReport>,
    /// Matched resources including annotations
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Value>,
    pub duration_ms: u64,
}

impl PolicyReport {
    fn new(spec: &PolicySpec, dry_run: bool) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            policy: spec.name.clone(),
            resource: spec.resource.clone(),
            started_at: Utc::now().to_rfc3339(),
            dry_run,
            fetched: 0,
            matched: 0,
            matched_ids: Vec::new(),
            actions: Vec::new(),
            resources: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Validates and runs a set of policies against one provider
pub struct PolicyRunner {
    resources: Arc<Registry>,
    filters: FilterRegistry,
}

impl PolicyRunner {
    pub fn new(resources: Arc<Registry>, filters: FilterRegistry) -> Self {
        Self { resources, filters }
    }

    /// Validate every policy in `content`; nothing is fetched
    pub fn load_str(&self, content: &str) -> Result<Vec<Policy>> {
        parse_policies(content)?
            .into_iter()
            .map(|spec| Policy::load(spec, &self.resources, &self.filters))
            .collect()
    }

    pub fn load_file(&self, path: &Path) -> anyhow::Result<Vec<Policy>> {
        use anyhow::Context;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {:?}", path))?;
        Ok(self.load_str(&content)?)
    }

    /// Run policies in order, sharing one query manager so reference
    /// listings are fetched once per run
    pub async fn run_all(
        &self,
        run: &RunContext,
        policies: &[Policy],
        dry_run: bool,
    ) -> Result<Vec<PolicyReport>> {
        let manager = Arc::new(ResourceQueryManager::new(self.resources.clone()));
        let mut reports = Vec::with_capacity(policies.len());
        for policy in policies {
            run.check_cancelled()?;
            reports.push(policy.run(run, manager.clone(), dry_run).await?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::provider::FixtureProvider;
    use serde_json::json;

    fn runner() -> PolicyRunner {
        PolicyRunner::new(Arc::new(Registry::builtin().unwrap()), FilterRegistry::builtin())
    }

    const STOP_RUNNING: &str = r#"
policies:
  - name: stop-dev
    resource: compute-instances
    filters:
      - status: RUNNING
      - tag:env: dev
    actions:
      - stop
"#;

    fn instances() -> FixtureProvider {
        FixtureProvider::new().with_response(
            "compute",
            "list_instances",
            json!({"items": [
                {"name": "a", "status": "RUNNING", "labels": {"env": "dev"}},
                {"name": "b", "status": "RUNNING", "labels": {"env": "prod"}},
                {"name": "c", "status": "TERMINATED", "labels": {"env": "dev"}}
            ]}),
        )
    }

    #[test]
    fn test_parse_rejects_duplicates_and_unknown_fields() {
        let dup = "policies:\n  - {name: a, resource: compute-instances}\n  - {name: a, resource: compute-disks}\n";
        assert!(parse_policies(dup).unwrap_err().to_string().contains("duplicate"));

        let extra = "policies:\n  - {name: a, resource: compute-instances, mode: pull}\n";
        assert!(parse_policies(extra).unwrap_err().is_validation());
    }

    #[test]
    fn test_load_rejects_bad_filter_before_fetch() {
        let yaml = r#"
policies:
  - name: bad
    resource: compute-instances
    filters:
      - type: value
        key: status
        value: RUNNING
        colour: red
"#;
        let err = runner().load_str(yaml).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn test_load_rejects_unknown_resource_and_action() {
        let yaml = "policies:\n  - {name: a, resource: compute-lakes}\n";
        assert!(runner().load_str(yaml).is_err());

        let yaml = "policies:\n  - {name: a, resource: compute-disks, actions: [stop]}\n";
        assert!(runner().load_str(yaml).unwrap_err().to_string().contains("stop"));
    }

    #[tokio::test]
    async fn test_run_filters_and_acts() {
        let provider = Arc::new(instances());
        let run = RunContext::new(provider.clone(), EngineConfig::default());
        let runner = runner();
        let policies = runner.load_str(STOP_RUNNING).unwrap();

        let reports = runner.run_all(&run, &policies, false).await.unwrap();
        let report = &reports[0];
        assert_eq!(report.fetched, 3);
        assert_eq!(report.matched_ids, vec!["a"]);
        assert_eq!(report.actions[0].succeeded, 1);
        assert_eq!(provider.call_count("compute", "stop_instance"), 1);
        assert!(report.resources[0].get("resfilter:operation").is_some());
    }

    #[tokio::test]
    async fn test_dry_run_skips_actions() {
        let provider = Arc::new(instances());
        let run = RunContext::new(provider.clone(), EngineConfig::default());
        let runner = runner();
        let policies = runner.load_str(STOP_RUNNING).unwrap();

        let reports = runner.run_all(&run, &policies, true).await.unwrap();
        assert!(reports[0].dry_run);
        assert!(reports[0].actions.is_empty());
        assert!(provider.calls().iter().all(|c| !c.mutating));
    }
}
